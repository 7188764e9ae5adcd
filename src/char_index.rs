//! The Character Index: one record per atomic character unit or line
//! break, ordered by ascending XML offset and ascending derived-text
//! offset, terminated by a trailing total-record count.
//!
//! Two interchangeable serializations carry the same logical fields: a
//! binary form (NUL-terminated strings, fixed-width integers) and a
//! tab-separated text form with `%%` comment lines.

use crate::error::PipelineError;
use crate::escape::{index_escape, index_unescape};
use anyhow::Result;
use std::io::{self, Write};

/// Identifier written for atomic units without an `xml:id`.
pub const NIL_ID: &str = "-";

/// Pseudo-identifier written for synthesized line-break records.
pub const LB_ID: &str = "$LB$";

/// Magic prefix of the binary serialization.
pub const CX_MAGIC: &[u8] = b"tokweave-cx\n";

/// Binary format version.
pub const CX_VERSION: u32 = 1;

/// Upper bound on an atomic unit's literal text, in bytes. The
/// derived-text length field is a single byte; well-formed atomic units
/// are always short.
pub const MAX_TEXT_LEN: usize = 255;

/// Upper bound on an atomic unit's XML span, in bytes (single-byte
/// length field).
pub const MAX_UNIT_XML_LEN: usize = 255;

/// Upper bound on a character identifier, in bytes.
pub const MAX_CHAR_ID_LEN: usize = 255;

const MAGIC_FIELD_LEN: usize = 32;

/// Serialization variant for the Character Index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CxFormat {
    Binary,
    Text,
}

/// What an index record stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharKind {
    /// An atomic character unit (`<c>`).
    Char,
    /// A synthesized line-break record (`<lb>`), text `"\n"`.
    LineBreak,
}

/// One persisted record of the Character Index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharRecord {
    /// Explicit identifier; `None` for unidentified units and for
    /// line-break records.
    pub id: Option<String>,
    pub kind: CharKind,
    /// Byte offset of the unit's element in the source XML.
    pub xml_off: u64,
    /// Byte length of the unit's element in the source XML.
    pub xml_len: u8,
    /// Byte offset of the unit's text in the derived-text stream.
    pub txt_off: u64,
    /// Byte length of the unit's text in the derived-text stream.
    pub txt_len: u8,
    /// Literal text content.
    pub text: String,
}

impl CharRecord {
    /// Identifier as serialized: the `-` sentinel for missing ids, the
    /// `$LB$` sentinel for line breaks.
    pub fn wire_id(&self) -> &str {
        match self.kind {
            CharKind::LineBreak => LB_ID,
            CharKind::Char => self.id.as_deref().unwrap_or(NIL_ID),
        }
    }

    /// Identifier for merge-time consistency checks. Sentinels (and any
    /// `$`-prefixed pseudo-id) compare as absent.
    pub fn merge_id(&self) -> Option<&str> {
        match self.kind {
            CharKind::LineBreak => None,
            CharKind::Char => self
                .id
                .as_deref()
                .filter(|id| *id != NIL_ID && !id.starts_with('$')),
        }
    }

    /// End of the record's XML span (exclusive).
    pub fn xml_end(&self) -> u64 {
        self.xml_off + u64::from(self.xml_len)
    }

    /// End of the record's derived-text span (exclusive).
    pub fn txt_end(&self) -> u64 {
        self.txt_off + u64::from(self.txt_len)
    }
}

/// Incremental writer for either Character Index serialization: header,
/// then one record at a time, then the terminator count.
pub struct CxWriter<W: Write> {
    w: W,
    format: CxFormat,
    count: u64,
}

impl<W: Write> CxWriter<W> {
    /// Write the header and return the writer. For the text format,
    /// `comments` controls the explanatory header block and `colnames`
    /// the column-name line.
    pub fn new(mut w: W, format: CxFormat, comments: bool, colnames: bool) -> io::Result<Self> {
        match format {
            CxFormat::Binary => {
                let mut magic = [0u8; MAGIC_FIELD_LEN];
                magic[..CX_MAGIC.len()].copy_from_slice(CX_MAGIC);
                w.write_all(&magic)?;
                w.write_all(&CX_VERSION.to_le_bytes())?;
            }
            CxFormat::Text => {
                if comments {
                    writeln!(
                        w,
                        "%% atomic-character index generated by tokweave {}",
                        env!("CARGO_PKG_VERSION")
                    )?;
                    writeln!(
                        w,
                        "%%======================================================================"
                    )?;
                }
                if colnames {
                    writeln!(
                        w,
                        "{}$ID$\t$XML_OFFSET$\t$XML_LENGTH$\t$TXT_OFFSET$\t$TXT_LEN$\t$TEXT$",
                        if comments { "%% " } else { "" }
                    )?;
                }
            }
        }
        Ok(Self { w, format, count: 0 })
    }

    pub fn write_record(&mut self, rec: &CharRecord) -> io::Result<()> {
        match self.format {
            CxFormat::Binary => {
                self.w.write_all(rec.wire_id().as_bytes())?;
                self.w.write_all(&[0])?;
                self.w.write_all(&rec.xml_off.to_le_bytes())?;
                self.w.write_all(&[rec.xml_len])?;
                self.w.write_all(&rec.txt_off.to_le_bytes())?;
                self.w.write_all(&[rec.txt_len])?;
                self.w.write_all(rec.text.as_bytes())?;
                self.w.write_all(&[0])?;
            }
            CxFormat::Text => {
                writeln!(
                    self.w,
                    "{}\t{}\t{}\t{}\t{}\t{}",
                    rec.wire_id(),
                    rec.xml_off,
                    rec.xml_len,
                    rec.txt_off,
                    rec.txt_len,
                    index_escape(&rec.text)
                )?;
            }
        }
        self.count += 1;
        Ok(())
    }

    /// Write the terminator and return the record count.
    pub fn finish(mut self) -> io::Result<u64> {
        match self.format {
            CxFormat::Binary => self.w.write_all(&self.count.to_le_bytes())?,
            CxFormat::Text => writeln!(self.w, "%% records={}", self.count)?,
        }
        Ok(self.count)
    }
}

/// The loaded Character Index. Construction validates both monotonicity
/// invariants: records are strictly ordered and non-overlapping in XML
/// offset space and in derived-text offset space simultaneously.
#[derive(Debug)]
pub struct CharIndex {
    records: Vec<CharRecord>,
}

impl CharIndex {
    pub fn new(records: Vec<CharRecord>) -> Result<Self, PipelineError> {
        for pair in records.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if b.xml_off < a.xml_end() || b.xml_off <= a.xml_off {
                return Err(PipelineError::CorruptIndex {
                    path: "<records>".into(),
                    message: format!(
                        "xml offsets not strictly ascending: {} then {}",
                        a.xml_off, b.xml_off
                    ),
                });
            }
            if b.txt_off < a.txt_end() {
                return Err(PipelineError::CorruptIndex {
                    path: "<records>".into(),
                    message: format!(
                        "text offsets overlap: {}+{} then {}",
                        a.txt_off, a.txt_len, b.txt_off
                    ),
                });
            }
        }
        Ok(Self { records })
    }

    pub fn records(&self) -> &[CharRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total byte length of the derived-text stream covered by records.
    pub fn text_len(&self) -> u64 {
        self.records.last().map(CharRecord::txt_end).unwrap_or(0)
    }

    /// Concatenation of every record's literal text in index order; by
    /// the round-trip law this reproduces the derived-text stream.
    pub fn derived_text(&self) -> String {
        let mut out = String::with_capacity(self.text_len() as usize);
        for rec in &self.records {
            out.push_str(&rec.text);
        }
        out
    }

    /// Load an index from bytes, sniffing the serialization by the
    /// binary magic. Verifies the terminator count.
    pub fn read(path: &str, bytes: &[u8]) -> Result<Self, PipelineError> {
        if bytes.starts_with(CX_MAGIC) {
            Self::read_binary(path, bytes)
        } else {
            Self::read_text(path, bytes)
        }
    }

    fn read_binary(path: &str, bytes: &[u8]) -> Result<Self, PipelineError> {
        let corrupt = |message: String| PipelineError::CorruptIndex {
            path: path.to_string(),
            message,
        };

        let header_len = MAGIC_FIELD_LEN + 4;
        if bytes.len() < header_len + 8 {
            return Err(corrupt("truncated header".into()));
        }
        let version = u32::from_le_bytes(
            bytes[MAGIC_FIELD_LEN..header_len].try_into().expect("4 bytes"),
        );
        if version != CX_VERSION {
            return Err(corrupt(format!("unsupported format version {version}")));
        }

        let body_end = bytes.len() - 8;
        let mut pos = header_len;
        let mut records = Vec::new();
        while pos < body_end {
            let id = read_cstr(bytes, &mut pos, body_end)
                .ok_or_else(|| corrupt(format!("unterminated id at byte {pos}")))?;
            if pos + 9 > body_end {
                return Err(corrupt(format!("truncated record at byte {pos}")));
            }
            let xml_off = u64::from_le_bytes(bytes[pos..pos + 8].try_into().expect("8 bytes"));
            let xml_len = bytes[pos + 8];
            pos += 9;
            if pos + 9 > body_end {
                return Err(corrupt(format!("truncated record at byte {pos}")));
            }
            let txt_off = u64::from_le_bytes(bytes[pos..pos + 8].try_into().expect("8 bytes"));
            let txt_len = bytes[pos + 8];
            pos += 9;
            let text = read_cstr(bytes, &mut pos, body_end)
                .ok_or_else(|| corrupt(format!("unterminated text at byte {pos}")))?;
            records.push(record_from_wire(id, xml_off, xml_len, txt_off, txt_len, text));
        }

        let declared = u64::from_le_bytes(bytes[body_end..].try_into().expect("8 bytes"));
        if declared != records.len() as u64 {
            return Err(corrupt(format!(
                "terminator count {declared} does not match {} records",
                records.len()
            )));
        }
        Self::new(records).map_err(|e| relabel(e, path))
    }

    fn read_text(path: &str, bytes: &[u8]) -> Result<Self, PipelineError> {
        let corrupt = |message: String| PipelineError::CorruptIndex {
            path: path.to_string(),
            message,
        };

        let content = std::str::from_utf8(bytes)
            .map_err(|e| corrupt(format!("index is not valid UTF-8: {e}")))?;
        let mut records = Vec::new();
        let mut declared: Option<u64> = None;
        for (lineno, line) in content.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix("%%") {
                if let Some(n) = rest.trim().strip_prefix("records=") {
                    declared = n.trim().parse().ok();
                }
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 6 {
                return Err(corrupt(format!(
                    "line {}: expected 6 tab-separated fields, got {}",
                    lineno + 1,
                    fields.len()
                )));
            }
            let parse_num = |s: &str, what: &str| {
                s.parse::<u64>().map_err(|_| {
                    corrupt(format!("line {}: bad {what} `{s}`", lineno + 1))
                })
            };
            let xml_off = parse_num(fields[1], "xml offset")?;
            let xml_len = parse_num(fields[2], "xml length")?;
            let txt_off = parse_num(fields[3], "text offset")?;
            let txt_len = parse_num(fields[4], "text length")?;
            if xml_len > MAX_UNIT_XML_LEN as u64 || txt_len > MAX_TEXT_LEN as u64 {
                return Err(corrupt(format!("line {}: length exceeds one byte", lineno + 1)));
            }
            records.push(record_from_wire(
                fields[0].to_string(),
                xml_off,
                xml_len as u8,
                txt_off,
                txt_len as u8,
                index_unescape(fields[5]),
            ));
        }
        if let Some(declared) = declared {
            if declared != records.len() as u64 {
                return Err(corrupt(format!(
                    "terminator count {declared} does not match {} records",
                    records.len()
                )));
            }
        }
        Self::new(records).map_err(|e| relabel(e, path))
    }

    /// Serialize the whole index in one call.
    pub fn write<W: Write>(&self, w: W, format: CxFormat) -> io::Result<u64> {
        let mut writer = CxWriter::new(w, format, true, true)?;
        for rec in &self.records {
            writer.write_record(rec)?;
        }
        writer.finish()
    }
}

fn record_from_wire(
    id: String,
    xml_off: u64,
    xml_len: u8,
    txt_off: u64,
    txt_len: u8,
    text: String,
) -> CharRecord {
    let (kind, id) = if id == LB_ID {
        (CharKind::LineBreak, None)
    } else if id == NIL_ID {
        (CharKind::Char, None)
    } else {
        (CharKind::Char, Some(id))
    };
    CharRecord { id, kind, xml_off, xml_len, txt_off, txt_len, text }
}

fn read_cstr(bytes: &[u8], pos: &mut usize, end: usize) -> Option<String> {
    let nul = bytes[*pos..end].iter().position(|&b| b == 0)?;
    let s = String::from_utf8_lossy(&bytes[*pos..*pos + nul]).into_owned();
    *pos += nul + 1;
    Some(s)
}

fn relabel(err: PipelineError, path: &str) -> PipelineError {
    match err {
        PipelineError::CorruptIndex { message, .. } => PipelineError::CorruptIndex {
            path: path.to_string(),
            message,
        },
        other => other,
    }
}
