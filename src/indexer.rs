//! Character/Structure Indexer: a single forward streaming scan of the
//! source XML that emits the Character Index, the Structure Index and
//! the derived-text stream in one pass.
//!
//! Atomic `<c>` units and `<lb>` line breaks inside `<text>` become
//! index records; everything else is copied byte-for-byte into the
//! Structure Index, interleaved with location markers that let a later
//! consumer recover the XML-offset/text-offset correspondence at
//! markup-event granularity.

use crate::char_index::{
    CharKind, CharRecord, CxWriter, MAX_CHAR_ID_LEN, MAX_TEXT_LEN, MAX_UNIT_XML_LEN,
};
use crate::error::{malformed_xml, PipelineError};
use anyhow::{Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;
use std::io::Write;
use tracing::info;

/// Element name of an atomic character unit.
pub const CHAR_ELT: &[u8] = b"c";
/// Element name of a line-break marker.
pub const LB_ELT: &[u8] = b"lb";
/// Element name of a content region; units outside it are plain markup.
pub const TEXT_ELT: &[u8] = b"text";

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Keep whitespace-only character data in the Structure Index
    /// instead of eliding it.
    pub keep_ws: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self { keep_ws: false }
    }
}

/// Per-run counters, reported to the log and the optional stats file.
#[derive(Debug, Default, Clone, Serialize)]
pub struct IndexStats {
    pub records: u64,
    pub chars: u64,
    pub line_breaks: u64,
    pub xml_bytes: u64,
    pub text_bytes: u64,
}

/// Scan `src` once, writing the Character Index through `cx`, the
/// Structure Index to `sx` and the derived text to `tx`. Any output may
/// be absent.
pub fn index_document<C, S, T>(
    src: &[u8],
    path: &str,
    cx: Option<CxWriter<C>>,
    sx: Option<&mut S>,
    tx: Option<&mut T>,
    config: &IndexerConfig,
) -> Result<IndexStats>
where
    C: Write,
    S: Write,
    T: Write,
{
    let scan = Scan {
        src,
        path,
        cx,
        sx,
        tx,
        keep_ws: config.keep_ws,
        text_depth: 0,
        depth: 0,
        in_c: false,
        c_id: None,
        c_xoff: 0,
        c_buf: String::new(),
        t_off: 0,
        loc_xoff: 0,
        loc_toff: 0,
        tx_ends_nl: false,
        stats: IndexStats::default(),
    };
    scan.run()
}

struct Scan<'a, C: Write, S: Write, T: Write> {
    src: &'a [u8],
    path: &'a str,
    cx: Option<CxWriter<C>>,
    sx: Option<&'a mut S>,
    tx: Option<&'a mut T>,
    keep_ws: bool,
    /// Number of open `<text>` elements.
    text_depth: usize,
    /// Number of open elements overall; gates location-marker emission.
    depth: usize,
    in_c: bool,
    c_id: Option<String>,
    c_xoff: u64,
    /// Buffered character data of the current atomic unit. Bounded;
    /// copy required because nested elements may interleave the text.
    c_buf: String,
    /// Running derived-text offset.
    t_off: u64,
    loc_xoff: u64,
    loc_toff: u64,
    /// Whether the derived-text stream already ends with a newline.
    tx_ends_nl: bool,
    stats: IndexStats,
}

impl<'a, C: Write, S: Write, T: Write> Scan<'a, C, S, T> {
    fn run(mut self) -> Result<IndexStats> {
        let text = std::str::from_utf8(self.src)
            .map_err(|e| malformed_xml(self.path, self.src, e.valid_up_to(), "invalid UTF-8"))?;
        let mut reader = Reader::from_str(text);

        loop {
            let start = reader.buffer_position() as u64;
            let event = reader
                .read_event()
                .map_err(|e| malformed_xml(self.path, self.src, reader.buffer_position(), e))?;
            let end = reader.buffer_position() as u64;
            match event {
                Event::Start(e) => self.on_start(&e, start, end)?,
                Event::Empty(e) => self.on_empty(&e, start, end)?,
                Event::End(e) => self.on_end(e.name().as_ref(), start, end)?,
                Event::Text(t) => {
                    let decoded = t
                        .unescape()
                        .map_err(|e| malformed_xml(self.path, self.src, start as usize, e))?;
                    self.on_text(&decoded, start, end)?;
                }
                Event::CData(t) => {
                    let decoded = String::from_utf8_lossy(&t).into_owned();
                    self.on_text(&decoded, start, end)?;
                }
                Event::Eof => break,
                // Declarations, comments, processing instructions and
                // doctypes are plain markup for the Structure Index.
                _ => self.sx_markup(start, end)?,
            }
        }

        if !self.tx_ends_nl {
            if let Some(tx) = self.tx.as_mut() {
                tx.write_all(b"\n").context("write failed for text output")?;
            }
        }
        if let Some(cx) = self.cx.take() {
            cx.finish().context("write failed for character-index output")?;
        }
        self.stats.xml_bytes = self.src.len() as u64;
        self.stats.text_bytes = self.t_off;
        info!(
            records = self.stats.records,
            chars = self.stats.chars,
            line_breaks = self.stats.line_breaks,
            xml_bytes = self.stats.xml_bytes,
            text_bytes = self.stats.text_bytes,
            "indexed document"
        );
        Ok(self.stats)
    }

    fn on_start(&mut self, e: &BytesStart, start: u64, end: u64) -> Result<()> {
        let name = e.name();
        if self.text_depth > 0 && name.as_ref() == CHAR_ELT {
            if self.in_c {
                return Err(PipelineError::NestedChar {
                    elt: "c".into(),
                    first: self.c_xoff,
                    second: start,
                }
                .into());
            }
            self.c_id = self.char_id(e, start)?;
            self.c_xoff = start;
            self.c_buf.clear();
            self.in_c = true;
            self.depth += 1;
            return Ok(());
        }
        if self.text_depth > 0 && name.as_ref() == LB_ELT {
            self.put_line_break(start, end)?;
            self.depth += 1;
            return Ok(());
        }
        if name.as_ref() == TEXT_ELT {
            self.text_depth += 1;
        }
        self.sx_markup_at(start, end, self.depth > 0, self.depth > 1)?;
        self.depth += 1;
        Ok(())
    }

    fn on_empty(&mut self, e: &BytesStart, start: u64, end: u64) -> Result<()> {
        let name = e.name();
        if self.text_depth > 0 && name.as_ref() == CHAR_ELT {
            if self.in_c {
                return Err(PipelineError::NestedChar {
                    elt: "c".into(),
                    first: self.c_xoff,
                    second: start,
                }
                .into());
            }
            // An empty atomic unit carries no text but still gets a record.
            let id = self.char_id(e, start)?;
            self.put_char_record(id, start, end, String::new())?;
            return Ok(());
        }
        if self.text_depth > 0 && name.as_ref() == LB_ELT {
            return self.put_line_break(start, end);
        }
        self.sx_markup_at(start, end, self.depth > 0, self.depth > 1)
    }

    fn on_end(&mut self, name: &[u8], start: u64, end: u64) -> Result<()> {
        if self.in_c && name == CHAR_ELT {
            let id = self.c_id.take();
            let text = std::mem::take(&mut self.c_buf);
            self.put_char_record(id, self.c_xoff, end, text)?;
            self.in_c = false;
            self.depth -= 1;
            return Ok(());
        }
        if self.text_depth > 0 && name == LB_ELT {
            self.depth -= 1;
            return Ok(());
        }
        if name == TEXT_ELT && self.text_depth > 0 {
            self.text_depth -= 1;
        }
        self.sx_markup_at(start, end, self.depth > 0, self.depth > 1)?;
        self.depth -= 1;
        Ok(())
    }

    fn on_text(&mut self, decoded: &str, start: u64, end: u64) -> Result<()> {
        if self.in_c {
            if self.c_buf.len() + decoded.len() > MAX_TEXT_LEN {
                return Err(PipelineError::OversizedText {
                    offset: self.c_xoff,
                    limit: MAX_TEXT_LEN,
                }
                .into());
            }
            self.c_buf.push_str(decoded);
            return Ok(());
        }
        let raw = &self.src[start as usize..end as usize];
        if !self.keep_ws && raw.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(());
        }
        // Character data carries no location markers of its own; the
        // next markup event's marker covers the span.
        if let Some(sx) = self.sx.as_mut() {
            sx.write_all(raw).context("write failed for structure-index output")?;
        }
        Ok(())
    }

    fn char_id(&self, e: &BytesStart, at: u64) -> Result<Option<String>> {
        let attr = e
            .try_get_attribute("xml:id")
            .map_err(|err| malformed_xml(self.path, self.src, at as usize, err))?;
        match attr {
            None => Ok(None),
            Some(attr) => {
                let value = attr
                    .unescape_value()
                    .map_err(|err| malformed_xml(self.path, self.src, at as usize, err))?;
                if value.len() > MAX_CHAR_ID_LEN {
                    return Err(PipelineError::OversizedId {
                        id: value.into_owned(),
                        limit: MAX_CHAR_ID_LEN,
                    }
                    .into());
                }
                Ok(Some(value.into_owned()))
            }
        }
    }

    fn put_char_record(&mut self, id: Option<String>, xml_off: u64, xml_end: u64, text: String) -> Result<()> {
        let xml_len = self.unit_len(xml_off, xml_end)?;
        let rec = CharRecord {
            id,
            kind: CharKind::Char,
            xml_off,
            xml_len,
            txt_off: self.t_off,
            txt_len: text.len() as u8,
            text,
        };
        self.emit(rec)?;
        self.stats.chars += 1;
        Ok(())
    }

    fn put_line_break(&mut self, xml_off: u64, xml_end: u64) -> Result<()> {
        let xml_len = self.unit_len(xml_off, xml_end)?;
        let rec = CharRecord {
            id: None,
            kind: CharKind::LineBreak,
            xml_off,
            xml_len,
            txt_off: self.t_off,
            txt_len: 1,
            text: "\n".into(),
        };
        self.emit(rec)?;
        self.stats.line_breaks += 1;
        Ok(())
    }

    fn emit(&mut self, rec: CharRecord) -> Result<()> {
        if let Some(cx) = self.cx.as_mut() {
            cx.write_record(&rec)
                .context("write failed for character-index output")?;
        }
        if let Some(tx) = self.tx.as_mut() {
            tx.write_all(rec.text.as_bytes())
                .context("write failed for text output")?;
        }
        if !rec.text.is_empty() {
            self.tx_ends_nl = rec.text.ends_with('\n');
        }
        self.t_off += u64::from(rec.txt_len);
        self.stats.records += 1;
        Ok(())
    }

    fn unit_len(&self, start: u64, end: u64) -> Result<u8> {
        let len = end - start;
        if len > MAX_UNIT_XML_LEN as u64 {
            return Err(PipelineError::OversizedUnit {
                offset: start,
                len,
                limit: MAX_UNIT_XML_LEN,
            }
            .into());
        }
        Ok(len as u8)
    }

    fn sx_markup(&mut self, start: u64, end: u64) -> Result<()> {
        self.sx_markup_at(start, end, self.depth > 0, self.depth > 1)
    }

    /// Copy a markup event into the Structure Index, bracketed by
    /// location markers when its position moved past the last marker.
    fn sx_markup_at(&mut self, start: u64, end: u64, pre: bool, post: bool) -> Result<()> {
        let cur_toff = self.t_off + self.c_buf.len() as u64;
        let src = self.src;
        let Some(sx) = self.sx.as_mut() else {
            return Ok(());
        };
        if pre && start != self.loc_xoff {
            write!(
                sx,
                "<c n=\"{} {} {} {}\"/>",
                self.loc_xoff,
                start - self.loc_xoff,
                self.loc_toff,
                cur_toff - self.loc_toff
            )
            .context("write failed for structure-index output")?;
            self.loc_xoff = start;
            self.loc_toff = cur_toff;
        }
        sx.write_all(&src[start as usize..end as usize])
            .context("write failed for structure-index output")?;
        if post && end != self.loc_xoff {
            write!(
                sx,
                "<c n=\"{} {} {} {}\"/>",
                self.loc_xoff,
                end - self.loc_xoff,
                self.loc_toff,
                cur_toff - self.loc_toff
            )
            .context("write failed for structure-index output")?;
            self.loc_xoff = end;
            self.loc_toff = cur_toff;
        }
        Ok(())
    }
}
