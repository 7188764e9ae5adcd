//! Alignment merge: re-walk the source XML in document order, copy every
//! original byte through unchanged, and insert sentence/token boundary
//! markup around the atomic character units according to the annotation
//! array. Tokens or sentences that are discontinuous in document order
//! come out as several `part`-marked segments with back-references.

use crate::char_index::{CharIndex, CharRecord};
use crate::error::{line_col, malformed_xml, PipelineError};
use crate::escape::xml_escape_attr;
use crate::indexer::{CHAR_ELT, LB_ELT, TEXT_ELT};
use crate::tokens::{CharAnnotation, TokenData};
use anyhow::{Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;
use std::fmt::Write as _;
use std::io::Write;
use tracing::{info, warn};

/// Prefix of back-reference attribute values on continuation segments.
pub const REF_PREFIX: &str = "#";

/// Output vocabulary for the inserted boundary markup.
#[derive(Debug, Clone)]
pub struct MergeFormat {
    pub sentence_elt: String,
    pub token_elt: String,
    /// Back-reference attribute on continuation segments.
    pub ref_attr: String,
}

impl Default for MergeFormat {
    fn default() -> Self {
        Self {
            sentence_elt: "s".into(),
            token_elt: "w".into(),
            ref_attr: "n".into(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct MergeStats {
    /// Atomic units seen in the document walk.
    pub records: u64,
    pub sentence_segs: u64,
    pub token_segs: u64,
    /// Units whose XML offset disagreed with the index (tolerated).
    pub offset_drift: u64,
}

/// Merge sentence/token markup into the source document, writing the
/// result to `out`.
pub fn merge_document<W: Write>(
    src: &[u8],
    path: &str,
    cx: &CharIndex,
    data: &TokenData,
    format: &MergeFormat,
    out: &mut W,
) -> Result<MergeStats> {
    let merger = Merger {
        src,
        path,
        cx,
        data,
        format,
        out,
        copied: 0,
        cxi: 0,
        open_sent: None,
        open_tok: None,
        sent_seg: vec![0u32; data.sentences.len()],
        tok_seg: vec![0u32; data.tokens.len()],
        stats: MergeStats::default(),
    };
    merger.run()
}

struct Merger<'a, W: Write> {
    src: &'a [u8],
    path: &'a str,
    cx: &'a CharIndex,
    data: &'a TokenData,
    format: &'a MergeFormat,
    out: &'a mut W,
    /// Source bytes copied to the output so far.
    copied: usize,
    /// Next expected character-index record.
    cxi: usize,
    open_sent: Option<u32>,
    open_tok: Option<u32>,
    /// Per-sentence and per-token segment cursors, advanced on open.
    sent_seg: Vec<u32>,
    tok_seg: Vec<u32>,
    stats: MergeStats,
}

impl<'a, W: Write> Merger<'a, W> {
    fn run(mut self) -> Result<MergeStats> {
        let text = std::str::from_utf8(self.src)
            .map_err(|e| malformed_xml(self.path, self.src, e.valid_up_to(), "invalid UTF-8"))?;
        let mut reader = Reader::from_str(text);

        let mut text_depth = 0usize;
        let mut in_c = false;
        let mut c_start = 0usize;
        let mut c_id: Option<String> = None;
        loop {
            let start = reader.buffer_position();
            let event = reader
                .read_event()
                .map_err(|e| malformed_xml(self.path, self.src, reader.buffer_position(), e))?;
            let end = reader.buffer_position();
            match event {
                Event::Start(e) if text_depth > 0 && e.name().as_ref() == CHAR_ELT => {
                    if in_c {
                        return Err(PipelineError::NestedChar {
                            elt: "c".into(),
                            first: c_start as u64,
                            second: start as u64,
                        }
                        .into());
                    }
                    in_c = true;
                    c_start = start;
                    c_id = self.unit_id(&e, start)?;
                }
                Event::Empty(e) if text_depth > 0 && e.name().as_ref() == CHAR_ELT && !in_c => {
                    let id = self.unit_id(&e, start)?;
                    self.unit(start, end, id)?;
                }
                Event::End(e) if in_c && e.name().as_ref() == CHAR_ELT => {
                    let id = c_id.take();
                    self.unit(c_start, end, id)?;
                    in_c = false;
                }
                Event::Start(e) | Event::Empty(e)
                    if text_depth > 0 && e.name().as_ref() == LB_ELT =>
                {
                    // Line-break units carry the start tag's own bytes.
                    self.unit(start, end, None)?;
                }
                Event::Start(e) if e.name().as_ref() == TEXT_ELT => text_depth += 1,
                Event::End(e) if e.name().as_ref() == TEXT_ELT && text_depth > 0 => {
                    text_depth -= 1
                }
                Event::Eof => break,
                _ => {}
            }
        }

        self.copy_upto(self.src.len())?;
        if self.cxi < self.cx.len() {
            warn!(
                expected = self.cx.len(),
                seen = self.cxi,
                "document has fewer atomic units than the character index"
            );
        }
        info!(
            records = self.stats.records,
            sentence_segs = self.stats.sentence_segs,
            token_segs = self.stats.token_segs,
            offset_drift = self.stats.offset_drift,
            "merged document"
        );
        Ok(self.stats)
    }

    /// Process one atomic unit spanning `src[start..end)`: check it
    /// against the expected record, emit boundary transitions around it,
    /// and copy its bytes through.
    fn unit(&mut self, start: usize, end: usize, id: Option<String>) -> Result<()> {
        let cxi = self.cxi;
        self.cxi += 1;
        self.stats.records += 1;

        let Some(rec) = self.cx.records().get(cxi) else {
            if cxi == self.cx.len() {
                warn!(
                    expected = self.cx.len(),
                    "document has more atomic units than the character index"
                );
            }
            return self.copy_upto(end);
        };
        self.check_unit(rec, start, id)?;

        let ann = self.annotation(cxi);
        self.copy_upto(start)?;
        if let Some(si) = ann.sent {
            if self.open_sent != Some(si) {
                self.open_sentence(si)?;
            }
        }
        if let Some(ti) = ann.token {
            if self.open_tok != Some(ti) {
                self.open_token(ti)?;
            }
        }
        self.copy_upto(end)?;

        let next = self.annotation(cxi + 1);
        if let Some(ti) = self.open_tok {
            if next.token != Some(ti) {
                self.close(&self.format.token_elt.clone())?;
                self.open_tok = None;
            }
        }
        if let Some(si) = self.open_sent {
            if next.sent != Some(si) {
                self.close(&self.format.sentence_elt.clone())?;
                self.write_str("\n")?;
                self.open_sent = None;
            }
        }
        Ok(())
    }

    /// Id and offset consistency between the walked document and the
    /// loaded index. A real id conflict is fatal; offset drift is not.
    fn check_unit(&mut self, rec: &CharRecord, start: usize, id: Option<String>) -> Result<()> {
        if let (Some(expected), Some(got)) = (rec.merge_id(), id.as_deref()) {
            if expected != got {
                let (line, col) = line_col(self.src, start);
                return Err(PipelineError::IdMismatch {
                    path: self.path.to_string(),
                    elt: "c".into(),
                    line,
                    col,
                    offset: start as u64,
                    expected: expected.to_string(),
                    got: got.to_string(),
                }
                .into());
            }
        }
        if rec.xml_off != start as u64 {
            warn!(
                expected = rec.xml_off,
                got = start as u64,
                "unit offset drifted from the character index"
            );
            self.stats.offset_drift += 1;
        }
        Ok(())
    }

    fn annotation(&self, cxi: usize) -> CharAnnotation {
        self.data
            .annotations
            .get(cxi)
            .copied()
            .unwrap_or_default()
    }

    fn open_sentence(&mut self, si: u32) -> Result<()> {
        self.sent_seg[si as usize] += 1;
        let seg = self.sent_seg[si as usize];
        let sent = &self.data.sentences[si as usize];
        let tag = self.boundary_tag(
            &self.format.sentence_elt,
            sent.id.as_deref(),
            seg,
            sent.nsegs,
        );
        self.write_str("\n")?;
        self.write_str(&tag)?;
        self.open_sent = Some(si);
        self.stats.sentence_segs += 1;
        Ok(())
    }

    fn open_token(&mut self, ti: u32) -> Result<()> {
        self.tok_seg[ti as usize] += 1;
        let seg = self.tok_seg[ti as usize];
        let tok = &self.data.tokens[ti as usize];
        let tag = self.boundary_tag(&self.format.token_elt, tok.id.as_deref(), seg, tok.nsegs);
        self.write_str(&tag)?;
        self.open_tok = Some(ti);
        self.stats.token_segs += 1;
        Ok(())
    }

    /// Render one boundary open tag. Single-segment owners get the plain
    /// form; segments of a discontinuous owner carry `part` markers, a
    /// back-reference on continuations, and their segment position.
    fn boundary_tag(&self, elt: &str, id: Option<&str>, seg: u32, nsegs: u32) -> String {
        let mut tag = String::new();
        tag.push('<');
        tag.push_str(elt);
        if nsegs <= 1 {
            if let Some(id) = id {
                let _ = write!(tag, " xml:id=\"{}\"", xml_escape_attr(id));
            }
        } else if seg == 1 {
            let _ = write!(tag, " part=\"I\"");
            if let Some(id) = id {
                let _ = write!(tag, " xml:id=\"{}\"", xml_escape_attr(id));
            }
            let _ = write!(tag, " seg=\"{seg}/{nsegs}\"");
        } else {
            let part = if seg == nsegs { "F" } else { "M" };
            let _ = write!(tag, " part=\"{part}\"");
            if let Some(id) = id {
                let _ = write!(
                    tag,
                    " {}=\"{}{}\"",
                    self.format.ref_attr,
                    REF_PREFIX,
                    xml_escape_attr(id)
                );
            }
            let _ = write!(tag, " seg=\"{seg}/{nsegs}\"");
        }
        tag.push('>');
        tag
    }

    fn close(&mut self, elt: &str) -> Result<()> {
        let tag = format!("</{elt}>");
        self.write_str(&tag)
    }

    fn unit_id(&self, e: &BytesStart, at: usize) -> Result<Option<String>> {
        let attr = e
            .try_get_attribute("xml:id")
            .map_err(|err| malformed_xml(self.path, self.src, at, err))?;
        match attr {
            None => Ok(None),
            Some(attr) => {
                let value = attr
                    .unescape_value()
                    .map_err(|err| malformed_xml(self.path, self.src, at, err))?;
                Ok(Some(value.into_owned()))
            }
        }
    }

    /// Copy pending source bytes up to `upto` into the output.
    fn copy_upto(&mut self, upto: usize) -> Result<()> {
        if upto > self.copied {
            self.out
                .write_all(&self.src[self.copied..upto])
                .context("write failed for merge output")?;
            self.copied = upto;
        }
        Ok(())
    }

    fn write_str(&mut self, s: &str) -> Result<()> {
        self.out
            .write_all(s.as_bytes())
            .context("write failed for merge output")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_index::BlockIndex;
    use crate::char_index::{CxFormat, CxWriter};
    use crate::indexer::{index_document, IndexerConfig};
    use crate::reverse_index::OffsetIndex;

    fn build_index(src: &str) -> CharIndex {
        let mut cx_buf = Vec::new();
        let cx = CxWriter::new(&mut cx_buf, CxFormat::Binary, false, false).unwrap();
        index_document(
            src.as_bytes(),
            "doc.xml",
            Some(cx),
            None::<&mut Vec<u8>>,
            None::<&mut Vec<u8>>,
            &IndexerConfig::default(),
        )
        .unwrap();
        CharIndex::read("doc.cx", &cx_buf).unwrap()
    }

    fn merge_to_string(
        src: &str,
        cx: &CharIndex,
        data: &TokenData,
        format: &MergeFormat,
    ) -> (String, MergeStats) {
        let mut out = Vec::new();
        let stats = merge_document(src.as_bytes(), "doc.xml", cx, data, format, &mut out).unwrap();
        (String::from_utf8(out).unwrap(), stats)
    }

    #[test]
    fn test_single_token_merge() {
        let src = r#"<text><c xml:id="c1">H</c><c xml:id="c2">i</c><lb/></text>"#;
        let cx = build_index(src);
        let idx = OffsetIndex::over_text(&cx);
        let tokens = r#"<s xml:id="s1"><w xml:id="w1" b="0 2"/></s>"#;
        let data = TokenData::load("doc.t.xml", tokens.as_bytes(), &cx, &idx).unwrap();

        let (out, stats) = merge_to_string(src, &cx, &data, &MergeFormat::default());
        assert_eq!(
            out,
            concat!(
                "<text>\n",
                r#"<s xml:id="s1"><w xml:id="w1"><c xml:id="c1">H</c><c xml:id="c2">i</c></w></s>"#,
                "\n<lb/></text>"
            )
        );
        assert_eq!(stats.records, 3);
        assert_eq!(stats.sentence_segs, 1);
        assert_eq!(stats.token_segs, 1);
        assert_eq!(stats.offset_drift, 0);
    }

    #[test]
    fn test_discontinuous_token_gets_part_segments() {
        let src = concat!(
            r#"<text><c xml:id="a">a</c><c xml:id="b">b</c>"#,
            r#"<c xml:id="c">c</c><c xml:id="d">d</c></text>"#
        );
        let cx = build_index(src);
        let text_idx = OffsetIndex::over_text(&cx);
        // Tokenizer stream carries records 0 and 2 only.
        let bx = BlockIndex::read("doc.bx", b"b1\t0\t1\t0\t1\nb2\t2\t1\t1\t1\n").unwrap();
        let txt_idx = OffsetIndex::over_tokenizer(&bx, &text_idx);
        let tokens = r#"<s xml:id="s1"><w xml:id="w1" b="0 2"/></s>"#;
        let data = TokenData::load("doc.t.xml", tokens.as_bytes(), &cx, &txt_idx).unwrap();

        let (out, stats) = merge_to_string(src, &cx, &data, &MergeFormat::default());
        assert_eq!(
            out,
            concat!(
                "<text>\n",
                r#"<s xml:id="s1">"#,
                r#"<w part="I" xml:id="w1" seg="1/2"><c xml:id="a">a</c></w>"#,
                r#"<c xml:id="b">b</c>"#,
                r##"<w part="F" n="#w1" seg="2/2"><c xml:id="c">c</c></w>"##,
                "</s>\n",
                r#"<c xml:id="d">d</c></text>"#
            )
        );
        assert_eq!(stats.token_segs, 2);
        assert_eq!(stats.sentence_segs, 1);
    }

    #[test]
    fn test_id_mismatch_fatal() {
        let src = r#"<text><c xml:id="c1">H</c></text>"#;
        let cx = build_index(src);
        let idx = OffsetIndex::over_text(&cx);
        let data = TokenData::load(
            "doc.t.xml",
            br#"<s><w b="0 1"/></s>"#,
            &cx,
            &idx,
        )
        .unwrap();

        // Same shape, different unit id.
        let drifted = r#"<text><c xml:id="zz">H</c></text>"#;
        let mut out = Vec::new();
        let err =
            merge_document(drifted.as_bytes(), "doc.xml", &cx, &data, &MergeFormat::default(), &mut out)
                .unwrap_err();
        let err = err.downcast::<PipelineError>().unwrap();
        assert!(matches!(err, PipelineError::IdMismatch { .. }));
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_offset_drift_tolerated() {
        let src = r#"<text><c xml:id="c1">H</c></text>"#;
        let cx = build_index(src);
        let idx = OffsetIndex::over_text(&cx);
        let data =
            TokenData::load("doc.t.xml", br#"<s><w b="0 1"/></s>"#, &cx, &idx).unwrap();

        // Leading comment shifts every unit without changing ids.
        let shifted = format!("<!-- note -->{src}");
        let mut out = Vec::new();
        let stats = merge_document(
            shifted.as_bytes(),
            "doc.xml",
            &cx,
            &data,
            &MergeFormat::default(),
            &mut out,
        )
        .unwrap();
        assert_eq!(stats.offset_drift, 1);
        let merged = String::from_utf8(out).unwrap();
        assert!(merged.starts_with("<!-- note -->"));
        assert!(merged.contains("<w>"));
    }

    #[test]
    fn test_custom_vocabulary() {
        let src = r#"<text><c xml:id="a">a</c><c xml:id="b">b</c><c xml:id="c">c</c></text>"#;
        let cx = build_index(src);
        let text_idx = OffsetIndex::over_text(&cx);
        let bx = BlockIndex::read("doc.bx", b"b1\t0\t1\t0\t1\nb2\t2\t1\t1\t1\n").unwrap();
        let txt_idx = OffsetIndex::over_tokenizer(&bx, &text_idx);
        let data = TokenData::load(
            "doc.t.xml",
            br#"<s xml:id="s1"><w xml:id="w1" b="0 2"/></s>"#,
            &cx,
            &txt_idx,
        )
        .unwrap();

        let format = MergeFormat {
            sentence_elt: "sentence".into(),
            token_elt: "token".into(),
            ref_attr: "corresp".into(),
        };
        let (out, _) = merge_to_string(src, &cx, &data, &format);
        assert!(out.contains("<sentence xml:id=\"s1\">"));
        assert!(out.contains("<token part=\"I\" xml:id=\"w1\" seg=\"1/2\">"));
        assert!(out.contains("<token part=\"F\" corresp=\"#w1\" seg=\"2/2\">"));
        assert!(out.contains("</sentence>"));
    }

    #[test]
    fn test_untokenized_document_passes_through() {
        let src = r#"<text><c xml:id="c1">H</c><lb/></text>"#;
        let cx = build_index(src);
        let idx = OffsetIndex::over_text(&cx);
        let data = TokenData::load("doc.t.xml", b"<sentences/>", &cx, &idx).unwrap();

        let (out, stats) = merge_to_string(src, &cx, &data, &MergeFormat::default());
        assert_eq!(out, src);
        assert_eq!(stats.sentence_segs, 0);
        assert_eq!(stats.token_segs, 0);
    }
}
