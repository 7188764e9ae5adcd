//! Standoff token XML: flatten tokenizer output into a plain token list
//! whose entries point back at the atomic character units of the source
//! document by reference, suitable for external annotation layers.

use crate::error::malformed_xml;
use crate::escape::xml_escape_attr;
use anyhow::{Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;
use std::io::Write;
use tracing::info;

#[derive(Debug, Default, Clone, Serialize)]
pub struct StandoffStats {
    pub tokens: u64,
    pub refs: u64,
}

/// Base document a standoff file refers to: the tokenizer-output name
/// with its `.t.xml` suffix replaced by `.xml`. Names without the
/// suffix are kept as they are.
pub fn default_xml_base(input: &str) -> String {
    match input.strip_suffix(".t.xml") {
        Some(stem) => format!("{stem}.xml"),
        None => input.to_string(),
    }
}

/// Rewrite tokenizer output as a flat `<tokens>` document: one `<w>`
/// per input token, carrying its id and surface text, with one
/// `<c ref="#ID"/>` child per entry of the token's space-separated
/// character-id attribute.
pub fn standoff_tokens<W: Write>(
    src: &[u8],
    path: &str,
    xml_base: &str,
    out: &mut W,
) -> Result<StandoffStats> {
    let text = std::str::from_utf8(src)
        .map_err(|e| malformed_xml(path, src, e.valid_up_to(), "invalid UTF-8"))?;
    let mut reader = Reader::from_str(text);
    let mut stats = StandoffStats::default();

    writeln!(out, r#"<?xml version="1.0" encoding="UTF-8"?>"#)
        .context("write failed for standoff output")?;
    writeln!(out, r#"<tokens xml:base="{}">"#, xml_escape_attr(xml_base))
        .context("write failed for standoff output")?;
    loop {
        let start = reader.buffer_position();
        let event = reader
            .read_event()
            .map_err(|e| malformed_xml(path, src, reader.buffer_position(), e))?;
        match event {
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"w" => {
                write_token(path, src, &e, start, out, &mut stats)?;
            }
            Event::Eof => break,
            _ => {}
        }
    }
    writeln!(out, "</tokens>").context("write failed for standoff output")?;

    info!(tokens = stats.tokens, refs = stats.refs, "wrote standoff tokens");
    Ok(stats)
}

fn write_token<W: Write>(
    path: &str,
    src: &[u8],
    e: &BytesStart,
    at: usize,
    out: &mut W,
    stats: &mut StandoffStats,
) -> Result<()> {
    let attr = |name: &str| -> Result<Option<String>> {
        let attr = e
            .try_get_attribute(name)
            .map_err(|err| malformed_xml(path, src, at, err))?;
        match attr {
            None => Ok(None),
            Some(attr) => {
                let value = attr
                    .unescape_value()
                    .map_err(|err| malformed_xml(path, src, at, err))?;
                Ok(Some(value.into_owned()))
            }
        }
    };

    let id = attr("xml:id")?;
    let surface = attr("t")?;
    let char_ids = attr("c")?;

    write!(out, "  <w").context("write failed for standoff output")?;
    if let Some(id) = &id {
        write!(out, r#" xml:id="{}""#, xml_escape_attr(id))
            .context("write failed for standoff output")?;
    }
    if let Some(surface) = &surface {
        write!(out, r#" t="{}""#, xml_escape_attr(surface))
            .context("write failed for standoff output")?;
    }
    let refs: Vec<&str> = char_ids
        .as_deref()
        .map(|ids| ids.split_ascii_whitespace().collect())
        .unwrap_or_default();
    if refs.is_empty() {
        writeln!(out, "/>").context("write failed for standoff output")?;
    } else {
        write!(out, ">").context("write failed for standoff output")?;
        for cid in &refs {
            write!(out, r##"<c ref="#{}"/>"##, xml_escape_attr(cid))
                .context("write failed for standoff output")?;
            stats.refs += 1;
        }
        writeln!(out, "</w>").context("write failed for standoff output")?;
    }
    stats.tokens += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(src: &str, base: &str) -> String {
        let mut out = Vec::new();
        standoff_tokens(src.as_bytes(), "doc.t.xml", base, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_default_xml_base_suffix_rewrite() {
        assert_eq!(default_xml_base("doc.t.xml"), "doc.xml");
        assert_eq!(default_xml_base("path/to/doc.t.xml"), "path/to/doc.xml");
        assert_eq!(default_xml_base("doc.xml"), "doc.xml");
    }

    #[test]
    fn test_tokens_flattened_with_refs() {
        let src = concat!(
            r#"<sentences><s xml:id="s1">"#,
            r#"<w xml:id="w1" t="Hi" b="0 2" c="c1 c2"/>"#,
            r#"<w xml:id="w2" t="!" b="2 1" c="c3"/>"#,
            r#"</s></sentences>"#
        );
        let out = run(src, "doc.xml");
        assert!(out.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n"));
        assert!(out.contains(r#"<tokens xml:base="doc.xml">"#));
        assert!(out.contains(r##"  <w xml:id="w1" t="Hi"><c ref="#c1"/><c ref="#c2"/></w>"##));
        assert!(out.contains(r##"  <w xml:id="w2" t="!"><c ref="#c3"/></w>"##));
        assert!(out.ends_with("</tokens>\n"));
    }

    #[test]
    fn test_token_without_char_ids_self_closes() {
        let out = run(r#"<s><w xml:id="w1" t="x"/></s>"#, "doc.xml");
        assert!(out.contains(r#"  <w xml:id="w1" t="x"/>"#));
    }

    #[test]
    fn test_attribute_values_escaped() {
        let out = run(r#"<s><w xml:id="w1" t="a&lt;b" c="c1"/></s>"#, r#"a"b.xml"#);
        assert!(out.contains(r#"xml:base="a&quot;b.xml""#));
        assert!(out.contains(r#"t="a&lt;b""#));
    }

    #[test]
    fn test_counts() {
        let src = r#"<s><w c="c1 c2 c3"/><w c="c4"/></s>"#;
        let mut out = Vec::new();
        let stats = standoff_tokens(src.as_bytes(), "doc.t.xml", "doc.xml", &mut out).unwrap();
        assert_eq!(stats.tokens, 2);
        assert_eq!(stats.refs, 4);
    }
}
