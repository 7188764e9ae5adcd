//! Tokenizer-output loading: parse the sentence/token XML the external
//! tokenizer produced over the (possibly block-relabeled) text stream,
//! resolve each token's byte span back to character-index records, and
//! compute the per-record annotations the merge and standoff stages
//! consume.

use crate::char_index::CharIndex;
use crate::error::{malformed_xml, PipelineError};
use crate::reverse_index::OffsetIndex;
use anyhow::Result;
use quick_xml::events::BytesStart;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{info, warn};

/// Upper bound on a token or sentence identifier, in bytes.
pub const MAX_TOKEN_ID_LEN: usize = 64;

/// Element names expected in tokenizer output.
pub const SENT_ELT: &[u8] = b"s";
pub const TOKEN_ELT: &[u8] = b"w";

/// One token, located by its byte span in the tokenizer's text stream
/// and resolved to the character-index records it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    /// Owning sentence, as an index into `TokenData::sentences`.
    pub sent: u32,
    pub id: Option<String>,
    /// Byte span in the tokenizer's text stream.
    pub txt_off: u64,
    pub txt_len: u64,
    /// Character-index records covered by the span, ascending, deduped.
    pub covered: Vec<u32>,
    /// Number of contiguous runs in `covered`. 1 for an ordinary token;
    /// more when block relabeling made the token discontinuous in the
    /// source document.
    pub nsegs: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentenceRecord {
    pub id: Option<String>,
    pub first_token: Option<u32>,
    pub last_token: Option<u32>,
    /// Contiguous runs of the sentence's character-record envelope.
    pub nsegs: u32,
}

/// Annotation of one character-index record with its owning token and
/// sentence, filled by `TokenData::load`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharAnnotation {
    pub token: Option<u32>,
    pub sent: Option<u32>,
    /// First covered record of its token, in document order.
    pub token_begin: bool,
    /// Last covered record of its token, in document order.
    pub token_end: bool,
}

impl CharAnnotation {
    pub fn in_token(&self) -> bool {
        self.token.is_some()
    }

    pub fn in_sentence(&self) -> bool {
        self.sent.is_some()
    }
}

/// Everything the downstream stages need from one tokenizer run.
#[derive(Debug, Default)]
pub struct TokenData {
    pub sentences: Vec<SentenceRecord>,
    pub tokens: Vec<TokenRecord>,
    /// Parallel to the character index's records.
    pub annotations: Vec<CharAnnotation>,
}

impl TokenData {
    /// Parse tokenizer output and resolve its spans against the
    /// character index through the tokenizer-stream offset index.
    ///
    /// Tokens outside a sentence are a shape violation. Span bytes that
    /// resolve to no record (block separators, untokenized gaps) are
    /// skipped; a token whose span resolves to nothing at all is kept
    /// but covers no records, which downstream stages report.
    pub fn load(
        path: &str,
        bytes: &[u8],
        cx: &CharIndex,
        txt_index: &OffsetIndex,
    ) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| malformed_xml(path, bytes, e.valid_up_to(), "invalid UTF-8"))?;
        let mut reader = Reader::from_str(text);

        let mut sentences: Vec<SentenceRecord> = Vec::new();
        let mut tokens: Vec<TokenRecord> = Vec::new();
        let mut cur_sent: Option<u32> = None;
        loop {
            let start = reader.buffer_position();
            let event = reader
                .read_event()
                .map_err(|e| malformed_xml(path, bytes, reader.buffer_position(), e))?;
            match event {
                Event::Start(e) if e.name().as_ref() == SENT_ELT => {
                    sentences.push(SentenceRecord {
                        id: elt_id(path, bytes, &e, start)?,
                        first_token: None,
                        last_token: None,
                        nsegs: 0,
                    });
                    cur_sent = Some((sentences.len() - 1) as u32);
                }
                Event::Empty(e) if e.name().as_ref() == SENT_ELT => {
                    sentences.push(SentenceRecord {
                        id: elt_id(path, bytes, &e, start)?,
                        first_token: None,
                        last_token: None,
                        nsegs: 0,
                    });
                }
                Event::End(e) if e.name().as_ref() == SENT_ELT => {
                    cur_sent = None;
                }
                Event::Start(e) | Event::Empty(e) if e.name().as_ref() == TOKEN_ELT => {
                    let si = cur_sent.ok_or_else(|| PipelineError::MalformedTokens {
                        path: path.to_string(),
                        offset: start,
                        message: "token element outside any sentence".into(),
                    })?;
                    let (txt_off, txt_len) = token_span(path, bytes, &e, start)?;
                    let ti = tokens.len() as u32;
                    tokens.push(TokenRecord {
                        sent: si,
                        id: elt_id(path, bytes, &e, start)?,
                        txt_off,
                        txt_len,
                        covered: Vec::new(),
                        nsegs: 0,
                    });
                    let sent = &mut sentences[si as usize];
                    if sent.first_token.is_none() {
                        sent.first_token = Some(ti);
                    }
                    sent.last_token = Some(ti);
                }
                Event::Eof => break,
                _ => {}
            }
        }

        let mut data = Self {
            sentences,
            tokens,
            annotations: vec![CharAnnotation::default(); cx.len()],
        };
        data.resolve(txt_index);
        info!(
            sentences = data.sentences.len(),
            tokens = data.tokens.len(),
            "loaded tokenizer output"
        );
        Ok(data)
    }

    /// Resolve token spans to covered records, stamp annotations, and
    /// count segments for tokens and sentences.
    fn resolve(&mut self, txt_index: &OffsetIndex) {
        for (ti, tok) in self.tokens.iter_mut().enumerate() {
            let mut covered: Vec<u32> = (tok.txt_off..tok.txt_off + tok.txt_len)
                .filter_map(|off| txt_index.get(off))
                .map(|ci| ci as u32)
                .collect();
            covered.sort_unstable();
            covered.dedup();
            if covered.is_empty() && tok.txt_len > 0 {
                warn!(
                    token = ti,
                    txt_off = tok.txt_off,
                    txt_len = tok.txt_len,
                    "token span covers no indexed characters"
                );
            }
            for (k, &ci) in covered.iter().enumerate() {
                if k == 0 || covered[k - 1] + 1 != ci {
                    tok.nsegs += 1;
                }
                let a = &mut self.annotations[ci as usize];
                a.token = Some(ti as u32);
                a.sent = Some(tok.sent);
            }
            if let (Some(&first), Some(&last)) = (covered.first(), covered.last()) {
                self.annotations[first as usize].token_begin = true;
                self.annotations[last as usize].token_end = true;
            }
            tok.covered = covered;
        }

        // A sentence's envelope spans from its first to its last covered
        // record; records inside the envelope that belong to no token
        // still belong to the sentence.
        let mut envelope: Vec<Option<(u32, u32)>> = vec![None; self.sentences.len()];
        for tok in &self.tokens {
            if let (Some(&lo), Some(&hi)) = (tok.covered.first(), tok.covered.last()) {
                let entry = &mut envelope[tok.sent as usize];
                *entry = match *entry {
                    None => Some((lo, hi)),
                    Some((a, b)) => Some((a.min(lo), b.max(hi))),
                };
            }
        }
        for (si, range) in envelope.iter().enumerate() {
            let Some((lo, hi)) = *range else { continue };
            for ci in lo..=hi {
                let a = &mut self.annotations[ci as usize];
                if a.sent.is_none() {
                    a.sent = Some(si as u32);
                }
            }
        }

        let mut last_seen: Vec<Option<usize>> = vec![None; self.sentences.len()];
        for (ci, a) in self.annotations.iter().enumerate() {
            if let Some(si) = a.sent {
                let si = si as usize;
                if last_seen[si].map_or(true, |prev| prev + 1 != ci) {
                    self.sentences[si].nsegs += 1;
                }
                last_seen[si] = Some(ci);
            }
        }
    }
}

fn elt_id(path: &str, bytes: &[u8], e: &BytesStart, at: usize) -> Result<Option<String>> {
    let attr = e
        .try_get_attribute("xml:id")
        .map_err(|err| malformed_xml(path, bytes, at, err))?;
    match attr {
        None => Ok(None),
        Some(attr) => {
            let value = attr
                .unescape_value()
                .map_err(|err| malformed_xml(path, bytes, at, err))?;
            if value.len() > MAX_TOKEN_ID_LEN {
                return Err(PipelineError::OversizedId {
                    id: value.into_owned(),
                    limit: MAX_TOKEN_ID_LEN,
                }
                .into());
            }
            Ok(Some(value.into_owned()))
        }
    }
}

/// Parse the `b="OFF LEN"` location attribute of a token element.
fn token_span(path: &str, bytes: &[u8], e: &BytesStart, at: usize) -> Result<(u64, u64)> {
    let bad = |message: String| PipelineError::MalformedTokens {
        path: path.to_string(),
        offset: at,
        message,
    };
    let attr = e
        .try_get_attribute("b")
        .map_err(|err| malformed_xml(path, bytes, at, err))?
        .ok_or_else(|| bad("token element without a `b` location attribute".into()))?;
    let value = attr
        .unescape_value()
        .map_err(|err| malformed_xml(path, bytes, at, err))?;
    let mut parts = value.split_ascii_whitespace();
    let (off, len) = match (parts.next(), parts.next(), parts.next()) {
        (Some(off), Some(len), None) => (off, len),
        _ => return Err(bad(format!("bad location attribute b=\"{value}\"")).into()),
    };
    let off = off
        .parse::<u64>()
        .map_err(|_| bad(format!("bad location offset `{off}`")))?;
    let len = len
        .parse::<u64>()
        .map_err(|_| bad(format!("bad location length `{len}`")))?;
    Ok((off, len))
}
