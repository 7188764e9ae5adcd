//! The Block Index: externally produced records describing how the
//! derived-text stream was split into blocks before tokenization. Each
//! block maps a window of the global derived-text stream (`tx`) to a
//! window of the tokenizer's own flattened stream (`txt`), whose offsets
//! are block-relative in origin.
//!
//! Text format, read-only to this crate: `%%` comment lines, then one
//! tab-separated record per line: `key  tx_off  tx_len  txt_off  txt_len`.

use crate::error::PipelineError;

/// One contiguous span of the derived-text stream submitted to the
/// tokenizer as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    /// Block key (element name or label assigned by the splitter).
    pub key: String,
    /// Offset of the block in the global derived-text stream.
    pub tx_off: u64,
    /// Byte length of the block in the global derived-text stream.
    pub tx_len: u64,
    /// Offset of the block in the tokenizer's flattened stream.
    pub txt_off: u64,
    /// Byte length of the block in the tokenizer's flattened stream
    /// (may exceed `tx_len` when the splitter appended separators).
    pub txt_len: u64,
}

#[derive(Debug, Default)]
pub struct BlockIndex {
    blocks: Vec<BlockRecord>,
}

impl BlockIndex {
    /// A single block covering the whole derived-text stream; used when
    /// the document was tokenized without splitting.
    pub fn whole_stream(len: u64) -> Self {
        Self {
            blocks: vec![BlockRecord {
                key: "all".into(),
                tx_off: 0,
                tx_len: len,
                txt_off: 0,
                txt_len: len,
            }],
        }
    }

    pub fn read(path: &str, bytes: &[u8]) -> Result<Self, PipelineError> {
        let corrupt = |message: String| PipelineError::CorruptIndex {
            path: path.to_string(),
            message,
        };

        let content = std::str::from_utf8(bytes)
            .map_err(|e| corrupt(format!("block index is not valid UTF-8: {e}")))?;
        let mut blocks = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.is_empty() || line.starts_with("%%") {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 5 {
                return Err(corrupt(format!(
                    "line {}: expected 5 tab-separated fields, got {}",
                    lineno + 1,
                    fields.len()
                )));
            }
            let parse = |s: &str, what: &str| {
                s.parse::<u64>()
                    .map_err(|_| corrupt(format!("line {}: bad {what} `{s}`", lineno + 1)))
            };
            blocks.push(BlockRecord {
                key: fields[0].to_string(),
                tx_off: parse(fields[1], "tx offset")?,
                tx_len: parse(fields[2], "tx length")?,
                txt_off: parse(fields[3], "txt offset")?,
                txt_len: parse(fields[4], "txt length")?,
            });
        }
        Ok(Self { blocks })
    }

    pub fn blocks(&self) -> &[BlockRecord] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total byte length of the tokenizer stream implied by the blocks.
    pub fn txt_len(&self) -> u64 {
        self.blocks
            .iter()
            .map(|b| b.txt_off + b.txt_len)
            .max()
            .unwrap_or(0)
    }
}
