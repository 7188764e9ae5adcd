//! Reverse-offset indices: dense byte-offset → character-record lookup
//! arrays. One instance covers the document's own derived-text stream,
//! another the tokenizer's block-relabeled stream. Slots that belong to
//! no atomic character stay empty.
//!
//! Lookup is O(1) per offset; scanning a token's span is O(span length).
//! No run-length compression: atomic units are short and the stream fits
//! in memory, so a slot per byte is the simpler trade.

use crate::block_index::BlockIndex;
use crate::char_index::CharIndex;

/// Dense offset → character-record index over one byte stream.
/// Exclusively owned by its builder; read-only to every consumer.
#[derive(Debug)]
pub struct OffsetIndex {
    slots: Vec<Option<u32>>,
}

impl OffsetIndex {
    /// Build the derived-text-stream index: every byte of each record's
    /// text range points back at the record.
    pub fn over_text(cx: &CharIndex) -> Self {
        let mut slots = vec![None; cx.text_len() as usize];
        for (i, rec) in cx.records().iter().enumerate() {
            for off in rec.txt_off..rec.txt_end() {
                slots[off as usize] = Some(i as u32);
            }
        }
        Self { slots }
    }

    /// Build the tokenizer-stream index by composing block windows with
    /// the derived-text index: block-local offsets translate to global
    /// derived-text offsets, whose lookups are copied into place. Bytes
    /// a block added beyond its source span (separators) stay empty.
    pub fn over_tokenizer(bx: &BlockIndex, text_index: &OffsetIndex) -> Self {
        let mut slots = vec![None; bx.txt_len() as usize];
        for blk in bx.blocks() {
            let span = blk.tx_len.min(blk.txt_len);
            for j in 0..span {
                if let Some(ci) = text_index.get(blk.tx_off + j) {
                    slots[(blk.txt_off + j) as usize] = Some(ci as u32);
                }
            }
        }
        Self { slots }
    }

    /// Record index owning the byte at `off`, if any. Out-of-range
    /// offsets resolve to empty, like uncovered bytes.
    pub fn get(&self, off: u64) -> Option<usize> {
        self.slots
            .get(off as usize)
            .copied()
            .flatten()
            .map(|i| i as usize)
    }

    /// Stream length in bytes.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
