use thiserror::Error;

/// Number of context bytes echoed on either side of a parse failure.
pub const CONTEXT_RADIUS: usize = 64;

/// Fatal pipeline conditions with distinct process exit codes.
///
/// Everything else (file open/read/write failures) travels as plain
/// `anyhow` errors and exits with code 1.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// XML well-formedness violation in any parsed input.
    #[error("`{path}` (line {line}, col {col}, byte {offset}): XML error: {message}\nError context:\n{context}")]
    MalformedXml {
        path: String,
        line: usize,
        col: usize,
        offset: usize,
        message: String,
        context: String,
    },

    /// Tokenizer output that parses as XML but violates the expected shape.
    #[error("`{path}` (byte {offset}): bad tokenizer output: {message}")]
    MalformedTokens {
        path: String,
        offset: usize,
        message: String,
    },

    /// Atomic-character regions never nest.
    #[error("cannot handle nested <{elt}> elements starting at bytes {first}, {second}")]
    NestedChar { elt: String, first: u64, second: u64 },

    /// Character data inside an atomic unit exceeded the record text bound.
    #[error("atomic-unit text starting at byte {offset} exceeds {limit}-byte buffer")]
    OversizedText { offset: u64, limit: usize },

    /// An atomic unit whose XML span does not fit the one-byte length field.
    #[error("atomic unit starting at byte {offset} spans {len} bytes (limit {limit})")]
    OversizedUnit { offset: u64, len: u64, limit: usize },

    /// An identifier exceeded its fixed buffer.
    #[error("identifier `{id}` exceeds {limit}-byte buffer")]
    OversizedId { id: String, limit: usize },

    /// Identifier mismatch between the character index and the document
    /// being merged: the inputs do not describe the same document.
    #[error("<{elt}>-id mismatch in `{path}` at line {line}, col {col}, byte {offset}: expected `{expected}`, got `{got}`")]
    IdMismatch {
        path: String,
        elt: String,
        line: usize,
        col: usize,
        offset: u64,
        expected: String,
        got: String,
    },

    /// An index file that cannot be decoded, or that disagrees with itself.
    #[error("`{path}`: corrupt index: {message}")]
    CorruptIndex { path: String, message: String },
}

impl PipelineError {
    /// Process exit code for this condition, per the error taxonomy:
    /// 2 malformed input, 3 structural violation, 4 cross-index
    /// inconsistency. I/O and usage errors exit 1 elsewhere.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::MalformedXml { .. }
            | PipelineError::MalformedTokens { .. }
            | PipelineError::CorruptIndex { .. } => 2,
            PipelineError::NestedChar { .. }
            | PipelineError::OversizedText { .. }
            | PipelineError::OversizedUnit { .. }
            | PipelineError::OversizedId { .. } => 3,
            PipelineError::IdMismatch { .. } => 4,
        }
    }
}

/// Render the bytes around `offset` with a `---HERE---` marker at the
/// failure point, for malformed-input diagnostics.
pub fn context_window(input: &[u8], offset: usize) -> String {
    let at = offset.min(input.len());
    let start = at.saturating_sub(CONTEXT_RADIUS);
    let end = (at + CONTEXT_RADIUS).min(input.len());
    format!(
        "{}\n---HERE---\n{}",
        String::from_utf8_lossy(&input[start..at]),
        String::from_utf8_lossy(&input[at..end])
    )
}

/// 1-based line/column of a byte offset.
pub fn line_col(input: &[u8], offset: usize) -> (usize, usize) {
    let at = offset.min(input.len());
    let mut line = 1;
    let mut col = 1;
    for &b in &input[..at] {
        if b == b'\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// Build the standard malformed-XML diagnostic for a parse failure at
/// `offset` in `input`.
pub fn malformed_xml(path: &str, input: &[u8], offset: usize, message: impl ToString) -> PipelineError {
    let (line, col) = line_col(input, offset);
    PipelineError::MalformedXml {
        path: path.to_string(),
        line,
        col,
        offset,
        message: message.to_string(),
        context: context_window(input, offset),
    }
}
