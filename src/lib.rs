pub mod block_index;
pub mod char_index;
pub mod error;
pub mod escape;
pub mod indexer;
pub mod io;
pub mod merge;
pub mod reverse_index;
pub mod standoff;
pub mod tokens;

// Re-export main types for convenient access
pub use char_index::{CharIndex, CharKind, CharRecord, CxFormat, CxWriter};
pub use error::PipelineError;

// Re-export the stage entry points
pub use indexer::{index_document, IndexStats, IndexerConfig};
pub use merge::{merge_document, MergeFormat, MergeStats};
pub use standoff::{default_xml_base, standoff_tokens, StandoffStats};
pub use tokens::TokenData;
