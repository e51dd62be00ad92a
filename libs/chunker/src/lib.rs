//! Content-defined chunking for casnap.
//!
//! A file is split with FastCDC into variable-size chunks named by the
//! SHA-256 of their bytes. The ordered list of chunks is an [`Index`], which
//! is stored alongside the chunks and is all that is needed to put the file
//! back together, or to read ranges of it on demand with an [`IndexReader`].

mod assemble;
mod chop;
mod error;
mod index;
mod policy;
mod reader;

pub use assemble::assemble;
pub use chop::chop;
pub use error::ChunkerError;
pub use index::{chunk_id, load_index, store_index, Index, IndexChunk, INDEX_VERSION};
pub use policy::ChunkSizePolicy;
pub use reader::IndexReader;
