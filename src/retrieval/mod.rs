//! Hybrid retrieval engine (§4.4 dense path, §4.5 lexical path, §4.8 fusion,
//! §4.9 structure-aware filtering, context assembly).

pub mod engine;
pub mod hybrid;
pub mod mmr;

pub use engine::{RetrievalEngine, RetrievalRequest, RetrievedChunk};
pub use hybrid::fuse;
