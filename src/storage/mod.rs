//! Vector and lexical store adapters (§4.4, §4.5) plus their shared filter
//! grammar (§4.4 Filter grammar).

pub mod filter;
pub mod lexical;
pub mod vector;

pub use filter::{Filter, FilterValue};
pub use lexical::{LexicalHit, LexicalQuery, LexicalStore, TantivyLexicalStore};
pub use vector::{LanceVectorStore, VectorHit, VectorStore};
