//! External-memory vector store: local portions, the temp-file-backed
//! vector, and the two-pass sort/merge engine.

mod em_vec;
mod local;
mod sort;

pub use em_vec::EmVec;
pub use local::{FillOp, LocalPortion};
pub use sort::sort_vecs;
