pub mod bitmap;
pub mod config;
pub mod dispatcher;
pub mod elem;
pub mod error;
pub mod graph;
pub mod io;
pub mod matrix;
pub mod numa;
pub mod pool;
pub mod runtime;
pub mod vector;

pub use crate::config::EngineConfig;
pub use crate::error::{BrasaError, Result};
pub use crate::graph::{Dir, GraphContext, GraphEngine, GraphIndex, VertexId, VertexProgram};
pub use crate::runtime::Runtime;
pub use crate::vector::{sort_vecs, EmVec, LocalPortion};
