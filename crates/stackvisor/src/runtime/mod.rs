//! Runtime components: ordering, process management and supervision

pub mod backoff;
pub mod graph;
pub mod plan;
pub mod process;
pub mod readiness;
pub mod state;
pub mod supervisor;
pub mod volume;

pub use backoff::*;
pub use graph::*;
pub use plan::*;
pub use process::*;
pub use readiness::*;
pub use state::*;
pub use supervisor::*;
pub use volume::*;
