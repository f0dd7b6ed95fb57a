//! Task loading, dependency-DAG analysis, and lifecycle operations.

pub mod dag;
pub mod lifecycle;
pub mod loader;

pub use dag::{detect_cycles, ready_tasks, sequencing_violations};
pub use lifecycle::TaskLifecycle;
pub use loader::{load_tasks, LoadReport};
