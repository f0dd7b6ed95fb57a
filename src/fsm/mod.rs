//! Behavior-model compiler, exporter, and structural validator.

pub mod compiler;
pub mod export;
pub mod model;
pub mod validator;

pub use compiler::{compile_capability_map, compile_workflow};
pub use export::{export_machines, load_index, load_machine, spec_checksum};
pub use model::{Machine, MachineLevel, StateType};
pub use validator::{validate_dir, validate_machine, ValidatorConfig};
