//! Command model and script source resolution for hatch.
//!
//! This crate defines the declarative side of an execution: the root
//! command-source file, commands and their implementations (`command`),
//! the single precedence rule for layered settings (`precedence`), inline vs
//! file scripts (`script`), and interpreter/shebang parsing (`interpreter`).

pub mod command;
pub mod interpreter;
pub mod precedence;
pub mod script;
pub mod types;

pub use command::{
    Command, CommandFile, EnvConfig, EnvInheritMode, Implementation, RuntimeConfig, RuntimeKind,
    SchemaError,
};
pub use interpreter::{parse_interpreter, parse_shebang, resolve_interpreter, InterpreterSpec};
pub use precedence::{
    effective_inherit, effective_workdir, workdir_setting, InheritOverride, InheritPolicy, Layers,
};
pub use script::is_script_file;
pub use types::ExecutionId;
