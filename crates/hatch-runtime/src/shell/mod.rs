//! Embedded POSIX-subset shell used by the virtual runtime.
//!
//! Scripts are tokenized (`lexer`), parsed into a small AST (`parser`) and
//! walked by [`Shell`] (`exec`), which runs builtins and functions
//! in-process and spawns everything else with the shell's exported
//! variables and working directory. Command substitutions are parsed along
//! with the word that contains them. Background jobs and here-documents are
//! rejected at parse time so validation can report them before anything
//! runs.

mod arith;
mod builtins;
mod exec;
pub mod lexer;
pub mod parser;
mod pattern;

pub use exec::Shell;
pub use parser::{parse, Program};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("syntax error on line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("{0}: parameter not set")]
    UnsetParameter(String),
    #[error("arithmetic expression: {0}")]
    Arithmetic(String),
    #[error("shell I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("execution cancelled")]
    Cancelled,
}

/// Check a script for syntax errors without running it.
pub fn check_syntax(script: &str) -> Result<(), ShellError> {
    parse(script).map(|_| ())
}
