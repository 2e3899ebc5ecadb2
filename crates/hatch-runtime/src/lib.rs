//! Execution backends for hatch.
//!
//! This crate implements the execution layer: the `Runtime` trait and its
//! `Registry`, the exit-code/result model, per-call `ExecutionContext`,
//! layered environment building with dotenv support, and three backends:
//! the host shell (`native`), an embedded POSIX-subset shell
//! (`virtual_runtime` over `shell`), and container engines (`container`),
//! including image caching, retry with a serialization gate, host-access
//! bridging and image provisioning.

pub mod backend;
pub mod cancel;
pub mod cleanup;
pub mod config;
pub mod container;
pub mod context;
pub mod env;
pub mod exit;
pub mod gate;
pub mod io;
pub mod mock;
pub mod native;
pub mod prereq;
pub(crate) mod process;
pub mod registry;
pub mod shell;
pub mod virtual_runtime;

pub use backend::{CaptureRuntime, InteractiveRuntime, PreparedCommand, Runtime};
pub use cancel::CancellationToken;
pub use cleanup::Cleanup;
pub use config::{Config, ConfigError, EnginePreference};
pub use container::ContainerRuntime;
pub use context::{EnvOverrides, ExecutionContext};
pub use env::{DefaultEnvBuilder, EnvBuilder, MockEnvBuilder};
pub use exit::{ExecResult, ExitCode, InvalidExitCode};
pub use gate::{NoopRunGate, ProcessRunGate, RunGate, RunGateGuard};
pub use io::{InputSource, IoStreams, OutputSink, SharedBuffer};
pub use native::NativeRuntime;
pub use registry::{build_registry, BuiltRegistry, Diagnostic, Registry, RegistryOptions};
pub use virtual_runtime::VirtualRuntime;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Schema(#[from] hatch_schema::SchemaError),
    #[error(transparent)]
    Dotenv(#[from] env::dotenv::DotenvError),
    #[error(transparent)]
    Shell(#[from] shell::ShellError),
    #[error(transparent)]
    Engine(#[from] container::engine::EngineError),
    #[error(transparent)]
    ExitCode(#[from] InvalidExitCode),
    #[error("runtime '{0}' not registered")]
    NotRegistered(String),
    #[error("runtime '{0}' is not available on this system")]
    Unavailable(String),
    #[error("runtime '{runtime}' does not support {capability}")]
    Unsupported {
        runtime: String,
        capability: &'static str,
    },
    #[error("{0}")]
    ShellNotFound(String),
    #[error("interpreter '{0}' not found in PATH")]
    InterpreterNotFound(String),
    #[error("interpreter field is not allowed for virtual runtime (got '{0}')")]
    InterpreterNotAllowed(String),
    #[error("invalid working directory: {0}")]
    WorkDir(String),
    #[error("failed to execute '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Cancelled(String),
    #[error("container configuration error: {0}")]
    ContainerConfig(String),
    #[error("windows container images are not supported, a POSIX shell is required: {0}")]
    WindowsImage(String),
    #[error("host access error: {0}")]
    HostAccess(String),
    #[error("provisioning failed: {0}")]
    Provision(String),
    #[error("run gate error: {0}")]
    Gate(String),
    #[error("invalid virtual invocation: {0}")]
    Invocation(String),
}
