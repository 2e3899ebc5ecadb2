use crate::cancel::CancellationToken;
use crate::io::IoStreams;
use crate::RuntimeError;
use hatch_schema::{
    effective_inherit, effective_workdir, resolve_interpreter, workdir_setting, Command,
    CommandFile, ExecutionId, Implementation, InheritOverride, InheritPolicy, InterpreterSpec,
    RuntimeConfig, RuntimeKind,
};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Ad hoc environment supplied by the caller for one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    /// Variables the framework adds for this run (command name, arguments).
    pub extra_env: BTreeMap<String, String>,
    /// Dotenv files given at invocation time, relative to the process cwd.
    pub env_files: Vec<String>,
    /// Variables given at invocation time. Highest precedence.
    pub env_vars: BTreeMap<String, String>,
}

/// Everything one execution needs. Owned by the caller for the duration of a
/// single `execute` call.
#[derive(Debug)]
pub struct ExecutionContext {
    pub file: CommandFile,
    pub command: Command,
    pub implementation: Implementation,
    pub runtime: RuntimeKind,
    pub positional_args: Vec<String>,
    pub workdir_override: Option<String>,
    pub inherit: InheritOverride,
    pub env: EnvOverrides,
    pub io: IoStreams,
    pub cancel: CancellationToken,
    pub execution_id: ExecutionId,
    pub verbose: bool,
    pub force_rebuild: bool,
}

impl ExecutionContext {
    pub fn new(file: CommandFile, command: Command, implementation: Implementation) -> Self {
        let runtime = implementation.default_runtime();
        Self {
            file,
            command,
            implementation,
            runtime,
            positional_args: Vec::new(),
            workdir_override: None,
            inherit: InheritOverride::default(),
            env: EnvOverrides::default(),
            io: IoStreams::default(),
            cancel: CancellationToken::new(),
            execution_id: ExecutionId::generate(),
            verbose: false,
            force_rebuild: false,
        }
    }

    #[must_use]
    pub fn with_runtime(mut self, runtime: RuntimeKind) -> Self {
        self.runtime = runtime;
        self
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.positional_args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_io(mut self, io: IoStreams) -> Self {
        self.io = io;
        self
    }

    #[must_use]
    pub fn with_workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir_override = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.env_vars.insert(key.into(), value.into());
        self
    }

    /// Settings of the selected runtime. Implementations that do not declare
    /// it explicitly get the defaults.
    pub fn runtime_config(&self) -> RuntimeConfig {
        self.implementation
            .runtime_config(self.runtime)
            .cloned()
            .unwrap_or_else(|| RuntimeConfig::new(self.runtime))
    }

    pub fn script(&self) -> Result<String, RuntimeError> {
        Ok(self.implementation.resolve_script(&self.file)?)
    }

    /// The interpreter to run `script` with, if any.
    pub fn interpreter(&self, script: &str) -> Option<InterpreterSpec> {
        let rc = self.runtime_config();
        resolve_interpreter(rc.interpreter.as_deref(), script)
    }

    pub fn workdir_setting(&self) -> Option<String> {
        workdir_setting(
            &self.file,
            &self.command,
            &self.implementation,
            self.workdir_override.as_deref(),
        )
    }

    pub fn effective_workdir(&self) -> PathBuf {
        effective_workdir(
            &self.file,
            &self.command,
            &self.implementation,
            self.workdir_override.as_deref(),
        )
    }

    pub fn inherit_policy(&self) -> InheritPolicy {
        effective_inherit(
            self.runtime,
            &self.file,
            &self.command,
            &self.implementation,
            &self.inherit,
        )
    }
}
