//! Name-to-backend dispatch.

use crate::backend::{PreparedCommand, Runtime};
use crate::config::Config;
use crate::container::cli::select_engine;
use crate::container::engine::ContainerEngine;
use crate::container::host_access::HostAccessServer;
use crate::container::provision::LayerProvisioner;
use crate::container::ContainerRuntime;
use crate::context::ExecutionContext;
use crate::env::{DefaultEnvBuilder, EnvBuilder};
use crate::exit::ExecResult;
use crate::gate::{ProcessRunGate, RunGate};
use crate::native::NativeRuntime;
use crate::virtual_runtime::VirtualRuntime;
use crate::RuntimeError;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Default, Clone)]
pub struct Registry {
    runtimes: BTreeMap<String, Arc<dyn Runtime>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("runtimes", &self.names())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `runtime` under its name, replacing any previous entry.
    pub fn register(&mut self, runtime: Arc<dyn Runtime>) {
        debug!("registering runtime {}", runtime.name());
        self.runtimes.insert(runtime.name().to_owned(), runtime);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Runtime> {
        self.runtimes.get(name).map(AsRef::as_ref)
    }

    /// The backend selected by `ctx`.
    pub fn get_for_context(&self, ctx: &ExecutionContext) -> Result<&dyn Runtime, RuntimeError> {
        let name = ctx.runtime.as_str();
        self.get(name)
            .ok_or_else(|| RuntimeError::NotRegistered(name.to_owned()))
    }

    pub fn names(&self) -> Vec<String> {
        self.runtimes.keys().cloned().collect()
    }

    /// Names of registered backends that report themselves available.
    pub fn available(&self) -> Vec<String> {
        self.runtimes
            .iter()
            .filter(|(_, rt)| rt.available())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Resolve, check availability and validate. Every failure surfaces as
    /// an error the callers turn into exit code 1.
    fn checked(&self, ctx: &ExecutionContext) -> Result<&dyn Runtime, RuntimeError> {
        let runtime = self.get_for_context(ctx)?;
        if !runtime.available() {
            return Err(RuntimeError::Unavailable(runtime.name().to_owned()));
        }
        runtime.validate(ctx)?;
        Ok(runtime)
    }

    pub fn execute(&self, ctx: &mut ExecutionContext) -> ExecResult {
        match self.checked(ctx) {
            Ok(runtime) => runtime.execute(ctx),
            Err(e) => ExecResult::failure(e),
        }
    }

    pub fn execute_capture(&self, ctx: &mut ExecutionContext) -> ExecResult {
        let runtime = match self.checked(ctx) {
            Ok(rt) => rt,
            Err(e) => return ExecResult::failure(e),
        };
        match runtime.as_capture() {
            Some(capture) => capture.execute_capture(ctx),
            None => ExecResult::failure(RuntimeError::Unsupported {
                runtime: runtime.name().to_owned(),
                capability: "output capture",
            }),
        }
    }

    pub fn prepare_interactive(
        &self,
        ctx: &mut ExecutionContext,
    ) -> Result<PreparedCommand, RuntimeError> {
        let runtime = self.checked(ctx)?;
        match runtime.as_interactive() {
            Some(interactive) if interactive.supports_interactive() => {
                interactive.prepare_interactive(ctx)
            }
            _ => Err(RuntimeError::Unsupported {
                runtime: runtime.name().to_owned(),
                capability: "interactive mode",
            }),
        }
    }
}

/// A problem found while building the registry that did not stop it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub code: &'static str,
    pub message: String,
}

/// Collaborators injected into [`build_registry`] instead of the defaults.
#[derive(Default, Clone)]
pub struct RegistryOptions {
    pub env_builder: Option<Arc<dyn EnvBuilder>>,
    pub engine: Option<Arc<dyn ContainerEngine>>,
    pub gate: Option<Arc<dyn RunGate>>,
    pub host_access: Option<Arc<dyn HostAccessServer>>,
}

#[derive(Debug)]
pub struct BuiltRegistry {
    pub registry: Registry,
    pub diagnostics: Vec<Diagnostic>,
    /// The container backend, kept for image maintenance.
    pub container: Option<Arc<ContainerRuntime>>,
}

/// Register native and virtual, plus container when an engine can be used.
pub fn build_registry(config: &Config, options: RegistryOptions) -> BuiltRegistry {
    let env_builder = options
        .env_builder
        .unwrap_or_else(|| Arc::new(DefaultEnvBuilder::new()));
    let mut registry = Registry::new();
    let mut diagnostics = Vec::new();

    let mut native = NativeRuntime::new().with_env_builder(Arc::clone(&env_builder));
    if let Some(shell) = &config.default_shell {
        native = native.with_shell(shell.clone());
    }
    registry.register(Arc::new(native));
    registry.register(Arc::new(
        VirtualRuntime::new().with_env_builder(Arc::clone(&env_builder)),
    ));

    let engine: Result<Arc<dyn ContainerEngine>, _> = match options.engine {
        Some(engine) => Ok(engine),
        None => select_engine(config.container_engine).map(Arc::from),
    };
    let container = match engine {
        Ok(engine) => {
            let cache_dir = config.cache_dir();
            let gate = options.gate.unwrap_or_else(|| {
                Arc::new(ProcessRunGate::new().with_lock_file(cache_dir.join("run.lock")))
            });
            let mut runtime = ContainerRuntime::new(Arc::clone(&engine))
                .with_env_builder(env_builder)
                .with_gate(gate)
                .with_retry(config.retry.policy())
                .with_cache_dir(cache_dir);
            if config.provision.enabled {
                runtime = runtime.with_provisioner(Arc::new(LayerProvisioner::new(
                    engine,
                    config.provision.clone(),
                )));
            }
            if let Some(server) = options.host_access {
                runtime = runtime.with_host_access(server);
            }
            let runtime = Arc::new(runtime);
            registry.register(Arc::clone(&runtime) as Arc<dyn Runtime>);
            Some(runtime)
        }
        Err(e) => {
            warn!("container runtime disabled: {e}");
            diagnostics.push(Diagnostic {
                code: "container_runtime_init_failed",
                message: e.to_string(),
            });
            None
        }
    };

    BuiltRegistry {
        registry,
        diagnostics,
        container,
    }
}
