//! Container backend.
//!
//! Scripts run inside an image that is either named explicitly or built from
//! the `Containerfile`/`Dockerfile` next to the command file. The
//! command-source directory is mounted at [`workdir::WORKSPACE_MOUNT`] and
//! runs go through [`retry::run_with_retry`].

pub mod cli;
pub mod engine;
pub mod host_access;
pub mod image;
pub mod provision;
pub mod retry;
pub mod workdir;

use crate::backend::{CaptureRuntime, InteractiveRuntime, PreparedCommand, Runtime};
use crate::cleanup::Cleanup;
use crate::context::ExecutionContext;
use crate::env::{DefaultEnvBuilder, EnvBuilder};
use crate::exit::ExecResult;
use crate::gate::{ProcessRunGate, RunGate};
use crate::io::{IoStreams, OutputSink};
use crate::native::{write_temp_script, ARG0_PLACEHOLDER};
use crate::RuntimeError;
use engine::{ContainerEngine, RunOptions};
use hatch_schema::RuntimeKind;
use host_access::{HostAccessServer, HOST_GATEWAY_MAPPING};
use image::{ensure_image, find_build_file, image_tag_for, is_windows_image, EnsureImage};
use provision::Provisioner;
use retry::{run_with_retry, RetryPolicy};
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use workdir::{container_workdir, normalize, under_mount, WORKSPACE_MOUNT};

/// Shell used inside containers.
pub const CONTAINER_SHELL: &str = "/bin/sh";

pub struct ContainerRuntime {
    engine: Arc<dyn ContainerEngine>,
    env_builder: Arc<dyn EnvBuilder>,
    gate: Arc<dyn RunGate>,
    retry: RetryPolicy,
    host_access: Option<Arc<dyn HostAccessServer>>,
    provisioner: Option<Arc<dyn Provisioner>>,
    cache_dir: PathBuf,
}

impl std::fmt::Debug for ContainerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerRuntime")
            .field("engine", &self.engine.name())
            .field("retry", &self.retry)
            .field("host_access", &self.host_access.is_some())
            .field("provisioner", &self.provisioner.is_some())
            .field("cache_dir", &self.cache_dir)
            .finish_non_exhaustive()
    }
}

/// A run ready to hand to the engine, plus what must outlive it.
struct PreparedRun {
    opts: RunOptions,
    cleanup: Cleanup,
}

impl ContainerRuntime {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            env_builder: Arc::new(DefaultEnvBuilder::new()),
            gate: Arc::new(ProcessRunGate::new()),
            retry: RetryPolicy::default(),
            host_access: None,
            provisioner: None,
            cache_dir: std::env::temp_dir().join("hatch"),
        }
    }

    #[must_use]
    pub fn with_env_builder(mut self, builder: Arc<dyn EnvBuilder>) -> Self {
        self.env_builder = builder;
        self
    }

    #[must_use]
    pub fn with_gate(mut self, gate: Arc<dyn RunGate>) -> Self {
        self.gate = gate;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_host_access(mut self, server: Arc<dyn HostAccessServer>) -> Self {
        self.host_access = Some(server);
        self
    }

    #[must_use]
    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn engine(&self) -> &dyn ContainerEngine {
        self.engine.as_ref()
    }

    /// Remove the image built for this context's command file.
    pub fn cleanup_image(&self, ctx: &ExecutionContext) -> Result<(), RuntimeError> {
        let tag = image_tag_for(&ctx.file.absolute_path());
        debug!("removing image {tag}");
        self.engine.remove_image(&tag, true)?;
        Ok(())
    }

    fn host_access_server(&self) -> Result<&Arc<dyn HostAccessServer>, RuntimeError> {
        match &self.host_access {
            Some(server) if server.is_running() => Ok(server),
            Some(_) => Err(RuntimeError::HostAccess(
                "host access requested but the server is not running".to_owned(),
            )),
            None => Err(RuntimeError::HostAccess(
                "host access requested but no server is configured".to_owned(),
            )),
        }
    }

    fn resolve_image(&self, ctx: &mut ExecutionContext) -> Result<String, RuntimeError> {
        let rc = ctx.runtime_config();
        if let Some(image) = rc.image.filter(|i| !i.trim().is_empty()) {
            return Ok(image.trim().to_owned());
        }
        let source_file = ctx.file.absolute_path();
        let req = EnsureImage {
            source_file: &source_file,
            containerfile: rc.containerfile.as_deref(),
            force_rebuild: ctx.force_rebuild,
            verbose: ctx.verbose,
            lock_dir: &self.cache_dir.join("locks"),
        };
        ensure_image(self.engine.as_ref(), &req, &mut ctx.io.stderr, &ctx.cancel)
    }

    /// Layer the provisioning payload onto `base`, falling back to `base`
    /// when that fails.
    fn provision(&self, ctx: &mut ExecutionContext, base: String, cleanup: &mut Cleanup) -> String {
        let Some(provisioner) = self.provisioner.as_ref().filter(|p| p.config().enabled) else {
            return base;
        };
        let mut quiet = OutputSink::Null;
        let progress = if ctx.verbose {
            &mut ctx.io.stderr
        } else {
            &mut quiet
        };
        match provisioner.provision(&base, progress, &ctx.cancel) {
            Ok(result) => {
                cleanup.absorb(result.cleanup);
                result.image_tag
            }
            Err(e) => {
                warn!("failed to provision container, using base image: {e}");
                if ctx.verbose {
                    let _ = writeln!(
                        ctx.io.stderr,
                        "warning: failed to provision container, using base image: {e}"
                    );
                }
                base
            }
        }
    }

    /// Command vector run inside the container.
    fn container_command(
        ctx: &ExecutionContext,
        source_dir: &Path,
        cleanup: &mut Cleanup,
    ) -> Result<Vec<String>, RuntimeError> {
        let script = ctx.script()?;
        let Some(interp) = ctx.interpreter(&script) else {
            let mut command = vec![
                CONTAINER_SHELL.to_owned(),
                "-c".to_owned(),
                script,
                ARG0_PLACEHOLDER.to_owned(),
            ];
            command.extend(ctx.positional_args.iter().cloned());
            return Ok(command);
        };

        let in_workspace = ctx
            .implementation
            .script_path(&ctx.file)
            .and_then(|p| {
                let p = normalize(&p);
                p.strip_prefix(normalize(source_dir)).ok().map(under_mount)
            });
        let script_path = match in_workspace {
            Some(path) => path,
            None => {
                let temp = write_temp_script(Some(source_dir), &interp, &script)?;
                let name = temp
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                cleanup.defer(move || {
                    let _ = temp.close();
                });
                format!("{WORKSPACE_MOUNT}/{name}")
            }
        };
        let mut command = vec![interp.program];
        command.extend(interp.args);
        command.push(script_path);
        command.extend(ctx.positional_args.iter().cloned());
        Ok(command)
    }

    fn prepare(&self, ctx: &mut ExecutionContext) -> Result<PreparedRun, RuntimeError> {
        self.validate(ctx)?;
        let rc = ctx.runtime_config();
        let source_dir = ctx.file.dir();
        let mut cleanup = Cleanup::new();

        let base = self.resolve_image(ctx)?;
        let image = self.provision(ctx, base, &mut cleanup);
        if is_windows_image(&image) {
            return Err(RuntimeError::WindowsImage(image));
        }

        let command = Self::container_command(ctx, &source_dir, &mut cleanup)?;
        let mut env = self.env_builder.build(ctx)?;
        let mut extra_hosts = Vec::new();

        if rc.enable_host_access {
            let server = Arc::clone(self.host_access_server()?);
            let run_id = format!("{}-{}", ctx.command.name, ctx.execution_id);
            let info = server.connection_info(&run_id)?;
            let token = info.token.clone();
            let revoker = Arc::clone(&server);
            cleanup.defer(move || revoker.revoke_token(&token));
            host_access::inject_env(&mut env, &info, self.engine.host_gateway_name());
            extra_hosts.push(HOST_GATEWAY_MAPPING.to_owned());
        }

        let mut volumes = vec![format!("{}:{WORKSPACE_MOUNT}", source_dir.display())];
        volumes.extend(rc.volumes.iter().map(|v| resolve_volume(v, &source_dir)));

        let opts = RunOptions {
            image,
            command,
            workdir: Some(container_workdir(&ctx.effective_workdir(), &source_dir)),
            env,
            volumes,
            ports: rc.ports.clone(),
            remove: true,
            extra_hosts,
            ..RunOptions::default()
        };
        Ok(PreparedRun { opts, cleanup })
    }
}

/// Resolve a relative host path in a `host:container[:opts]` volume spec
/// against the command-source directory. Named volumes are left alone.
fn resolve_volume(spec: &str, source_dir: &Path) -> String {
    match spec.split_once(':') {
        Some((host, rest)) if host.starts_with('.') => {
            format!("{}:{rest}", source_dir.join(host).display())
        }
        _ => spec.to_owned(),
    }
}

impl Runtime for ContainerRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Container
    }

    fn available(&self) -> bool {
        self.engine.available()
    }

    fn validate(&self, ctx: &ExecutionContext) -> Result<(), RuntimeError> {
        ctx.script()?;
        let rc = ctx.runtime_config();
        match rc.image.as_deref().map(str::trim).filter(|i| !i.is_empty()) {
            Some(image) if is_windows_image(image) => {
                return Err(RuntimeError::WindowsImage(image.to_owned()));
            }
            Some(_) => {}
            None => {
                find_build_file(&ctx.file.dir(), rc.containerfile.as_deref())?;
            }
        }
        if rc.enable_host_access {
            self.host_access_server()?;
        }
        Ok(())
    }

    fn execute(&self, ctx: &mut ExecutionContext) -> ExecResult {
        let prepared = match self.prepare(ctx) {
            Ok(p) => p,
            Err(e) => return ExecResult::failure(e),
        };
        let result = run_with_retry(
            self.engine.as_ref(),
            &prepared.opts,
            &mut ctx.io,
            &ctx.cancel,
            &self.retry,
            self.gate.as_ref(),
        );
        prepared.cleanup.run();
        match result {
            Ok(r) => ExecResult::from_exit(r.exit_code),
            Err(e) => ExecResult::failure(e),
        }
    }

    fn as_capture(&self) -> Option<&dyn CaptureRuntime> {
        Some(self)
    }

    fn as_interactive(&self) -> Option<&dyn InteractiveRuntime> {
        Some(self)
    }
}

impl CaptureRuntime for ContainerRuntime {
    fn execute_capture(&self, ctx: &mut ExecutionContext) -> ExecResult {
        let prepared = match self.prepare(ctx) {
            Ok(p) => p,
            Err(e) => return ExecResult::failure(e),
        };
        let (mut io, out, err) = IoStreams::buffered();
        io.stdin = ctx.io.stdin.clone();
        let result = run_with_retry(
            self.engine.as_ref(),
            &prepared.opts,
            &mut io,
            &ctx.cancel,
            &self.retry,
            self.gate.as_ref(),
        );
        prepared.cleanup.run();
        let exec = match result {
            Ok(r) => ExecResult::from_exit(r.exit_code),
            Err(e) => ExecResult::failure(e),
        };
        exec.with_output(out.to_string_lossy(), err.to_string_lossy())
    }
}

impl InteractiveRuntime for ContainerRuntime {
    fn prepare_interactive(
        &self,
        ctx: &mut ExecutionContext,
    ) -> Result<PreparedCommand, RuntimeError> {
        let PreparedRun { mut opts, cleanup } = self.prepare(ctx)?;
        opts.interactive = true;
        opts.tty = std::io::stdin().is_terminal();
        let command = self.engine.interactive_command(&opts)?;
        Ok(PreparedCommand::new(command, cleanup))
    }
}
