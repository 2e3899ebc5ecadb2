//! Host-shell backend.

use crate::backend::{CaptureRuntime, InteractiveRuntime, PreparedCommand, Runtime};
use crate::cleanup::Cleanup;
use crate::context::ExecutionContext;
use crate::env::{DefaultEnvBuilder, EnvBuilder};
use crate::exit::ExecResult;
use crate::io::OutputSink;
use crate::prereq::{find_in_path, format_missing, missing_shells};
use crate::process::run_child;
use crate::RuntimeError;
use hatch_schema::interpreter::base_name;
use hatch_schema::{InterpreterSpec, RuntimeKind};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::TempPath;
use tracing::{debug, warn};

/// Placeholder passed as `$0` to POSIX shells.
pub const ARG0_PLACEHOLDER: &str = "hatch";

/// How a shell expects a script and its positional arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellDialect {
    Posix,
    PowerShell,
    Cmd,
}

impl ShellDialect {
    pub fn of(shell: &str) -> Self {
        match base_name(shell).to_ascii_lowercase().as_str() {
            "pwsh" | "powershell" => Self::PowerShell,
            "cmd" => Self::Cmd,
            _ => Self::Posix,
        }
    }

    /// Arguments that make the shell run `script` with `args` as its
    /// positional parameters.
    pub fn args(self, script: &str, args: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(args.len() + 4);
        match self {
            Self::Posix => {
                out.extend(["-c".to_owned(), script.to_owned(), ARG0_PLACEHOLDER.to_owned()]);
                out.extend(args.iter().cloned());
            }
            Self::PowerShell => {
                out.extend([
                    "-NoProfile".to_owned(),
                    "-Command".to_owned(),
                    script.to_owned(),
                ]);
                out.extend(args.iter().cloned());
            }
            Self::Cmd => {
                // cmd.exe has no way to receive positional parameters.
                if !args.is_empty() {
                    warn!(
                        "cmd does not support positional arguments, dropping {}",
                        args.len()
                    );
                }
                out.extend(["/C".to_owned(), script.to_owned()]);
            }
        }
        out
    }
}

/// Check that `dir` can be used as a working directory.
pub(crate) fn validate_workdir(dir: &Path) -> Result<(), RuntimeError> {
    let shown = dir.display();
    let meta = match std::fs::metadata(dir) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(RuntimeError::WorkDir(format!("directory does not exist: {shown}")));
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(RuntimeError::WorkDir(format!("permission denied: {shown}")));
        }
        Err(e) => return Err(RuntimeError::WorkDir(format!("{shown}: {e}"))),
    };
    if !meta.is_dir() {
        return Err(RuntimeError::WorkDir(format!("not a directory: {shown}")));
    }
    if let Err(e) = std::fs::read_dir(dir) {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            return Err(RuntimeError::WorkDir(format!("permission denied: {shown}")));
        }
    }
    Ok(())
}

/// Write `content` to a fresh private file named after `interpreter`'s
/// conventional extension. The file is removed when the returned path drops.
pub(crate) fn write_temp_script(
    dir: Option<&Path>,
    interpreter: &InterpreterSpec,
    content: &str,
) -> Result<TempPath, RuntimeError> {
    let mut builder = tempfile::Builder::new();
    builder
        .prefix("hatch-script-")
        .suffix(interpreter.script_extension());
    let file = match dir {
        Some(d) => builder.tempfile_in(d)?,
        None => builder.tempfile()?,
    };
    std::fs::write(file.path(), content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(file.into_temp_path())
}

/// A fully-built host process plus what must outlive it.
struct Launch {
    command: Command,
    cleanup: Cleanup,
}

/// Runs scripts through the host's shell or a declared interpreter.
#[derive(Clone)]
pub struct NativeRuntime {
    shell: Option<String>,
    env_builder: Arc<dyn EnvBuilder>,
}

impl Default for NativeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NativeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeRuntime")
            .field("shell", &self.shell)
            .finish_non_exhaustive()
    }
}

impl NativeRuntime {
    pub fn new() -> Self {
        Self {
            shell: None,
            env_builder: Arc::new(DefaultEnvBuilder::new()),
        }
    }

    /// Always use `shell` instead of searching the platform defaults.
    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    #[must_use]
    pub fn with_env_builder(mut self, builder: Arc<dyn EnvBuilder>) -> Self {
        self.env_builder = builder;
        self
    }

    fn shell_candidates(&self) -> Vec<String> {
        if let Some(shell) = &self.shell {
            return vec![shell.clone()];
        }
        if cfg!(windows) {
            return ["pwsh", "powershell", "cmd"].map(str::to_owned).to_vec();
        }
        let mut candidates = Vec::with_capacity(3);
        if let Some(user_shell) = std::env::var("SHELL").ok().filter(|s| !s.is_empty()) {
            candidates.push(user_shell);
        }
        for fallback in ["bash", "sh"] {
            if !candidates.iter().any(|c| c == fallback) {
                candidates.push(fallback.to_owned());
            }
        }
        candidates
    }

    /// First usable shell in resolution order.
    pub fn resolve_shell(&self) -> Result<PathBuf, RuntimeError> {
        let candidates = self.shell_candidates();
        for candidate in &candidates {
            if let Some(path) = find_in_path(candidate, None) {
                debug!("using shell {}", path.display());
                return Ok(path);
            }
        }
        Err(RuntimeError::ShellNotFound(format_missing(&missing_shells(
            &candidates,
        ))))
    }

    fn prepare(&self, ctx: &ExecutionContext) -> Result<Launch, RuntimeError> {
        let script = ctx.script()?;
        let workdir = ctx.effective_workdir();
        validate_workdir(&workdir)?;
        let env = self.env_builder.build(ctx)?;

        let mut cleanup = Cleanup::new();
        let mut command = match ctx.interpreter(&script) {
            Some(interp) => {
                let program = find_in_path(&interp.program, None)
                    .ok_or_else(|| RuntimeError::InterpreterNotFound(interp.program.clone()))?;
                let script_path = match ctx.implementation.script_path(&ctx.file) {
                    Some(path) => path,
                    None => {
                        let temp = write_temp_script(None, &interp, &script)?;
                        let path = temp.to_path_buf();
                        cleanup.defer(move || {
                            let _ = temp.close();
                        });
                        path
                    }
                };
                debug!(
                    "running {} with interpreter {}",
                    script_path.display(),
                    program.display()
                );
                let mut cmd = Command::new(program);
                cmd.args(&interp.args)
                    .arg(script_path)
                    .args(&ctx.positional_args);
                cmd
            }
            None => {
                let shell = self.resolve_shell()?;
                let dialect = ShellDialect::of(&shell.to_string_lossy());
                let mut cmd = Command::new(&shell);
                cmd.args(dialect.args(&script, &ctx.positional_args));
                cmd
            }
        };
        command.env_clear().envs(&env).current_dir(&workdir);
        Ok(Launch { command, cleanup })
    }
}

impl Runtime for NativeRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Native
    }

    fn available(&self) -> bool {
        true
    }

    fn validate(&self, ctx: &ExecutionContext) -> Result<(), RuntimeError> {
        let script = ctx.script()?;
        validate_workdir(&ctx.effective_workdir())?;
        match ctx.interpreter(&script) {
            Some(interp) => {
                find_in_path(&interp.program, None)
                    .ok_or(RuntimeError::InterpreterNotFound(interp.program))?;
            }
            None => {
                self.resolve_shell()?;
            }
        }
        Ok(())
    }

    fn execute(&self, ctx: &mut ExecutionContext) -> ExecResult {
        let launch = match self.prepare(ctx) {
            Ok(l) => l,
            Err(e) => return ExecResult::failure(e),
        };
        let io = &mut ctx.io;
        let status = run_child(
            launch.command,
            &io.stdin,
            &mut io.stdout,
            &mut io.stderr,
            &ctx.cancel,
        );
        drop(launch.cleanup);
        ExecResult::from_status(status)
    }

    fn as_capture(&self) -> Option<&dyn CaptureRuntime> {
        Some(self)
    }

    fn as_interactive(&self) -> Option<&dyn InteractiveRuntime> {
        Some(self)
    }
}

impl CaptureRuntime for NativeRuntime {
    fn execute_capture(&self, ctx: &mut ExecutionContext) -> ExecResult {
        let launch = match self.prepare(ctx) {
            Ok(l) => l,
            Err(e) => return ExecResult::failure(e),
        };
        let (mut stdout, out) = OutputSink::buffer();
        let (mut stderr, err) = OutputSink::buffer();
        let status = run_child(
            launch.command,
            &ctx.io.stdin,
            &mut stdout,
            &mut stderr,
            &ctx.cancel,
        );
        drop(launch.cleanup);
        ExecResult::from_status(status).with_output(out.to_string_lossy(), err.to_string_lossy())
    }
}

impl InteractiveRuntime for NativeRuntime {
    fn prepare_interactive(
        &self,
        ctx: &mut ExecutionContext,
    ) -> Result<PreparedCommand, RuntimeError> {
        let launch = self.prepare(ctx)?;
        Ok(PreparedCommand::new(launch.command, launch.cleanup))
    }
}
