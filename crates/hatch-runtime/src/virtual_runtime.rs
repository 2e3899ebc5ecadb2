//! Embedded-shell backend.

use crate::backend::{CaptureRuntime, InteractiveRuntime, PreparedCommand, Runtime};
use crate::cancel::CancellationToken;
use crate::cleanup::Cleanup;
use crate::context::ExecutionContext;
use crate::env::{DefaultEnvBuilder, EnvBuilder};
use crate::exit::{ExecResult, ExitCode};
use crate::io::{IoStreams, OutputSink};
use crate::native::validate_workdir;
use crate::shell::{self, Program, Shell};
use crate::RuntimeError;
use hatch_schema::interpreter::INTERPRETER_AUTO;
use hatch_schema::RuntimeKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Hidden subcommand of the `hatch` binary that runs a serialized
/// [`VirtualInvocation`].
pub const EXEC_VIRTUAL_SUBCOMMAND: &str = "__exec-virtual";

/// Everything needed to run a virtual script in another process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualInvocation {
    pub script: String,
    pub workdir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub args: Vec<String>,
}

impl VirtualInvocation {
    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RuntimeError::Invocation(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| RuntimeError::Invocation(format!("{}: {e}", path.display())))
    }

    pub fn run(&self, io: &mut IoStreams, cancel: &CancellationToken) -> ExecResult {
        let program = match shell::parse(&self.script) {
            Ok(p) => p,
            Err(e) => return ExecResult::failure(e),
        };
        let mut shell = Shell::new(&self.workdir, self.env.clone())
            .with_args(self.args.clone())
            .with_cancel(cancel.clone());
        match shell.run(&program, io) {
            Ok(code) => ExecResult::from_exit(code),
            Err(e) => ExecResult::failure(e),
        }
    }
}

/// Load and run an invocation file with the process's own streams.
pub fn run_invocation(path: &Path, cancel: &CancellationToken) -> ExecResult {
    match VirtualInvocation::load(path) {
        Ok(invocation) => invocation.run(&mut IoStreams::default(), cancel),
        Err(e) => ExecResult::failure(e),
    }
}

/// Runs scripts with the embedded shell. External commands inside the
/// script still spawn host processes.
#[derive(Clone)]
pub struct VirtualRuntime {
    env_builder: Arc<dyn EnvBuilder>,
    executable: Option<PathBuf>,
}

impl Default for VirtualRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VirtualRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualRuntime")
            .field("executable", &self.executable)
            .finish_non_exhaustive()
    }
}

struct Prepared {
    program: Program,
    shell: Shell,
    invocation: VirtualInvocation,
}

impl VirtualRuntime {
    pub fn new() -> Self {
        Self {
            env_builder: Arc::new(DefaultEnvBuilder::new()),
            executable: None,
        }
    }

    #[must_use]
    pub fn with_env_builder(mut self, builder: Arc<dyn EnvBuilder>) -> Self {
        self.env_builder = builder;
        self
    }

    /// Binary re-invoked for interactive sessions instead of the current
    /// executable.
    #[must_use]
    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    fn reject_interpreter(ctx: &ExecutionContext) -> Result<(), RuntimeError> {
        match ctx.runtime_config().interpreter {
            Some(i) if !i.trim().is_empty() && i.trim() != INTERPRETER_AUTO => {
                Err(RuntimeError::InterpreterNotAllowed(i))
            }
            _ => Ok(()),
        }
    }

    fn prepare(&self, ctx: &ExecutionContext) -> Result<Prepared, RuntimeError> {
        Self::reject_interpreter(ctx)?;
        let script = ctx.script()?;
        let program = shell::parse(&script)?;
        let workdir = ctx.effective_workdir();
        validate_workdir(&workdir)?;
        let env = self.env_builder.build(ctx)?;
        debug!("virtual shell in {}", workdir.display());

        let shell = Shell::new(&workdir, env.clone())
            .with_args(ctx.positional_args.clone())
            .with_cancel(ctx.cancel.clone());
        Ok(Prepared {
            program,
            shell,
            invocation: VirtualInvocation {
                script,
                workdir,
                env,
                args: ctx.positional_args.clone(),
            },
        })
    }

    fn finish(result: Result<ExitCode, shell::ShellError>) -> ExecResult {
        match result {
            Ok(code) => ExecResult::from_exit(code),
            Err(e) => ExecResult::failure(e),
        }
    }
}

impl Runtime for VirtualRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Virtual
    }

    fn available(&self) -> bool {
        true
    }

    fn validate(&self, ctx: &ExecutionContext) -> Result<(), RuntimeError> {
        Self::reject_interpreter(ctx)?;
        let script = ctx.script()?;
        shell::check_syntax(&script)?;
        validate_workdir(&ctx.effective_workdir())
    }

    fn execute(&self, ctx: &mut ExecutionContext) -> ExecResult {
        let mut prepared = match self.prepare(ctx) {
            Ok(p) => p,
            Err(e) => return ExecResult::failure(e),
        };
        Self::finish(prepared.shell.run(&prepared.program, &mut ctx.io))
    }

    fn as_capture(&self) -> Option<&dyn CaptureRuntime> {
        Some(self)
    }

    fn as_interactive(&self) -> Option<&dyn InteractiveRuntime> {
        Some(self)
    }
}

impl CaptureRuntime for VirtualRuntime {
    fn execute_capture(&self, ctx: &mut ExecutionContext) -> ExecResult {
        let mut prepared = match self.prepare(ctx) {
            Ok(p) => p,
            Err(e) => return ExecResult::failure(e),
        };
        let (stdout, out) = OutputSink::buffer();
        let (stderr, err) = OutputSink::buffer();
        let mut io = IoStreams {
            stdin: ctx.io.stdin.clone(),
            stdout,
            stderr,
        };
        Self::finish(prepared.shell.run(&prepared.program, &mut io))
            .with_output(out.to_string_lossy(), err.to_string_lossy())
    }
}

impl InteractiveRuntime for VirtualRuntime {
    fn prepare_interactive(
        &self,
        ctx: &mut ExecutionContext,
    ) -> Result<PreparedCommand, RuntimeError> {
        let prepared = self.prepare(ctx)?;
        let executable = match &self.executable {
            Some(path) => path.clone(),
            None => std::env::current_exe()?,
        };

        let mut file = tempfile::Builder::new()
            .prefix("hatch-virtual-")
            .suffix(".json")
            .tempfile()?;
        let json = serde_json::to_vec(&prepared.invocation)
            .map_err(|e| RuntimeError::Invocation(e.to_string()))?;
        file.write_all(&json)?;
        let path = file.into_temp_path();

        let mut command = std::process::Command::new(executable);
        command
            .arg(EXEC_VIRTUAL_SUBCOMMAND)
            .arg("--invocation")
            .arg(&*path)
            .current_dir(&prepared.invocation.workdir);

        let mut cleanup = Cleanup::new();
        cleanup.defer(move || {
            let _ = path.close();
        });
        Ok(PreparedCommand::new(command, cleanup))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use hatch_schema::{Command, CommandFile, Implementation, RuntimeConfig};

    fn ctx(dir: &Path, script: &str) -> ExecutionContext {
        ExecutionContext::new(
            CommandFile::new(dir.join("hatch.toml")),
            Command::new("demo"),
            Implementation::new(script, RuntimeConfig::new(RuntimeKind::Virtual)),
        )
    }

    fn runtime() -> VirtualRuntime {
        let mut host = vec![("ARG1".to_owned(), "leaked".to_owned())];
        if let Some(path) = std::env::var_os("PATH") {
            host.push(("PATH".to_owned(), path.to_string_lossy().into_owned()));
        }
        VirtualRuntime::new()
            .with_env_builder(Arc::new(DefaultEnvBuilder::new().with_host_env(host)))
    }

    #[test]
    fn capture_hello() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ctx(dir.path(), "echo 'Hello'");
        let r = runtime().execute_capture(&mut c);
        assert!(r.is_success(), "{:?}", r.error);
        assert_eq!(r.output.trim_end(), "Hello");
    }

    #[test]
    fn exit_code_is_propagated() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ctx(dir.path(), "exit 42").with_io(IoStreams::null());
        let r = runtime().execute(&mut c);
        assert_eq!(r.exit_code, ExitCode::from(42));
        assert!(r.error.is_none());
    }

    #[test]
    fn positional_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ctx(
            dir.path(),
            r#"echo "arg1=$1"; echo "arg2=$2"; echo "count=$#""#,
        )
        .with_args(["hello", "world"]);
        let r = runtime().execute_capture(&mut c);
        assert_eq!(r.output, "arg1=hello\narg2=world\ncount=2\n");
    }

    #[test]
    fn internal_variables_do_not_leak() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ctx(dir.path(), r#"echo "[${ARG1:-unset}]""#);
        let r = runtime().execute_capture(&mut c);
        assert_eq!(r.output, "[unset]\n");
    }

    #[test]
    fn errexit_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ctx(dir.path(), "set -e\necho before\nfalse\necho after");
        let r = runtime().execute_capture(&mut c);
        assert_eq!(r.exit_code, ExitCode::FAILURE);
        assert!(r.error.is_none());
        assert_eq!(r.output, "before\n");
    }

    #[test]
    fn functions_case_and_substitutions() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"
kind() {
  case "$1" in
    *.rs) echo rust ;;
    *) echo other ;;
  esac
}
for f in "$@"; do
  echo "$f: $(kind "$f") ${#f} $(( ${#f} * 2 ))"
done
"#;
        let mut c = ctx(dir.path(), script).with_args(["lib.rs", "x"]);
        let r = runtime().execute_capture(&mut c);
        assert!(r.is_success(), "{:?}", r.error);
        assert_eq!(r.output, "lib.rs: rust 6 12\nx: other 1 2\n");
    }

    #[test]
    fn interpreter_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ctx(dir.path(), "print(1)");
        c.implementation.runtimes[0].interpreter = Some("python3".into());
        let rt = runtime();
        assert!(matches!(
            rt.validate(&c),
            Err(RuntimeError::InterpreterNotAllowed(ref i)) if i == "python3"
        ));
        let r = rt.execute(&mut c);
        assert_eq!(r.exit_code, ExitCode::FAILURE);
        assert!(matches!(r.error, Some(RuntimeError::InterpreterNotAllowed(_))));
    }

    #[test]
    fn syntax_errors_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(dir.path(), "if true; then echo");
        let err = runtime().validate(&c).unwrap_err();
        assert!(err.to_string().contains("syntax error"));
    }

    #[test]
    fn interactive_invocation_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ctx(dir.path(), "echo \"$1\"").with_args(["x"]);
        let prepared = runtime()
            .with_executable("/usr/local/bin/hatch")
            .prepare_interactive(&mut c)
            .unwrap();
        let args: Vec<_> = prepared.command.get_args().map(|a| a.to_owned()).collect();
        assert_eq!(args[0], EXEC_VIRTUAL_SUBCOMMAND);
        assert_eq!(args[1], "--invocation");
        let path = PathBuf::from(&args[2]);

        let invocation = VirtualInvocation::load(&path).unwrap();
        assert_eq!(invocation.args, vec!["x".to_owned()]);
        let (mut io, out, _) = IoStreams::buffered();
        let r = invocation.run(&mut io, &CancellationToken::new());
        assert!(r.is_success());
        assert_eq!(out.to_string_lossy(), "x\n");

        prepared.finish();
        assert!(!path.exists());
    }
}
