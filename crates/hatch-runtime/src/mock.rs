//! Scripted in-memory container engine for tests.
//!
//! Runs either replay queued [`MockAttempt`]s or, once the queue is empty,
//! execute `/bin/sh -c` commands with the embedded shell against the host
//! directory mounted at `/workspace`.

use crate::cancel::CancellationToken;
use crate::container::engine::{
    standard_run_args, BuildOptions, ContainerEngine, EngineError, RunIo, RunOptions, RunResult,
    SysctlOverrideChecker,
};
use crate::container::workdir::WORKSPACE_MOUNT;
use crate::container::CONTAINER_SHELL;
use crate::exit::ExitCode;
use crate::io::{IoStreams, OutputSink};
use crate::shell::{self, Shell, ShellError};
use std::collections::{BTreeSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// One scripted outcome of [`MockEngine::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockAttempt {
    pub exit_code: u8,
    pub stdout: String,
    pub stderr: String,
    /// Fail the run itself with this engine error message.
    pub error: Option<String>,
}

impl MockAttempt {
    pub fn exit(code: u8) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_stdout(mut self, s: impl Into<String>) -> Self {
        self.stdout = s.into();
        self
    }

    #[must_use]
    pub fn with_stderr(mut self, s: impl Into<String>) -> Self {
        self.stderr = s.into();
        self
    }
}

#[derive(Debug, Default)]
struct MockState {
    attempts: VecDeque<MockAttempt>,
    images: BTreeSet<String>,
    runs: Vec<RunOptions>,
    builds: Vec<BuildOptions>,
}

#[derive(Debug)]
pub struct MockEngine {
    name: String,
    available: bool,
    sysctl_capable: bool,
    sysctl_active: AtomicBool,
    fail_builds: bool,
    state: Mutex<MockState>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self {
            name: "mock".to_owned(),
            available: true,
            sysctl_capable: false,
            sysctl_active: AtomicBool::new(false),
            fail_builds: false,
            state: Mutex::new(MockState::default()),
        }
    }
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Expose the sysctl capability, reporting the override as `active`.
    #[must_use]
    pub fn with_sysctl_override(mut self, active: bool) -> Self {
        self.sysctl_capable = true;
        self.sysctl_active = AtomicBool::new(active);
        self
    }

    /// Change what the sysctl capability reports from now on.
    pub fn set_sysctl_override(&self, active: bool) {
        self.sysctl_active.store(active, Ordering::SeqCst);
    }

    #[must_use]
    pub fn failing_builds(mut self) -> Self {
        self.fail_builds = true;
        self
    }

    #[must_use]
    pub fn with_attempts(self, attempts: impl IntoIterator<Item = MockAttempt>) -> Self {
        self.lock().attempts.extend(attempts);
        self
    }

    #[must_use]
    pub fn with_image(self, tag: impl Into<String>) -> Self {
        self.lock().images.insert(tag.into());
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn runs(&self) -> Vec<RunOptions> {
        self.lock().runs.clone()
    }

    pub fn run_count(&self) -> usize {
        self.lock().runs.len()
    }

    pub fn builds(&self) -> Vec<BuildOptions> {
        self.lock().builds.clone()
    }

    pub fn has_image(&self, tag: &str) -> bool {
        self.lock().images.contains(tag)
    }

    fn replay(attempt: MockAttempt, io: RunIo<'_>) -> Result<RunResult, EngineError> {
        if let Some(message) = attempt.error {
            return Err(EngineError::Other(message));
        }
        let _ = io.stdout.write_all(attempt.stdout.as_bytes());
        let _ = io.stderr.write_all(attempt.stderr.as_bytes());
        Ok(RunResult {
            exit_code: ExitCode::from(attempt.exit_code),
        })
    }

    /// Run `sh -c script arg0 args...` with the embedded shell.
    fn interpret(
        opts: &RunOptions,
        io: RunIo<'_>,
        cancel: &CancellationToken,
    ) -> Result<RunResult, EngineError> {
        let (script, arg0, args) = match opts.command.as_slice() {
            [sh, flag, script, rest @ ..] if sh == CONTAINER_SHELL && flag == "-c" => {
                let (arg0, args) = rest
                    .split_first()
                    .map_or(("sh", &[][..]), |(a, r)| (a.as_str(), r));
                (script, arg0, args)
            }
            _ => {
                let _ = writeln!(
                    io.stderr,
                    "mock engine: cannot run {}",
                    opts.command.first().map_or("", String::as_str)
                );
                return Ok(RunResult {
                    exit_code: ExitCode::from(127),
                });
            }
        };

        let program = match shell::parse(script) {
            Ok(p) => p,
            Err(e) => {
                let _ = writeln!(io.stderr, "sh: {e}");
                return Ok(RunResult {
                    exit_code: ExitCode::from(2),
                });
            }
        };
        let cwd = host_workdir(opts);
        let mut sh = Shell::new(cwd, opts.env.clone())
            .with_arg0(arg0)
            .with_args(args.to_vec())
            .with_cancel(cancel.clone());

        let mut streams = IoStreams {
            stdin: io.stdin.clone(),
            stdout: std::mem::replace(io.stdout, OutputSink::Null),
            stderr: std::mem::replace(io.stderr, OutputSink::Null),
        };
        let outcome = sh.run(&program, &mut streams);
        *io.stdout = streams.stdout;
        *io.stderr = streams.stderr;

        match outcome {
            Ok(exit_code) => Ok(RunResult { exit_code }),
            Err(ShellError::Cancelled) => Err(EngineError::Cancelled(
                "container run cancelled".to_owned(),
            )),
            Err(e) => {
                let _ = writeln!(io.stderr, "sh: {e}");
                Ok(RunResult {
                    exit_code: ExitCode::FAILURE,
                })
            }
        }
    }
}

/// Host directory corresponding to the run's working directory.
fn host_workdir(opts: &RunOptions) -> PathBuf {
    let mount = opts.volumes.iter().find_map(|v| {
        let (host, rest) = v.split_once(':')?;
        let target = rest.split(':').next()?;
        (target == WORKSPACE_MOUNT).then(|| PathBuf::from(host))
    });
    let (Some(host), Some(dir)) = (mount, opts.workdir.as_deref()) else {
        return std::env::temp_dir();
    };
    match Path::new(dir).strip_prefix(WORKSPACE_MOUNT) {
        Ok(rel) => host.join(rel),
        Err(_) => std::env::temp_dir(),
    }
}

impl SysctlOverrideChecker for MockEngine {
    fn sysctl_override_active(&self) -> bool {
        self.sysctl_active.load(Ordering::SeqCst)
    }
}

impl ContainerEngine for MockEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn available(&self) -> bool {
        self.available
    }

    fn version(&self) -> Result<String, EngineError> {
        if self.available {
            Ok("0.0.0-mock".to_owned())
        } else {
            Err(EngineError::NotAvailable(self.name.clone()))
        }
    }

    fn build(
        &self,
        opts: &BuildOptions,
        progress: &mut OutputSink,
        _cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.builds.push(opts.clone());
        if self.fail_builds {
            return Err(EngineError::CommandFailed {
                program: self.name.clone(),
                command: "build".to_owned(),
                code: 1,
                stderr: "mock build failure".to_owned(),
            });
        }
        let _ = writeln!(progress, "mock build {}", opts.tag);
        state.images.insert(opts.tag.clone());
        Ok(())
    }

    fn run(
        &self,
        opts: &RunOptions,
        io: RunIo<'_>,
        cancel: &CancellationToken,
    ) -> Result<RunResult, EngineError> {
        let scripted = {
            let mut state = self.lock();
            state.runs.push(opts.clone());
            state.attempts.pop_front()
        };
        match scripted {
            Some(attempt) => Self::replay(attempt, io),
            None => Self::interpret(opts, io, cancel),
        }
    }

    fn image_exists(&self, tag: &str) -> Result<bool, EngineError> {
        Ok(self.has_image(tag))
    }

    fn remove_image(&self, tag: &str, force: bool) -> Result<(), EngineError> {
        if self.lock().images.remove(tag) || force {
            Ok(())
        } else {
            Err(EngineError::Other(format!("no such image: {tag}")))
        }
    }

    fn build_run_args(&self, opts: &RunOptions) -> Vec<String> {
        standard_run_args(opts, &[], None)
    }

    fn interactive_command(&self, opts: &RunOptions) -> Result<std::process::Command, EngineError> {
        let mut cmd = std::process::Command::new(&self.name);
        cmd.args(self.build_run_args(opts));
        Ok(cmd)
    }

    fn sysctl_override(&self) -> Option<&dyn SysctlOverrideChecker> {
        self.sysctl_capable.then_some(self as &dyn SysctlOverrideChecker)
    }
}
