//! Docker and Podman driven through their command-line interfaces.

use super::engine::{
    standard_run_args, BuildOptions, ContainerEngine, EngineError, RunIo, RunOptions, RunResult,
    SysctlOverrideChecker,
};
use crate::cancel::CancellationToken;
use crate::config::EnginePreference;
use crate::exit::ExitCode;
use crate::io::{InputSource, OutputSink};
use crate::prereq::find_in_path;
use crate::process::run_child;
use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempPath;
use tracing::{debug, warn};

const CONTAINERS_CONF_OVERRIDE: &str = "CONTAINERS_CONF_OVERRIDE";
const SYSCTL_OVERRIDE: &str = "[containers]\ndefault_sysctls = []\n";

/// Process plumbing shared by both CLIs.
#[derive(Debug)]
struct CliBase {
    name: &'static str,
    binary: PathBuf,
    env: Vec<(String, OsString)>,
}

impl CliBase {
    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }

    fn output(&self, args: &[&str]) -> Result<Output, EngineError> {
        self.command(args).output().map_err(|source| EngineError::Launch {
            program: self.name.to_owned(),
            source,
        })
    }

    /// Run to completion, returning stdout and mapping failure to
    /// [`EngineError::CommandFailed`].
    fn checked(&self, args: &[&str]) -> Result<String, EngineError> {
        let output = self.output(args)?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned());
        }
        Err(EngineError::CommandFailed {
            program: self.name.to_owned(),
            command: args.first().copied().unwrap_or_default().to_owned(),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        })
    }

    fn build(
        &self,
        opts: &BuildOptions,
        progress: &mut OutputSink,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let mut args: Vec<OsString> = vec![
            "build".into(),
            "-f".into(),
            opts.dockerfile.clone().into(),
            "-t".into(),
            opts.tag.clone().into(),
        ];
        if opts.no_cache {
            args.push("--no-cache".into());
        }
        for (key, value) in &opts.build_args {
            args.push("--build-arg".into());
            args.push(format!("{key}={value}").into());
        }
        args.push(opts.context_dir.clone().into());
        debug!("{} build -t {} {}", self.name, opts.tag, opts.context_dir.display());

        let (mut stderr, buffer) = OutputSink::buffer();
        let status = run_child(
            self.command(args),
            &InputSource::Null,
            progress,
            &mut stderr,
            cancel,
        )
        .map_err(EngineError::from_runtime)?;
        let _ = progress.write_all(&buffer.contents());
        if status.success() {
            return Ok(());
        }
        Err(EngineError::CommandFailed {
            program: self.name.to_owned(),
            command: "build".to_owned(),
            code: status.code().unwrap_or(-1),
            stderr: buffer.to_string_lossy().trim().to_owned(),
        })
    }

    fn run(
        &self,
        args: Vec<String>,
        io: RunIo<'_>,
        cancel: &CancellationToken,
    ) -> Result<RunResult, EngineError> {
        let status = run_child(self.command(args), io.stdin, io.stdout, io.stderr, cancel)
            .map_err(EngineError::from_runtime)?;
        let exit_code =
            ExitCode::from_status(status).map_err(|e| EngineError::Other(e.to_string()))?;
        Ok(RunResult { exit_code })
    }

    fn remove_image(&self, tag: &str, force: bool) -> Result<(), EngineError> {
        let mut args = vec!["rmi"];
        if force {
            args.push("-f");
        }
        args.push(tag);
        self.checked(&args).map(|_| ())
    }
}

#[derive(Debug)]
pub struct DockerEngine {
    base: CliBase,
}

impl DockerEngine {
    /// Locate `docker` on `PATH`.
    pub fn detect() -> Option<Self> {
        find_in_path("docker", None).map(Self::with_binary)
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            base: CliBase {
                name: "docker",
                binary: binary.into(),
                env: Vec::new(),
            },
        }
    }
}

impl ContainerEngine for DockerEngine {
    fn name(&self) -> &str {
        self.base.name
    }

    fn available(&self) -> bool {
        self.version().is_ok()
    }

    fn version(&self) -> Result<String, EngineError> {
        self.base
            .checked(&["version", "--format", "{{.Server.Version}}"])
    }

    fn build(
        &self,
        opts: &BuildOptions,
        progress: &mut OutputSink,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.base.build(opts, progress, cancel)
    }

    fn run(
        &self,
        opts: &RunOptions,
        io: RunIo<'_>,
        cancel: &CancellationToken,
    ) -> Result<RunResult, EngineError> {
        self.base.run(self.build_run_args(opts), io, cancel)
    }

    fn image_exists(&self, tag: &str) -> Result<bool, EngineError> {
        let output = self.base.output(&["image", "inspect", tag])?;
        Ok(output.status.success())
    }

    fn remove_image(&self, tag: &str, force: bool) -> Result<(), EngineError> {
        self.base.remove_image(tag, force)
    }

    fn binary_path(&self) -> Option<&Path> {
        Some(&self.base.binary)
    }

    fn build_run_args(&self, opts: &RunOptions) -> Vec<String> {
        standard_run_args(opts, &[], None)
    }

    fn interactive_command(&self, opts: &RunOptions) -> Result<Command, EngineError> {
        Ok(self.base.command(self.build_run_args(opts)))
    }
}

#[derive(Debug)]
pub struct PodmanEngine {
    base: CliBase,
    remote: bool,
    selinux: bool,
    conf_override: Option<TempPath>,
}

impl PodmanEngine {
    /// Locate `podman`, then `podman-remote`, on `PATH`.
    pub fn detect() -> Option<Self> {
        ["podman", "podman-remote"]
            .iter()
            .find_map(|name| find_in_path(name, None))
            .map(Self::with_binary)
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        let binary = binary.into();
        let remote = binary
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with("podman-remote"))
            || std::env::var_os("CONTAINER_HOST").is_some();
        let mut engine = Self {
            base: CliBase {
                name: "podman",
                binary,
                env: Vec::new(),
            },
            remote,
            selinux: Path::new("/sys/fs/selinux").exists(),
            conf_override: None,
        };
        if cfg!(target_os = "linux") && !remote {
            engine.install_sysctl_override();
        }
        engine
    }

    /// Clear the engine's default sysctls through a config override file so
    /// concurrent runs do not race on `ping_group_range`.
    fn install_sysctl_override(&mut self) {
        let written = tempfile::Builder::new()
            .prefix("hatch-containers-")
            .suffix(".conf")
            .tempfile()
            .and_then(|mut file| {
                file.write_all(SYSCTL_OVERRIDE.as_bytes())?;
                Ok(file.into_temp_path())
            });
        match written {
            Ok(path) => {
                self.base
                    .env
                    .push((CONTAINERS_CONF_OVERRIDE.to_owned(), path.as_os_str().to_owned()));
                self.conf_override = Some(path);
            }
            Err(e) => warn!("failed to write podman config override, runs will be serialized: {e}"),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }
}

impl SysctlOverrideChecker for PodmanEngine {
    fn sysctl_override_active(&self) -> bool {
        self.conf_override.is_some()
    }
}

impl ContainerEngine for PodmanEngine {
    fn name(&self) -> &str {
        self.base.name
    }

    fn available(&self) -> bool {
        self.version().is_ok()
    }

    fn version(&self) -> Result<String, EngineError> {
        self.base
            .checked(&["version", "--format", "{{.Client.Version}}"])
    }

    fn build(
        &self,
        opts: &BuildOptions,
        progress: &mut OutputSink,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        self.base.build(opts, progress, cancel)
    }

    fn run(
        &self,
        opts: &RunOptions,
        io: RunIo<'_>,
        cancel: &CancellationToken,
    ) -> Result<RunResult, EngineError> {
        self.base.run(self.build_run_args(opts), io, cancel)
    }

    fn image_exists(&self, tag: &str) -> Result<bool, EngineError> {
        let output = self.base.output(&["image", "exists", tag])?;
        Ok(output.status.success())
    }

    fn remove_image(&self, tag: &str, force: bool) -> Result<(), EngineError> {
        self.base.remove_image(tag, force)
    }

    fn binary_path(&self) -> Option<&Path> {
        Some(&self.base.binary)
    }

    fn build_run_args(&self, opts: &RunOptions) -> Vec<String> {
        let label = self.selinux.then_some("z");
        standard_run_args(opts, &["--userns=keep-id".to_owned()], label)
    }

    fn interactive_command(&self, opts: &RunOptions) -> Result<Command, EngineError> {
        Ok(self.base.command(self.build_run_args(opts)))
    }

    fn sysctl_override(&self) -> Option<&dyn SysctlOverrideChecker> {
        Some(self)
    }

    fn host_gateway_name(&self) -> &'static str {
        "host.containers.internal"
    }
}

/// Pick the preferred engine if it is installed and responding, otherwise the
/// other one.
pub fn select_engine(preferred: EnginePreference) -> Result<Box<dyn ContainerEngine>, EngineError> {
    let order = match preferred {
        EnginePreference::Podman => [EnginePreference::Podman, EnginePreference::Docker],
        EnginePreference::Docker => [EnginePreference::Docker, EnginePreference::Podman],
    };
    for pref in order {
        let engine: Option<Box<dyn ContainerEngine>> = match pref {
            EnginePreference::Podman => {
                PodmanEngine::detect().map(|e| Box::new(e) as Box<dyn ContainerEngine>)
            }
            EnginePreference::Docker => {
                DockerEngine::detect().map(|e| Box::new(e) as Box<dyn ContainerEngine>)
            }
        };
        match engine {
            Some(engine) if engine.available() => {
                debug!("selected container engine {}", engine.name());
                return Ok(engine);
            }
            Some(engine) => debug!("{} found but not responding", engine.name()),
            None => debug!("{pref} not found on PATH"),
        }
    }
    Err(EngineError::NotAvailable(format!(
        "{}, {}",
        order[0].as_str(),
        order[1].as_str()
    )))
}
