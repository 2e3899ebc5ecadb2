//! Boundary between the container runtime and a concrete container engine.

use crate::cancel::CancellationToken;
use crate::exit::ExitCode;
use crate::io::{InputSource, OutputSink};
use crate::RuntimeError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Engine stderr fragments that identify failures of the engine itself rather
/// than of the containerized program.
const TRANSIENT_MARKERS: &[&str] = &[
    "ping_group_range",
    "error creating overlay mount",
    "device or resource busy",
];

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no container engine available (tried: {0})")]
    NotAvailable(String),
    #[error("failed to execute '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} {command} failed with exit code {code}: {stderr}")]
    CommandFailed {
        program: String,
        command: String,
        code: i32,
        stderr: String,
    },
    #[error("{0}")]
    Cancelled(String),
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        let message = match self {
            Self::CommandFailed { stderr, .. } => stderr.as_str(),
            Self::Other(message) => message.as_str(),
            _ => return false,
        };
        let lower = message.to_lowercase();
        TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
    }

    pub(crate) fn from_runtime(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Launch { program, source } => Self::Launch { program, source },
            RuntimeError::Cancelled(message) => Self::Cancelled(message),
            RuntimeError::Engine(e) => e,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOptions {
    pub context_dir: PathBuf,
    pub dockerfile: PathBuf,
    pub tag: String,
    pub no_cache: bool,
    pub build_args: BTreeMap<String, String>,
}

/// One container run. Streams travel separately in [`RunIo`] so each retry
/// attempt can route stderr into its own buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub image: String,
    pub command: Vec<String>,
    pub workdir: Option<String>,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<String>,
    pub ports: Vec<String>,
    pub remove: bool,
    pub name: Option<String>,
    pub interactive: bool,
    pub tty: bool,
    pub extra_hosts: Vec<String>,
}

pub struct RunIo<'a> {
    pub stdin: &'a InputSource,
    pub stdout: &'a mut OutputSink,
    pub stderr: &'a mut OutputSink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunResult {
    pub exit_code: ExitCode,
}

/// Reports whether the engine has a workaround active for concurrent
/// containers racing on `net.ipv4.ping_group_range`. Runs against an engine
/// exposing this capability with the override inactive are serialized.
pub trait SysctlOverrideChecker {
    fn sysctl_override_active(&self) -> bool;
}

pub trait ContainerEngine: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    fn version(&self) -> Result<String, EngineError>;

    /// Build an image, streaming build output into `progress`.
    fn build(
        &self,
        opts: &BuildOptions,
        progress: &mut OutputSink,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError>;

    /// Run a container to completion. A non-zero exit of the containerized
    /// program is a normal [`RunResult`]; only failures to drive the engine
    /// are errors.
    fn run(
        &self,
        opts: &RunOptions,
        io: RunIo<'_>,
        cancel: &CancellationToken,
    ) -> Result<RunResult, EngineError>;

    fn image_exists(&self, tag: &str) -> Result<bool, EngineError>;

    fn remove_image(&self, tag: &str, force: bool) -> Result<(), EngineError>;

    fn binary_path(&self) -> Option<&Path> {
        None
    }

    /// Full argument vector for `run`, without the binary.
    fn build_run_args(&self, opts: &RunOptions) -> Vec<String>;

    /// A ready-to-spawn process for an attached session.
    fn interactive_command(&self, opts: &RunOptions) -> Result<std::process::Command, EngineError>;

    fn sysctl_override(&self) -> Option<&dyn SysctlOverrideChecker> {
        None
    }

    /// Hostname through which containers reach the host.
    fn host_gateway_name(&self) -> &'static str {
        "host.docker.internal"
    }
}

/// Arguments shared by every docker-compatible CLI. `extra` is inserted just
/// before the image.
pub fn standard_run_args(opts: &RunOptions, extra: &[String], volume_label: Option<&str>) -> Vec<String> {
    let mut args = vec!["run".to_owned()];
    if opts.remove {
        args.push("--rm".to_owned());
    }
    if let Some(name) = &opts.name {
        args.push("--name".to_owned());
        args.push(name.clone());
    }
    if let Some(dir) = &opts.workdir {
        args.push("-w".to_owned());
        args.push(dir.clone());
    }
    if opts.interactive {
        args.push("-i".to_owned());
    }
    if opts.tty {
        args.push("-t".to_owned());
    }
    for (key, value) in &opts.env {
        args.push("-e".to_owned());
        args.push(format!("{key}={value}"));
    }
    for volume in &opts.volumes {
        args.push("-v".to_owned());
        args.push(match volume_label {
            Some(label) => label_volume(volume, label),
            None => volume.clone(),
        });
    }
    for port in &opts.ports {
        args.push("-p".to_owned());
        args.push(port.clone());
    }
    for host in &opts.extra_hosts {
        args.push("--add-host".to_owned());
        args.push(host.clone());
    }
    args.extend(extra.iter().cloned());
    args.push(opts.image.clone());
    args.extend(opts.command.iter().cloned());
    args
}

/// Append `label` to a `host:container[:opts]` volume spec unless it already
/// carries an SELinux label.
fn label_volume(volume: &str, label: &str) -> String {
    let parts: Vec<&str> = volume.split(':').collect();
    match parts.len() {
        0 | 1 => volume.to_owned(),
        2 => format!("{volume}:{label}"),
        _ => {
            let opts = parts[parts.len() - 1];
            if opts.split(',').any(|o| o == "z" || o == "Z") {
                volume.to_owned()
            } else {
                format!("{volume},{label}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_markers() {
        let err = EngineError::CommandFailed {
            program: "podman".into(),
            command: "run".into(),
            code: 126,
            stderr: "Error: crun: write to `/proc/sys/net/ipv4/ping_group_range`: Invalid argument"
                .into(),
        };
        assert!(err.is_transient());
        assert!(EngineError::Other("Device or resource busy".into()).is_transient());
        assert!(!EngineError::Other("image not known".into()).is_transient());
        assert!(!EngineError::NotAvailable("podman, docker".into()).is_transient());
    }

    #[test]
    fn run_args_order() {
        let mut env = BTreeMap::new();
        env.insert("B".into(), "2".into());
        env.insert("A".into(), "1".into());
        let opts = RunOptions {
            image: "alpine:3".into(),
            command: vec!["/bin/sh".into(), "-c".into(), "true".into()],
            workdir: Some("/workspace".into()),
            env,
            volumes: vec!["/src:/workspace".into()],
            ports: vec!["8080:80".into()],
            remove: true,
            extra_hosts: vec!["host.docker.internal:host-gateway".into()],
            ..RunOptions::default()
        };
        let args = standard_run_args(&opts, &["--userns=keep-id".to_owned()], None);
        assert_eq!(
            args,
            vec![
                "run", "--rm", "-w", "/workspace", "-e", "A=1", "-e", "B=2", "-v",
                "/src:/workspace", "-p", "8080:80", "--add-host",
                "host.docker.internal:host-gateway", "--userns=keep-id", "alpine:3", "/bin/sh",
                "-c", "true",
            ]
        );
    }

    #[test]
    fn selinux_labels() {
        assert_eq!(label_volume("/a:/b", "z"), "/a:/b:z");
        assert_eq!(label_volume("/a:/b:ro", "z"), "/a:/b:ro,z");
        assert_eq!(label_volume("/a:/b:Z", "z"), "/a:/b:Z");
        assert_eq!(label_volume("named", "z"), "named");
    }
}
