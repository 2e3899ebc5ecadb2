//! Environment resolution for an execution.
//!
//! Layers, lowest precedence first:
//!  1. host environment, filtered by inherit mode and allow/deny lists
//!  2-4. root, command, implementation `env.files`
//!  5-7. root, command, implementation `env.vars`
//!  8. framework-provided extra variables
//!  9. invocation-time env files (relative to the process cwd)
//! 10. invocation-time env vars
//!
//! Internal bookkeeping variables are always stripped from the host layer so
//! a nested invocation never sees its parent's arguments.

pub mod dotenv;

use crate::context::ExecutionContext;
use crate::RuntimeError;
use dotenv::load_env_file;
use hatch_schema::{EnvInheritMode, InheritPolicy};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Prefix shared by every variable hatch sets for its own use.
pub const ENV_PREFIX: &str = "HATCH_";

const INTERNAL_PREFIXES: &[&str] = &["HATCH_ARG_", "HATCH_FLAG_"];
const INTERNAL_NAMES: &[&str] = &[
    "HATCH_CMD_NAME",
    "HATCH_RUNTIME",
    "HATCH_SOURCE",
    "HATCH_PLATFORM",
    "ARGC",
];

/// Whether `name` is bookkeeping state from an enclosing hatch invocation.
pub fn is_internal_var(name: &str) -> bool {
    if INTERNAL_PREFIXES.iter().any(|p| name.starts_with(p)) || INTERNAL_NAMES.contains(&name) {
        return true;
    }
    name.strip_prefix("ARG")
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

/// Apply the inherit policy to a host environment snapshot.
pub fn filter_host_env<I>(host: I, policy: &InheritPolicy) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    if policy.mode == EnvInheritMode::None {
        return BTreeMap::new();
    }
    host.into_iter()
        .filter(|(k, _)| !is_internal_var(k))
        .filter(|(k, _)| policy.mode == EnvInheritMode::All || policy.allow.contains(k))
        .filter(|(k, _)| !policy.deny.contains(k))
        .collect()
}

/// Produces the final environment of an execution.
pub trait EnvBuilder: Send + Sync {
    fn build(&self, ctx: &ExecutionContext) -> Result<BTreeMap<String, String>, RuntimeError>;
}

/// Reads the real host environment (or an injected snapshot) and applies
/// every layer.
#[derive(Debug, Clone, Default)]
pub struct DefaultEnvBuilder {
    host: Option<Vec<(String, String)>>,
    cwd: Option<PathBuf>,
}

impl DefaultEnvBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `host` instead of the process environment.
    #[must_use]
    pub fn with_host_env<I, K, V>(mut self, host: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.host = Some(
            host.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    /// Resolve invocation-time env files against `cwd` instead of the process
    /// working directory.
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    fn host_snapshot(&self) -> Vec<(String, String)> {
        match &self.host {
            Some(h) => h.clone(),
            None => std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
                .collect(),
        }
    }
}

impl EnvBuilder for DefaultEnvBuilder {
    fn build(&self, ctx: &ExecutionContext) -> Result<BTreeMap<String, String>, RuntimeError> {
        let mut env = filter_host_env(self.host_snapshot(), &ctx.inherit_policy());

        let base = ctx.file.dir();
        let levels = [
            &ctx.file.env,
            &ctx.command.env,
            &ctx.implementation.env,
        ];
        for level in levels {
            for file in &level.files {
                load_env_file(&mut env, file, &base)?;
            }
        }
        for level in levels {
            env.extend(level.vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        env.extend(ctx.env.extra_env.iter().map(|(k, v)| (k.clone(), v.clone())));

        if !ctx.env.env_files.is_empty() {
            let cwd = match &self.cwd {
                Some(c) => c.clone(),
                None => std::env::current_dir()?,
            };
            for file in &ctx.env.env_files {
                load_env_file(&mut env, file, &cwd)?;
            }
        }

        env.extend(ctx.env.env_vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(env)
    }
}

/// Returns a fixed environment, or a fixed error.
#[derive(Debug, Clone, Default)]
pub struct MockEnvBuilder {
    pub env: BTreeMap<String, String>,
    pub error: Option<String>,
}

impl EnvBuilder for MockEnvBuilder {
    fn build(&self, _ctx: &ExecutionContext) -> Result<BTreeMap<String, String>, RuntimeError> {
        match &self.error {
            Some(msg) => Err(RuntimeError::Io(std::io::Error::other(msg.clone()))),
            None => Ok(self.env.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatch_schema::{Command, CommandFile, Implementation, RuntimeConfig, RuntimeKind};

    fn ctx(dir: &std::path::Path, kind: RuntimeKind) -> ExecutionContext {
        ExecutionContext::new(
            CommandFile::new(dir.join("hatch.toml")),
            Command::new("demo"),
            Implementation::new("echo", RuntimeConfig::new(kind)),
        )
    }

    #[test]
    fn internal_variable_classification() {
        for name in [
            "HATCH_ARG_1",
            "HATCH_ARG_",
            "HATCH_FLAG_VERBOSE",
            "HATCH_FLAG_",
            "HATCH_CMD_NAME",
            "HATCH_RUNTIME",
            "HATCH_SOURCE",
            "HATCH_PLATFORM",
            "ARGC",
            "ARG0",
            "ARG1",
            "ARG999",
        ] {
            assert!(is_internal_var(name), "{name} should be filtered");
        }
        for name in [
            "PATH", "HOME", "HATCH", "HATCH_", "HATCH_OTHER", "ARG", "ARGS", "ARGNAME", "ARG_1",
            "ARG1NAME", "MY_ARGC", "MY_ARG1", "HATCH_ARGS",
        ] {
            assert!(!is_internal_var(name), "{name} should be kept");
        }
    }

    #[test]
    fn filter_modes() {
        let host = || {
            vec![
                ("PATH".to_owned(), "/bin".to_owned()),
                ("TERM".to_owned(), "xterm".to_owned()),
                ("SECRET".to_owned(), "s".to_owned()),
                ("ARG1".to_owned(), "leak".to_owned()),
            ]
        };
        let all = filter_host_env(
            host(),
            &InheritPolicy {
                mode: EnvInheritMode::All,
                allow: vec![],
                deny: vec!["SECRET".into()],
            },
        );
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["PATH", "TERM"]);

        let allow = filter_host_env(
            host(),
            &InheritPolicy {
                mode: EnvInheritMode::Allow,
                allow: vec!["TERM".into(), "ARG1".into()],
                deny: vec![],
            },
        );
        assert_eq!(allow.keys().collect::<Vec<_>>(), vec!["TERM"]);

        let none = filter_host_env(
            host(),
            &InheritPolicy {
                mode: EnvInheritMode::None,
                allow: vec!["TERM".into()],
                deny: vec![],
            },
        );
        assert!(none.is_empty());
    }

    #[test]
    fn layers_apply_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("root.env"), "LAYER=root-file\nROOT_FILE=1\n").unwrap();
        std::fs::write(dir.path().join("cmd.env"), "LAYER=cmd-file\n").unwrap();
        std::fs::write(dir.path().join("runtime.env"), "LAYER=runtime-file\n").unwrap();

        let mut c = ctx(dir.path(), RuntimeKind::Native);
        c.file.env.files.push("root.env".into());
        c.command.env.files.push("cmd.env".into());
        c.implementation.env.files.push("impl.env?".into());
        c.command.env.vars.insert("LAYER".into(), "cmd-var".into());
        c.implementation.env.vars.insert("IMPL".into(), "1".into());

        let builder = DefaultEnvBuilder::new()
            .with_host_env([("LAYER", "host"), ("HOST_ONLY", "h")])
            .with_cwd(dir.path());

        let env = builder.build(&c).unwrap();
        assert_eq!(env["LAYER"], "cmd-var");
        assert_eq!(env["ROOT_FILE"], "1");
        assert_eq!(env["HOST_ONLY"], "h");
        assert_eq!(env["IMPL"], "1");

        c.env.extra_env.insert("LAYER".into(), "extra".into());
        assert_eq!(builder.build(&c).unwrap()["LAYER"], "extra");

        c.env.env_files.push("runtime.env".into());
        assert_eq!(builder.build(&c).unwrap()["LAYER"], "runtime-file");

        c.env.env_vars.insert("LAYER".into(), "flag".into());
        assert_eq!(builder.build(&c).unwrap()["LAYER"], "flag");
    }

    #[test]
    fn container_does_not_inherit_host_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(dir.path(), RuntimeKind::Container);
        let env = DefaultEnvBuilder::new()
            .with_host_env([("PATH", "/usr/bin")])
            .build(&c)
            .unwrap();
        assert!(env.is_empty());
    }

    #[test]
    fn parent_arguments_never_leak() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ctx(dir.path(), RuntimeKind::Native);
        c.env.extra_env.insert("ARG1".into(), "mine".into());
        let env = DefaultEnvBuilder::new()
            .with_host_env([("ARG1", "parent"), ("ARG2", "parent"), ("ARGC", "2")])
            .build(&c)
            .unwrap();
        assert_eq!(env["ARG1"], "mine");
        assert!(!env.contains_key("ARG2"));
        assert!(!env.contains_key("ARGC"));
    }

    #[test]
    fn missing_required_env_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ctx(dir.path(), RuntimeKind::Native);
        c.command.env.files.push("absent.env".into());
        let err = DefaultEnvBuilder::new()
            .with_host_env(Vec::<(String, String)>::new())
            .build(&c)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Dotenv(_)));
    }

    #[test]
    fn mock_builder_returns_fixed_values() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(dir.path(), RuntimeKind::Native);
        let mut mock = MockEnvBuilder::default();
        mock.env.insert("A".into(), "1".into());
        assert_eq!(mock.build(&c).unwrap()["A"], "1");
        mock.error = Some("boom".into());
        assert!(mock.build(&c).is_err());
    }
}
