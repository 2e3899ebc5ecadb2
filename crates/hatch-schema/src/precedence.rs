//! Layered resolution of settings that may be declared at several levels.
//!
//! Every backend resolves working directory and environment inheritance
//! through [`Layers`], so the order is defined in exactly one place:
//! per-call override, then implementation, then command, then root, then the
//! built-in default.

use crate::command::{Command, CommandFile, EnvInheritMode, Implementation, RuntimeKind};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layers<T> {
    pub call: Option<T>,
    pub implementation: Option<T>,
    pub command: Option<T>,
    pub root: Option<T>,
}

impl<T> Layers<T> {
    pub fn resolve(self) -> Option<T> {
        self.call
            .or(self.implementation)
            .or(self.command)
            .or(self.root)
    }

    pub fn resolve_or(self, default: T) -> T {
        self.resolve().unwrap_or(default)
    }
}

/// The working-directory value chosen by layering, before any path joining.
pub fn workdir_setting(
    file: &CommandFile,
    command: &Command,
    implementation: &Implementation,
    call_override: Option<&str>,
) -> Option<String> {
    Layers {
        call: non_empty(call_override),
        implementation: non_empty(implementation.workdir.as_deref()),
        command: non_empty(command.workdir.as_deref()),
        root: non_empty(file.workdir.as_deref()),
    }
    .resolve()
    .map(str::to_owned)
}

/// Resolve the effective working directory for one execution.
///
/// Relative values are joined to the command-source directory, which is also
/// the fallback when no level sets one.
pub fn effective_workdir(
    file: &CommandFile,
    command: &Command,
    implementation: &Implementation,
    call_override: Option<&str>,
) -> PathBuf {
    let base = file.dir();
    match workdir_setting(file, command, implementation, call_override) {
        None => base,
        Some(dir) => {
            let path = Path::new(&dir);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                base.join(path)
            }
        }
    }
}

/// Host-environment inheritance after layering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InheritPolicy {
    pub mode: EnvInheritMode,
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

/// Per-call inheritance overrides, typically from command-line flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InheritOverride {
    pub mode: Option<EnvInheritMode>,
    pub allow: Option<Vec<String>>,
    pub deny: Option<Vec<String>>,
}

pub fn effective_inherit(
    runtime: RuntimeKind,
    file: &CommandFile,
    command: &Command,
    implementation: &Implementation,
    call: &InheritOverride,
) -> InheritPolicy {
    let mode = Layers {
        call: call.mode,
        implementation: implementation.env.inherit_mode,
        command: command.env.inherit_mode,
        root: file.env.inherit_mode,
    }
    .resolve_or(runtime.default_inherit_mode());

    let allow = Layers {
        call: call.allow.clone(),
        implementation: implementation.env.inherit_allow.clone(),
        command: command.env.inherit_allow.clone(),
        root: file.env.inherit_allow.clone(),
    }
    .resolve_or_default();

    let deny = Layers {
        call: call.deny.clone(),
        implementation: implementation.env.inherit_deny.clone(),
        command: command.env.inherit_deny.clone(),
        root: file.env.inherit_deny.clone(),
    }
    .resolve_or_default();

    InheritPolicy { mode, allow, deny }
}

impl<T: Default> Layers<T> {
    pub fn resolve_or_default(self) -> T {
        self.resolve().unwrap_or_default()
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::RuntimeConfig;

    fn fixture(dir: &Path) -> (CommandFile, Command, Implementation) {
        (
            CommandFile::new(dir.join("hatch.toml")),
            Command::new("build"),
            Implementation::new("echo", RuntimeConfig::new(RuntimeKind::Native)),
        )
    }

    #[test]
    fn layers_pick_most_specific() {
        let layers = Layers {
            call: None,
            implementation: Some(2),
            command: Some(3),
            root: Some(4),
        };
        assert_eq!(layers.resolve(), Some(2));

        let empty: Layers<u8> = Layers {
            call: None,
            implementation: None,
            command: None,
            root: None,
        };
        assert_eq!(empty.resolve_or(9), 9);
    }

    #[test]
    fn workdir_defaults_to_command_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (file, cmd, imp) = fixture(dir.path());
        assert_eq!(effective_workdir(&file, &cmd, &imp, None), dir.path());
    }

    #[test]
    fn workdir_precedence_order() {
        let dir = tempfile::tempdir().unwrap();
        let (mut file, mut cmd, mut imp) = fixture(dir.path());
        file.workdir = Some("root".into());
        assert_eq!(
            effective_workdir(&file, &cmd, &imp, None),
            dir.path().join("root")
        );
        cmd.workdir = Some("cmd".into());
        assert_eq!(
            effective_workdir(&file, &cmd, &imp, None),
            dir.path().join("cmd")
        );
        imp.workdir = Some("impl".into());
        assert_eq!(
            effective_workdir(&file, &cmd, &imp, None),
            dir.path().join("impl")
        );
        assert_eq!(
            effective_workdir(&file, &cmd, &imp, Some("/opt/elsewhere")),
            PathBuf::from("/opt/elsewhere")
        );
    }

    #[test]
    fn blank_workdir_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (file, mut cmd, imp) = fixture(dir.path());
        cmd.workdir = Some("  ".into());
        assert_eq!(effective_workdir(&file, &cmd, &imp, Some("")), dir.path());
    }

    #[test]
    fn inherit_defaults_follow_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let (file, cmd, imp) = fixture(dir.path());
        let none = InheritOverride::default();
        let native = effective_inherit(RuntimeKind::Native, &file, &cmd, &imp, &none);
        assert_eq!(native.mode, EnvInheritMode::All);
        let container = effective_inherit(RuntimeKind::Container, &file, &cmd, &imp, &none);
        assert_eq!(container.mode, EnvInheritMode::None);
        assert!(container.allow.is_empty());
    }

    #[test]
    fn inherit_call_override_wins() {
        let dir = tempfile::tempdir().unwrap();
        let (mut file, mut cmd, imp) = fixture(dir.path());
        file.env.inherit_mode = Some(EnvInheritMode::None);
        cmd.env.inherit_allow = Some(vec!["TERM".into()]);
        let call = InheritOverride {
            mode: Some(EnvInheritMode::Allow),
            allow: None,
            deny: Some(vec!["SECRET".into()]),
        };
        let policy = effective_inherit(RuntimeKind::Native, &file, &cmd, &imp, &call);
        assert_eq!(policy.mode, EnvInheritMode::Allow);
        assert_eq!(policy.allow, vec!["TERM".to_owned()]);
        assert_eq!(policy.deny, vec!["SECRET".to_owned()]);
    }
}
