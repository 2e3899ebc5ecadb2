use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unknown runtime '{0}', expected native, virtual or container")]
    UnknownRuntime(String),
    #[error("unknown env inherit mode '{0}', expected none, allow or all")]
    UnknownInheritMode(String),
    #[error("script has no content")]
    EmptyScript,
    #[error("failed to read script file '{path}': {source}")]
    ScriptRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The execution backend an implementation is declared for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Native,
    Virtual,
    Container,
}

impl RuntimeKind {
    pub const ALL: [RuntimeKind; 3] = [Self::Native, Self::Virtual, Self::Container];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Virtual => "virtual",
            Self::Container => "container",
        }
    }

    /// Host variables reach native and virtual scripts by default; containers
    /// start from an empty environment.
    pub fn default_inherit_mode(self) -> EnvInheritMode {
        match self {
            Self::Native | Self::Virtual => EnvInheritMode::All,
            Self::Container => EnvInheritMode::None,
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeKind {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "native" => Ok(Self::Native),
            "virtual" => Ok(Self::Virtual),
            "container" => Ok(Self::Container),
            other => Err(SchemaError::UnknownRuntime(other.to_owned())),
        }
    }
}

/// How much of the host environment a script sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvInheritMode {
    None,
    Allow,
    All,
}

impl FromStr for EnvInheritMode {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "allow" => Ok(Self::Allow),
            "all" => Ok(Self::All),
            other => Err(SchemaError::UnknownInheritMode(other.to_owned())),
        }
    }
}

/// Environment settings declared at one level (root, command or implementation).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvConfig {
    /// Dotenv files, relative to the command-source directory. A trailing `?`
    /// marks a file as optional.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub inherit_mode: Option<EnvInheritMode>,
    #[serde(default)]
    pub inherit_allow: Option<Vec<String>>,
    #[serde(default)]
    pub inherit_deny: Option<Vec<String>>,
}

/// Root-level settings of the file a command was declared in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFile {
    pub path: PathBuf,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub env: EnvConfig,
}

impl CommandFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            workdir: None,
            env: EnvConfig::default(),
        }
    }

    /// Absolute form of the command-source path, resolved against the process
    /// working directory without touching the filesystem.
    pub fn absolute_path(&self) -> PathBuf {
        std::path::absolute(&self.path).unwrap_or_else(|_| self.path.clone())
    }

    /// Directory containing the command-source file. This is the build context,
    /// the default working directory and the container workspace mount.
    pub fn dir(&self) -> PathBuf {
        self.absolute_path()
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub env: EnvConfig,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workdir: None,
            env: EnvConfig::default(),
        }
    }
}

/// Backend-specific settings of an implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    pub name: RuntimeKind,
    /// `auto` (or absent) reads the script's shebang; anything else is an
    /// explicit interpreter command line.
    #[serde(default)]
    pub interpreter: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub containerfile: Option<String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub enable_host_access: bool,
}

impl RuntimeConfig {
    pub fn new(name: RuntimeKind) -> Self {
        Self {
            name,
            interpreter: None,
            image: None,
            containerfile: None,
            volumes: Vec::new(),
            ports: Vec::new(),
            enable_host_access: false,
        }
    }
}

/// A declared script plus the backends it may run on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    pub script: String,
    pub runtimes: Vec<RuntimeConfig>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub env: EnvConfig,
}

impl Implementation {
    pub fn new(script: impl Into<String>, runtime: RuntimeConfig) -> Self {
        Self {
            script: script.into(),
            runtimes: vec![runtime],
            workdir: None,
            env: EnvConfig::default(),
        }
    }

    pub fn runtime_config(&self, kind: RuntimeKind) -> Option<&RuntimeConfig> {
        self.runtimes.iter().find(|rc| rc.name == kind)
    }

    /// The first declared runtime, or native when none is declared.
    pub fn default_runtime(&self) -> RuntimeKind {
        self.runtimes.first().map_or(RuntimeKind::Native, |rc| rc.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_kind_parses_and_displays() {
        for kind in RuntimeKind::ALL {
            assert_eq!(kind.as_str().parse::<RuntimeKind>().unwrap(), kind);
            assert_eq!(kind.to_string(), kind.as_str());
        }
        assert!(matches!(
            "wasm".parse::<RuntimeKind>(),
            Err(SchemaError::UnknownRuntime(name)) if name == "wasm"
        ));
    }

    #[test]
    fn default_inherit_mode_per_runtime() {
        assert_eq!(
            RuntimeKind::Native.default_inherit_mode(),
            EnvInheritMode::All
        );
        assert_eq!(
            RuntimeKind::Virtual.default_inherit_mode(),
            EnvInheritMode::All
        );
        assert_eq!(
            RuntimeKind::Container.default_inherit_mode(),
            EnvInheritMode::None
        );
    }

    #[test]
    fn inherit_mode_rejects_unknown() {
        assert_eq!("allow".parse::<EnvInheritMode>().unwrap(), EnvInheritMode::Allow);
        assert!("some".parse::<EnvInheritMode>().is_err());
    }

    #[test]
    fn command_file_dir_is_absolute_parent() {
        let dir = tempfile::tempdir().unwrap();
        let file = CommandFile::new(dir.path().join("hatch.toml"));
        assert_eq!(file.dir(), dir.path());
        assert!(file.absolute_path().is_absolute());
    }

    #[test]
    fn implementation_runtime_lookup() {
        let mut imp = Implementation::new("echo hi", RuntimeConfig::new(RuntimeKind::Virtual));
        imp.runtimes.push(RuntimeConfig::new(RuntimeKind::Container));
        assert_eq!(imp.default_runtime(), RuntimeKind::Virtual);
        assert!(imp.runtime_config(RuntimeKind::Container).is_some());
        assert!(imp.runtime_config(RuntimeKind::Native).is_none());
    }

    #[test]
    fn runtime_config_deserializes_with_defaults() {
        let rc: RuntimeConfig =
            serde_json::from_str(r#"{"name":"container","image":"alpine:3"}"#).unwrap();
        assert_eq!(rc.name, RuntimeKind::Container);
        assert_eq!(rc.image.as_deref(), Some("alpine:3"));
        assert!(rc.volumes.is_empty());
        assert!(!rc.enable_host_access);
    }
}
