//! Script source resolution: inline text or a file next to the command source.

use crate::command::{CommandFile, Implementation, SchemaError};
use std::path::{Path, PathBuf};

const SCRIPT_FILE_EXTENSIONS: &[&str] = &[
    ".sh", ".bash", ".ps1", ".bat", ".cmd", ".py", ".rb", ".pl", ".zsh", ".fish",
];

/// Whether a script value names a file rather than holding inline text.
pub fn is_script_file(script: &str) -> bool {
    let script = script.trim();
    if script.is_empty() {
        return false;
    }
    if script.starts_with("./") || script.starts_with("../") || script.starts_with('/') {
        return true;
    }
    let bytes = script.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' {
        return true;
    }
    let lower = script.to_ascii_lowercase();
    SCRIPT_FILE_EXTENSIONS
        .iter()
        .any(|ext| lower.ends_with(ext))
}

impl Implementation {
    pub fn is_script_file(&self) -> bool {
        is_script_file(&self.script)
    }

    /// Absolute path of the referenced script file, `None` for inline scripts.
    pub fn script_path(&self, file: &CommandFile) -> Option<PathBuf> {
        if !self.is_script_file() {
            return None;
        }
        let script = Path::new(self.script.trim());
        if script.is_absolute() {
            Some(script.to_path_buf())
        } else {
            Some(file.dir().join(script))
        }
    }

    /// The script text to execute, reading the referenced file if needed.
    pub fn resolve_script(&self, file: &CommandFile) -> Result<String, SchemaError> {
        let content = match self.script_path(file) {
            Some(path) => std::fs::read_to_string(&path)
                .map_err(|source| SchemaError::ScriptRead { path, source })?,
            None => self.script.clone(),
        };
        if content.trim().is_empty() {
            return Err(SchemaError::EmptyScript);
        }
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{RuntimeConfig, RuntimeKind};

    fn native(script: &str) -> Implementation {
        Implementation::new(script, RuntimeConfig::new(RuntimeKind::Native))
    }

    #[test]
    fn detects_file_references() {
        assert!(is_script_file("./build.sh"));
        assert!(is_script_file("../tools/run"));
        assert!(is_script_file("/opt/run"));
        assert!(is_script_file(r"C:\scripts\run.ps1"));
        assert!(is_script_file("deploy.PY"));
        assert!(is_script_file("  setup.bash  "));
    }

    #[test]
    fn detects_inline_scripts() {
        assert!(!is_script_file("echo hello"));
        assert!(!is_script_file(""));
        assert!(!is_script_file("make build && make test"));
    }

    #[test]
    fn resolves_inline_script() {
        let file = CommandFile::new("/tmp/hatch.toml");
        assert_eq!(native("echo hi").resolve_script(&file).unwrap(), "echo hi");
    }

    #[test]
    fn resolves_relative_script_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("run.sh"), "echo from file\n").unwrap();
        let file = CommandFile::new(dir.path().join("hatch.toml"));
        let imp = native("./run.sh");
        assert_eq!(imp.script_path(&file).unwrap(), dir.path().join("./run.sh"));
        assert_eq!(imp.resolve_script(&file).unwrap(), "echo from file\n");
    }

    #[test]
    fn missing_script_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = CommandFile::new(dir.path().join("hatch.toml"));
        let err = native("./absent.sh").resolve_script(&file).unwrap_err();
        assert!(matches!(err, SchemaError::ScriptRead { .. }));
        assert!(err.to_string().contains("absent.sh"));
    }

    #[test]
    fn blank_script_is_rejected() {
        let file = CommandFile::new("/tmp/hatch.toml");
        let err = native("   \n").resolve_script(&file).unwrap_err();
        assert!(matches!(err, SchemaError::EmptyScript));
    }
}
