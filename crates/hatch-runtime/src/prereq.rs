use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};

/// A missing prerequisite with actionable install instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingPrereq {
    pub name: String,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

/// Locate `program` the way a shell would. Names containing a path separator
/// are checked directly; bare names are searched in `path_var` (the process
/// `PATH` when `None`).
pub fn find_in_path(program: &str, path_var: Option<&OsStr>) -> Option<PathBuf> {
    if program.is_empty() {
        return None;
    }
    if program.contains('/') || (cfg!(windows) && program.contains('\\')) {
        let candidate = PathBuf::from(program);
        return is_executable(&candidate).then_some(candidate);
    }

    let owned;
    let path_var = match path_var {
        Some(p) => p,
        None => {
            owned = std::env::var_os("PATH")?;
            owned.as_os_str()
        }
    };

    for dir in std::env::split_paths(path_var) {
        let candidate = dir.join(program);
        if is_executable(&candidate) {
            return Some(candidate);
        }
        if cfg!(windows) && Path::new(program).extension().is_none() {
            for ext in ["exe", "cmd", "bat"] {
                let with_ext = candidate.with_extension(ext);
                if is_executable(&with_ext) {
                    return Some(with_ext);
                }
            }
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Describe the shells that were tried and could not be found.
pub fn missing_shells(candidates: &[String]) -> Vec<MissingPrereq> {
    candidates
        .iter()
        .map(|name| MissingPrereq {
            name: name.clone(),
            purpose: "running native scripts",
            install_hint: if cfg!(windows) {
                "install PowerShell 7 (winget install Microsoft.PowerShell) or ensure cmd.exe is on PATH"
            } else {
                "install bash or sh with your package manager, or set SHELL to an existing shell"
            },
        })
        .collect()
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str(
        "\nhatch needs one of these to run native scripts; \
         alternatively use the virtual runtime (--runtime virtual).",
    );
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_prereq_display() {
        let m = MissingPrereq {
            name: "bash".to_owned(),
            purpose: "running scripts",
            install_hint: "apt install bash",
        };
        let s = format!("{m}");
        assert!(s.contains("bash"));
        assert!(s.contains("running scripts"));
        assert!(s.contains("apt install bash"));
    }

    #[test]
    fn format_missing_lists_every_candidate() {
        let items = missing_shells(&["zsh".to_owned(), "bash".to_owned(), "sh".to_owned()]);
        let output = format_missing(&items);
        assert!(output.starts_with("missing prerequisites:"));
        for name in ["zsh", "bash", "sh"] {
            assert!(output.contains(name));
        }
        assert!(output.contains("virtual"));
    }

    #[cfg(unix)]
    #[test]
    fn finds_program_in_custom_path() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("hatch-tool");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let found = find_in_path("hatch-tool", Some(dir.path().as_os_str())).unwrap();
        assert_eq!(found, tool);
        assert!(find_in_path("hatch-absent", Some(dir.path().as_os_str())).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data"), "x").unwrap();
        assert!(find_in_path("data", Some(dir.path().as_os_str())).is_none());
    }

    #[test]
    fn explicit_paths_are_checked_directly() {
        assert!(find_in_path("/nonexistent/dir/tool", None).is_none());
        assert!(find_in_path("", None).is_none());
    }
}
