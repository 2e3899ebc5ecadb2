use std::path::{Component, Path, PathBuf};

/// Where the command-source directory is mounted inside every container.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Map a host working directory onto the container filesystem.
///
/// `source_dir` itself becomes the mount root and paths below it move under
/// the mount. Any other absolute path is passed through (with `.` and `..`
/// resolved) and must already exist in the container.
pub fn container_workdir(workdir: &Path, source_dir: &Path) -> String {
    let resolved = if workdir.is_absolute() {
        normalize(workdir)
    } else {
        normalize(&source_dir.join(workdir))
    };
    match resolved.strip_prefix(normalize(source_dir)) {
        Ok(rel) => under_mount(rel),
        Err(_) => resolved.to_string_lossy().into_owned(),
    }
}

/// Resolve `.` and `..` without touching the filesystem. `..` never climbs
/// above the root.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other),
        }
    }
    out
}

/// `/workspace` joined with a relative host path, using forward slashes.
pub fn under_mount(rel: &Path) -> String {
    let mut out = String::from(WORKSPACE_MOUNT);
    for component in rel.components() {
        if let Component::Normal(part) = component {
            out.push('/');
            out.push_str(&part.to_string_lossy());
        }
    }
    out
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn source_dir_is_mount_root() {
        assert_eq!(container_workdir(Path::new("/proj"), Path::new("/proj")), "/workspace");
        assert_eq!(container_workdir(Path::new("."), Path::new("/proj")), "/workspace");
    }

    #[test]
    fn relative_and_nested_paths_move_under_mount() {
        assert_eq!(
            container_workdir(Path::new("src/app"), Path::new("/proj")),
            "/workspace/src/app"
        );
        assert_eq!(
            container_workdir(Path::new("/proj/build"), Path::new("/proj")),
            "/workspace/build"
        );
    }

    #[test]
    fn outside_paths_pass_through() {
        assert_eq!(container_workdir(Path::new("/data"), Path::new("/proj")), "/data");
        assert_eq!(
            container_workdir(Path::new("/project-other"), Path::new("/proj")),
            "/project-other"
        );
    }

    #[test]
    fn parent_components_leaving_source_dir_pass_through() {
        assert_eq!(container_workdir(Path::new("../other"), Path::new("/proj")), "/other");
        assert_eq!(container_workdir(Path::new("/proj/../etc"), Path::new("/proj")), "/etc");
        assert_eq!(
            container_workdir(Path::new("/proj/./a/../b"), Path::new("/proj")),
            "/workspace/b"
        );
        assert_eq!(
            container_workdir(Path::new("src/../lib"), Path::new("/proj")),
            "/workspace/lib"
        );
    }

    #[test]
    fn normalize_stops_at_root() {
        assert_eq!(normalize(Path::new("/../../x")), PathBuf::from("/x"));
        assert_eq!(normalize(Path::new("../a/./b")), PathBuf::from("../a/b"));
    }
}
