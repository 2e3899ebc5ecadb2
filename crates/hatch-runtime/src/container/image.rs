//! Image naming, build-file discovery and build caching.

use super::engine::{BuildOptions, ContainerEngine};
use crate::cancel::CancellationToken;
use crate::gate::FileLock;
use crate::io::OutputSink;
use crate::RuntimeError;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const IMAGE_PREFIX: &str = "hatch";

/// Build files looked up in the command-source directory, in order.
pub const BUILD_FILES: &[&str] = &["Containerfile", "Dockerfile"];

const WINDOWS_IMAGE_PATTERNS: &[&str] = &[
    "mcr.microsoft.com/windows/",
    "mcr.microsoft.com/powershell:",
    "microsoft/windowsservercore",
    "microsoft/nanoserver",
];

/// Deterministic tag for images built from the command file at `source`.
pub fn image_tag_for(source: &Path) -> String {
    let absolute = std::path::absolute(source).unwrap_or_else(|_| source.to_path_buf());
    let digest = hex::encode(Sha256::digest(absolute.to_string_lossy().as_bytes()));
    format!("{IMAGE_PREFIX}-{}:latest", &digest[..12])
}

pub fn is_windows_image(image: &str) -> bool {
    let lower = image.to_lowercase();
    WINDOWS_IMAGE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Locate the build file: an explicit `containerfile` setting (relative to
/// `source_dir`), otherwise the first of [`BUILD_FILES`] present.
pub fn find_build_file(source_dir: &Path, explicit: Option<&str>) -> Result<PathBuf, RuntimeError> {
    if let Some(name) = explicit.filter(|n| !n.trim().is_empty()) {
        let path = source_dir.join(name.trim());
        if path.is_file() {
            return Ok(path);
        }
        return Err(RuntimeError::ContainerConfig(format!(
            "containerfile not found at {}",
            path.display()
        )));
    }
    BUILD_FILES
        .iter()
        .map(|name| source_dir.join(name))
        .find(|p| p.is_file())
        .ok_or_else(|| {
            RuntimeError::ContainerConfig(format!(
                "no image specified and no Containerfile or Dockerfile found at {}",
                source_dir.join(BUILD_FILES[0]).display()
            ))
        })
}

/// Inputs to [`ensure_image`].
pub struct EnsureImage<'a> {
    pub source_file: &'a Path,
    pub containerfile: Option<&'a str>,
    pub force_rebuild: bool,
    pub verbose: bool,
    /// Directory holding per-tag build locks.
    pub lock_dir: &'a Path,
}

/// Build the image for a command file unless it is already cached.
///
/// The existence check and build run under an exclusive lock keyed by tag,
/// so concurrent first runs against the same command file build once. An
/// unusable lock directory degrades to an unlocked build.
pub fn ensure_image(
    engine: &dyn ContainerEngine,
    req: &EnsureImage<'_>,
    progress: &mut OutputSink,
    cancel: &CancellationToken,
) -> Result<String, RuntimeError> {
    let source_dir = req
        .source_file
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let dockerfile = find_build_file(&source_dir, req.containerfile)?;
    let tag = image_tag_for(req.source_file);

    let lock_path = req.lock_dir.join(format!("{}.lock", tag.replace([':', '/'], "_")));
    let _lock = match FileLock::acquire(&lock_path) {
        Ok(lock) => Some(lock),
        Err(e) => {
            warn!(
                "image build lock {} unusable, building without it: {e}",
                lock_path.display()
            );
            None
        }
    };

    if !req.force_rebuild && engine.image_exists(&tag)? {
        debug!("image {tag} already built");
        return Ok(tag);
    }

    info!("building image {tag} from {}", dockerfile.display());
    if req.verbose {
        let _ = writeln!(progress, "Building container image {tag}...");
    }
    let opts = BuildOptions {
        context_dir: source_dir,
        dockerfile,
        tag: tag.clone(),
        no_cache: req.force_rebuild,
        ..BuildOptions::default()
    };
    if req.verbose {
        engine.build(&opts, progress, cancel)?;
    } else {
        engine.build(&opts, &mut OutputSink::Null, cancel)?;
    }
    Ok(tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_is_stable_per_path() {
        let a = image_tag_for(Path::new("/proj/a/hatch.toml"));
        let b = image_tag_for(Path::new("/proj/b/hatch.toml"));
        assert_eq!(a, image_tag_for(Path::new("/proj/a/hatch.toml")));
        assert_ne!(a, b);
        assert!(a.starts_with("hatch-"));
        assert!(a.ends_with(":latest"));
        assert_eq!(a.len(), "hatch-".len() + 12 + ":latest".len());
    }

    #[test]
    fn windows_images() {
        assert!(is_windows_image("mcr.microsoft.com/windows/servercore:ltsc2022"));
        assert!(is_windows_image("MCR.microsoft.com/PowerShell:lts"));
        assert!(is_windows_image("microsoft/nanoserver"));
        assert!(!is_windows_image("alpine:3.20"));
        assert!(!is_windows_image("mcr.microsoft.com/devcontainers/base:ubuntu"));
    }

    #[test]
    fn containerfile_preferred_over_dockerfile() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM alpine\n").unwrap();
        assert_eq!(
            find_build_file(dir.path(), None).unwrap(),
            dir.path().join("Dockerfile")
        );
        std::fs::write(dir.path().join("Containerfile"), "FROM alpine\n").unwrap();
        assert_eq!(
            find_build_file(dir.path(), None).unwrap(),
            dir.path().join("Containerfile")
        );
    }

    #[test]
    fn unusable_lock_dir_still_builds() {
        use crate::mock::MockEngine;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Containerfile"), "FROM alpine\n").unwrap();
        let source = dir.path().join("hatch.toml");
        let not_a_dir = dir.path().join("locks");
        std::fs::write(&not_a_dir, "").unwrap();

        let engine = MockEngine::new();
        let req = EnsureImage {
            source_file: &source,
            containerfile: None,
            force_rebuild: false,
            verbose: false,
            lock_dir: &not_a_dir,
        };
        let tag = ensure_image(
            &engine,
            &req,
            &mut OutputSink::Null,
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(tag, image_tag_for(&source));
        assert_eq!(engine.builds().len(), 1);
        assert!(engine.has_image(&tag));
    }

    #[test]
    fn missing_build_file_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = find_build_file(dir.path(), None).unwrap_err().to_string();
        assert!(err.contains(&dir.path().display().to_string()));

        let err = find_build_file(dir.path(), Some("build/Custom")).unwrap_err().to_string();
        assert!(err.contains("containerfile not found at"));
        assert!(err.contains("Custom"));
    }
}
