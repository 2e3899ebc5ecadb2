//! Layering the hatch binary onto base images so scripts can call hatch
//! from inside the container.

use super::engine::{BuildOptions, ContainerEngine};
use crate::cancel::CancellationToken;
use crate::cleanup::Cleanup;
use crate::io::OutputSink;
use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

pub const PROVISIONED_REPOSITORY: &str = "hatch-provisioned";

/// Path of the binary inside provisioned images.
pub const PROVISIONED_BINARY: &str = "/hatch/bin/hatch";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisionConfig {
    pub enabled: bool,
    /// Binary copied into the image. Defaults to the running executable.
    pub binary_path: Option<PathBuf>,
}

#[derive(Debug)]
pub struct ProvisionResult {
    pub image_tag: String,
    /// Runs once the container that used the image has finished.
    pub cleanup: Cleanup,
}

pub trait Provisioner: Send + Sync {
    fn config(&self) -> &ProvisionConfig;

    fn provision(
        &self,
        base_image: &str,
        progress: &mut OutputSink,
        cancel: &CancellationToken,
    ) -> Result<ProvisionResult, RuntimeError>;
}

/// Builds `FROM <base>` plus the binary as a cached derived image.
pub struct LayerProvisioner {
    engine: Arc<dyn ContainerEngine>,
    config: ProvisionConfig,
}

impl LayerProvisioner {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: ProvisionConfig) -> Self {
        Self { engine, config }
    }

    fn binary(&self) -> Result<PathBuf, RuntimeError> {
        match &self.config.binary_path {
            Some(path) => Ok(path.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }
}

/// Derived tag: depends on both the base image and the payload contents.
pub fn provisioned_tag(base_image: &str, payload: &[u8]) -> String {
    let payload_digest = blake3::hash(payload);
    let mut hasher = Sha256::new();
    hasher.update(base_image.as_bytes());
    hasher.update(b"\n");
    hasher.update(payload_digest.to_hex().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{PROVISIONED_REPOSITORY}:{}", &digest[..12])
}

fn containerfile(base_image: &str) -> String {
    format!(
        "FROM {base_image}\nCOPY hatch {PROVISIONED_BINARY}\nENV PATH=/hatch/bin:$PATH\n"
    )
}

impl Provisioner for LayerProvisioner {
    fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    fn provision(
        &self,
        base_image: &str,
        progress: &mut OutputSink,
        cancel: &CancellationToken,
    ) -> Result<ProvisionResult, RuntimeError> {
        let binary = self.binary()?;
        let payload = std::fs::read(&binary).map_err(|e| {
            RuntimeError::Provision(format!("cannot read {}: {e}", binary.display()))
        })?;
        let tag = provisioned_tag(base_image, &payload);

        if self.engine.image_exists(&tag)? {
            debug!("provisioned image {tag} already exists");
            return Ok(ProvisionResult {
                image_tag: tag,
                cleanup: Cleanup::new(),
            });
        }

        info!("provisioning {base_image} as {tag}");
        let context = tempfile::Builder::new().prefix("hatch-provision-").tempdir()?;
        let target = context.path().join("hatch");
        std::fs::write(&target, &payload)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755))?;
        }
        let dockerfile = context.path().join("Containerfile");
        std::fs::write(&dockerfile, containerfile(base_image))?;

        let opts = BuildOptions {
            context_dir: context.path().to_path_buf(),
            dockerfile,
            tag: tag.clone(),
            ..BuildOptions::default()
        };
        self.engine
            .build(&opts, progress, cancel)
            .map_err(|e| RuntimeError::Provision(e.to_string()))?;
        Ok(ProvisionResult {
            image_tag: tag,
            cleanup: Cleanup::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_tracks_base_and_payload() {
        let a = provisioned_tag("alpine:3", b"v1");
        assert_eq!(a, provisioned_tag("alpine:3", b"v1"));
        assert_ne!(a, provisioned_tag("alpine:3", b"v2"));
        assert_ne!(a, provisioned_tag("debian:12", b"v1"));
        assert!(a.starts_with("hatch-provisioned:"));
    }

    #[test]
    fn containerfile_layers_binary() {
        let content = containerfile("alpine:3");
        assert!(content.starts_with("FROM alpine:3\n"));
        assert!(content.contains("COPY hatch /hatch/bin/hatch"));
        assert!(content.contains("ENV PATH=/hatch/bin:$PATH"));
    }
}
