//! File-backed SSH credentials.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{validate_project_id, BackendKind, CredentialBackend, KeyPaths, PrivateKeyReference};
use crate::audit::ProvisionAuditLogger;
use crate::clients::Tool;
use crate::error::{ProvisionError, Result};
use crate::keys::PublicKey;

/// Generates a key pair at `<path>` and `<path>.pub`.
#[async_trait]
pub trait KeyGenerator: Send + Sync {
    async fn generate(&self, private_key: &Path, comment: &str) -> Result<()>;
}

/// `ssh-keygen` based ed25519 key generation.
#[derive(Debug, Clone)]
pub struct SshKeygen {
    tool: Tool,
}

impl SshKeygen {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            tool: Tool::new(program, "ssh-keygen"),
        }
    }
}

impl Default for SshKeygen {
    fn default() -> Self {
        Self::new("ssh-keygen")
    }
}

#[async_trait]
impl KeyGenerator for SshKeygen {
    async fn generate(&self, private_key: &Path, comment: &str) -> Result<()> {
        let path = private_key.display().to_string();
        self.tool
            .run_checked(["-t", "ed25519", "-N", "", "-C", comment, "-f", path.as_str(), "-q"])
            .await?;
        Ok(())
    }
}

pub(crate) async fn exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

pub(crate) async fn restrict_to_owner(path: &Path) -> Result<()> {
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

pub(crate) async fn read_public_key(path: &Path, project: &str) -> Result<PublicKey> {
    match tokio::fs::read_to_string(path).await {
        Ok(line) => PublicKey::parse(&line),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ProvisionError::NotFound(
            format!("no public key for project '{}' at {}", project, path.display()),
        )),
        Err(e) => Err(e.into()),
    }
}

/// Keys stored as plain files, private half readable by the owner only.
pub struct FileBackend {
    paths: KeyPaths,
    keygen: Arc<dyn KeyGenerator>,
    audit: ProvisionAuditLogger,
}

impl FileBackend {
    pub fn new(paths: KeyPaths, keygen: Arc<dyn KeyGenerator>) -> Self {
        Self {
            paths,
            keygen,
            audit: ProvisionAuditLogger::new("credential"),
        }
    }

    pub fn paths(&self) -> &KeyPaths {
        &self.paths
    }
}

#[async_trait]
impl CredentialBackend for FileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::File
    }

    async fn init(&self, project: &str) -> Result<()> {
        validate_project_id(project)?;
        let private = self.paths.private_key(project);

        if exists(&private).await {
            debug!("Key for {} already present at {}", project, private.display());
            restrict_to_owner(&private).await?;
            return Ok(());
        }

        if !exists(self.paths.dir()).await {
            tokio::fs::create_dir_all(self.paths.dir()).await?;
            tokio::fs::set_permissions(self.paths.dir(), std::fs::Permissions::from_mode(0o700))
                .await?;
        }

        info!("Generating SSH key for {} at {}", project, private.display());
        self.keygen.generate(&private, project).await?;
        if !exists(&private).await {
            return Err(ProvisionError::Internal(format!(
                "key generation reported success but {} is missing",
                private.display()
            )));
        }
        restrict_to_owner(&private).await?;

        self.audit.credential_initialized(project, BackendKind::File);
        Ok(())
    }

    async fn public_key(&self, project: &str) -> Result<PublicKey> {
        validate_project_id(project)?;
        read_public_key(&self.paths.public_key(project), project).await
    }

    async fn private_key_reference(&self, project: &str) -> Result<PrivateKeyReference> {
        validate_project_id(project)?;
        let path = self.paths.private_key(project);
        if !exists(&path).await {
            return Err(ProvisionError::NotFound(format!(
                "no private key for project '{}' at {}",
                project,
                path.display()
            )));
        }
        Ok(PrivateKeyReference::File { path })
    }
}
