//! Credential backends.
//!
//! SSH identity material lives either in a vault (1Password, served to SSH
//! through its agent) or in local files. Which one is active is resolved once
//! per process by [`BackendResolver`] and then injected into every consumer
//! as a [`CredentialBackend`] / [`SecretStore`] pair.

pub mod file;
pub mod secrets;
pub mod vault;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::info;

use crate::clients::VaultApi;
use crate::config::CredentialSettings;
use crate::error::{ProvisionError, Result};
use crate::keys::PublicKey;
use crate::operator::Operator;

pub use file::{FileBackend, KeyGenerator, SshKeygen};
pub use secrets::{FileSecretStore, SecretStore, VaultSecretStore};
pub use vault::VaultBackend;

/// Which secret-storage mechanism is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Vault,
    File,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Vault => f.write_str("vault"),
            BackendKind::File => f.write_str("file"),
        }
    }
}

/// A secret value. `Debug` never prints it and there is no `Display`.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Identity material produced by a provisioning run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub principal_id: String,
    pub object_id: String,
    pub secret: Option<Secret>,
    pub backend: BackendKind,
}

/// Where the private half of a project's SSH key can be found.
///
/// The variant decides which client directives SSH needs: agent lookup for
/// vault-resident keys, a direct file reference otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrivateKeyReference {
    Agent { locator: String, socket: PathBuf },
    File { path: PathBuf },
}

impl PrivateKeyReference {
    pub fn backend(&self) -> BackendKind {
        match self {
            PrivateKeyReference::Agent { .. } => BackendKind::Vault,
            PrivateKeyReference::File { .. } => BackendKind::File,
        }
    }

    /// Opaque vault locator or filesystem path.
    pub fn location(&self) -> String {
        match self {
            PrivateKeyReference::Agent { locator, .. } => locator.clone(),
            PrivateKeyReference::File { path } => path.display().to_string(),
        }
    }

    /// SSH client directives selecting this key.
    pub fn ssh_directives(&self) -> Vec<(&'static str, String)> {
        match self {
            PrivateKeyReference::Agent { socket, .. } => vec![
                ("IdentityAgent", socket.display().to_string()),
                ("IdentitiesOnly", "yes".to_string()),
            ],
            PrivateKeyReference::File { path } => vec![
                ("IdentityFile", path.display().to_string()),
                ("IdentitiesOnly", "yes".to_string()),
            ],
        }
    }
}

/// Uniform key-material interface over both backends.
#[async_trait]
pub trait CredentialBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Make sure key material exists for `project`. No-op when it already does.
    async fn init(&self, project: &str) -> Result<()>;

    async fn public_key(&self, project: &str) -> Result<PublicKey>;

    async fn private_key_reference(&self, project: &str) -> Result<PrivateKeyReference>;
}

/// Project ids end up in file names and vault titles.
pub fn validate_project_id(project: &str) -> Result<()> {
    let valid = !project.is_empty()
        && !project.starts_with('.')
        && project
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(ProvisionError::Validation(format!(
            "invalid project id '{}': use letters, digits, '-', '_' or '.'",
            project
        )))
    }
}

/// File layout of file-backed SSH keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPaths {
    dir: PathBuf,
    prefix: String,
}

impl KeyPaths {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn private_key(&self, project: &str) -> PathBuf {
        self.dir.join(format!("{}{}", self.prefix, project))
    }

    pub fn public_key(&self, project: &str) -> PathBuf {
        self.dir.join(format!("{}{}.pub", self.prefix, project))
    }
}

/// Resolves the active backend once and remembers the answer.
pub struct BackendResolver {
    vault: Arc<dyn VaultApi>,
    resolved: OnceCell<BackendKind>,
}

impl BackendResolver {
    pub fn new(vault: Arc<dyn VaultApi>) -> Self {
        Self {
            vault,
            resolved: OnceCell::new(),
        }
    }

    /// Vault when the vault tool is present and signed in, file otherwise.
    /// Later changes in vault availability do not change the answer.
    pub async fn resolve(&self) -> BackendKind {
        *self
            .resolved
            .get_or_init(|| async {
                let kind = if self.vault.is_authenticated().await {
                    BackendKind::Vault
                } else {
                    BackendKind::File
                };
                info!("Using {} credential backend", kind);
                kind
            })
            .await
    }
}

/// Credential backend and secret store for one resolved backend kind.
pub struct Credentials {
    pub backend: Arc<dyn CredentialBackend>,
    pub secrets: Arc<dyn SecretStore>,
}

impl Credentials {
    pub fn for_kind(
        kind: BackendKind,
        settings: &CredentialSettings,
        vault: Arc<dyn VaultApi>,
        keygen: Arc<dyn KeyGenerator>,
        operator: Arc<dyn Operator>,
    ) -> Self {
        let paths = KeyPaths::new(&settings.key_dir, &settings.key_prefix);
        match kind {
            BackendKind::Vault => Self {
                backend: Arc::new(VaultBackend::new(
                    Arc::clone(&vault),
                    &settings.vault,
                    paths,
                    &settings.agent_socket,
                    operator,
                )),
                secrets: Arc::new(VaultSecretStore::new(vault, &settings.vault)),
            },
            BackendKind::File => Self {
                backend: Arc::new(FileBackend::new(paths, keygen)),
                secrets: Arc::new(FileSecretStore::new(&settings.secrets_dir)),
            },
        }
    }
}
