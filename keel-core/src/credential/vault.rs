//! Vault-backed SSH credentials, including the one-time migration of
//! file-based keys into the vault.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::file::{exists, read_public_key};
use super::{validate_project_id, BackendKind, CredentialBackend, KeyPaths, PrivateKeyReference};
use crate::audit::ProvisionAuditLogger;
use crate::clients::vault::{PRIVATE_KEY_FIELD, PUBLIC_KEY_FIELD};
use crate::clients::{ItemCategory, ItemField, VaultApi, VaultItem};
use crate::error::{ProvisionError, Result};
use crate::keys::PublicKey;
use crate::operator::Operator;

/// Create the named vault unless it exists.
pub(crate) async fn ensure_vault(api: &dyn VaultApi, name: &str) -> Result<()> {
    if api.vault_get(name).await?.is_none() {
        info!("Vault {} does not exist, creating it", name);
        api.vault_create(name).await?;
    }
    Ok(())
}

/// Keys held in the vault and served to SSH through the vault's agent.
pub struct VaultBackend {
    vault: Arc<dyn VaultApi>,
    vault_name: String,
    /// Layout of file-based keys, checked for migration.
    files: KeyPaths,
    agent_socket: PathBuf,
    operator: Arc<dyn Operator>,
    audit: ProvisionAuditLogger,
}

impl VaultBackend {
    pub fn new(
        vault: Arc<dyn VaultApi>,
        vault_name: &str,
        files: KeyPaths,
        agent_socket: &Path,
        operator: Arc<dyn Operator>,
    ) -> Self {
        Self {
            vault,
            vault_name: vault_name.to_string(),
            files,
            agent_socket: agent_socket.to_path_buf(),
            operator,
            audit: ProvisionAuditLogger::new("credential"),
        }
    }

    pub fn item_title(project: &str) -> String {
        format!("{}-ssh", project)
    }

    async fn item(&self, project: &str) -> Result<VaultItem> {
        self.vault
            .item_get(&Self::item_title(project), &self.vault_name)
            .await?
            .ok_or_else(|| {
                ProvisionError::NotFound(format!(
                    "no credential for project '{}' in vault '{}'",
                    project, self.vault_name
                ))
            })
    }

    async fn generate(&self, project: &str) -> Result<()> {
        info!("Generating vault-resident SSH key for {}", project);
        self.vault
            .item_create(
                ItemCategory::SshKey,
                &Self::item_title(project),
                &self.vault_name,
                &[],
            )
            .await?;
        Ok(())
    }

    /// Import file-based key material, then remove the local files.
    async fn migrate(&self, project: &str) -> Result<()> {
        let private = self.files.private_key(project);
        let public = self.files.public_key(project);

        self.operator.present(&format!(
            "Found a file-based SSH key for '{}' at {}. It will be imported into vault '{}' \
             and the local files removed.",
            project,
            private.display(),
            self.vault_name
        ));
        if !self
            .operator
            .confirm(&format!("Migrate the key for '{}' into the vault?", project))
            .await?
        {
            return Err(ProvisionError::UserAbort(format!(
                "migration of '{}' into vault '{}' declined",
                project, self.vault_name
            )));
        }

        let private_material = tokio::fs::read_to_string(&private).await?;
        let mut fields = vec![ItemField::concealed(PRIVATE_KEY_FIELD, private_material)];
        if let Ok(key) = read_public_key(&public, project).await {
            fields.push(ItemField::text(PUBLIC_KEY_FIELD, key.as_str()));
        }

        match self
            .vault
            .item_create(
                ItemCategory::SshKey,
                &Self::item_title(project),
                &self.vault_name,
                &fields,
            )
            .await
        {
            Ok(_) => {
                tokio::fs::remove_file(&private).await?;
                if exists(&public).await {
                    tokio::fs::remove_file(&public).await?;
                }
                self.audit.credential_migrated(project, &self.vault_name);
                Ok(())
            }
            Err(e) => {
                warn!("Importing key for {} into vault failed: {}", project, e);
                // A replacement key would orphan the original; that needs a fresh yes.
                self.operator.present(&format!(
                    "Importing the existing key failed: {}. A new vault key can be generated \
                     instead; the original key at {} is kept on disk but no longer used, and \
                     hosts that trust it must be updated.",
                    e,
                    private.display()
                ));
                if !self
                    .operator
                    .confirm("Generate a new vault-resident key instead?")
                    .await?
                {
                    return Err(ProvisionError::UserAbort(format!(
                        "vault import of '{}' failed and key replacement was declined",
                        project
                    )));
                }
                self.generate(project).await?;
                self.audit.credential_replaced(
                    project,
                    &self.vault_name,
                    &private.display().to_string(),
                );
                Ok(())
            }
        }
    }
}

#[async_trait]
impl CredentialBackend for VaultBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Vault
    }

    async fn init(&self, project: &str) -> Result<()> {
        validate_project_id(project)?;
        ensure_vault(self.vault.as_ref(), &self.vault_name).await?;

        let title = Self::item_title(project);
        if self.vault.item_get(&title, &self.vault_name).await?.is_some() {
            debug!("Vault item {} already present", title);
            return Ok(());
        }

        if exists(&self.files.private_key(project)).await {
            self.migrate(project).await?;
        } else {
            self.generate(project).await?;
        }

        self.audit.credential_initialized(project, BackendKind::Vault);
        Ok(())
    }

    async fn public_key(&self, project: &str) -> Result<PublicKey> {
        validate_project_id(project)?;
        let item = self.item(project).await?;
        let line = item.field(PUBLIC_KEY_FIELD).ok_or_else(|| {
            ProvisionError::NotFound(format!(
                "vault item '{}' has no public key",
                Self::item_title(project)
            ))
        })?;
        PublicKey::parse(line)
    }

    async fn private_key_reference(&self, project: &str) -> Result<PrivateKeyReference> {
        validate_project_id(project)?;
        let item = self.item(project).await?;
        Ok(PrivateKeyReference::Agent {
            locator: format!("op://{}/{}/{}", item.vault, item.title, PRIVATE_KEY_FIELD),
            socket: self.agent_socket.clone(),
        })
    }
}
