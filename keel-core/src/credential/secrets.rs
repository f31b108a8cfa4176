//! Secret storage for generated identity secrets.
//!
//! Same storage contract as the SSH credentials: the file variant keeps one
//! `KEY=VALUE` file per project, readable by the owner only; the vault variant
//! keeps one item per project.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::vault::ensure_vault;
use super::{validate_project_id, BackendKind, Secret};
use crate::audit::ProvisionAuditLogger;
use crate::clients::{ItemCategory, ItemField, VaultApi};
use crate::error::{ProvisionError, Result};

/// Persists named secrets per project.
#[async_trait]
pub trait SecretStore: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Insert or update `entries`; other keys already stored for the project are kept.
    async fn put(&self, project: &str, entries: &[ItemField]) -> Result<()>;

    async fn get(&self, project: &str, key: &str) -> Result<Option<Secret>>;
}

fn validate_entry(entry: &ItemField) -> Result<()> {
    let key_ok = !entry.label.is_empty()
        && entry
            .label
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    if !key_ok {
        return Err(ProvisionError::Validation(format!(
            "invalid secret key '{}': use A-Z, 0-9 and '_'",
            entry.label
        )));
    }
    if entry.value.contains('\n') || entry.value.contains('\r') {
        return Err(ProvisionError::Validation(format!(
            "value for '{}' must be a single line",
            entry.label
        )));
    }
    Ok(())
}

/// Parse `KEY=VALUE` lines, skipping blanks and comments.
pub fn parse_env(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .collect()
}

/// Merge `entries` into `existing`, updating keys in place and appending new ones.
pub fn merge_env(existing: &mut Vec<(String, String)>, entries: &[ItemField]) {
    for entry in entries {
        match existing.iter_mut().find(|(key, _)| *key == entry.label) {
            Some((_, value)) => *value = entry.value.clone(),
            None => existing.push((entry.label.clone(), entry.value.clone())),
        }
    }
}

pub fn render_env(project: &str, entries: &[(String, String)]) -> String {
    let mut out = format!("# keel secrets for {}\n", project);
    for (key, value) in entries {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}

/// `<dir>/<project>.env`, mode 0600.
pub struct FileSecretStore {
    dir: PathBuf,
    audit: ProvisionAuditLogger,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            audit: ProvisionAuditLogger::new("secrets"),
        }
    }

    pub fn path(&self, project: &str) -> PathBuf {
        self.dir.join(format!("{}.env", project))
    }

    async fn read(&self, path: &Path) -> Result<Vec<(String, String)>> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(parse_env(&contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(vec![]),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    fn kind(&self) -> BackendKind {
        BackendKind::File
    }

    async fn put(&self, project: &str, entries: &[ItemField]) -> Result<()> {
        validate_project_id(project)?;
        for entry in entries {
            validate_entry(entry)?;
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path(project);
        let mut stored = self.read(&path).await?;
        merge_env(&mut stored, entries);

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .await?;
        // `mode` only applies on creation; tighten files that already existed.
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        file.write_all(render_env(project, &stored).as_bytes()).await?;
        file.flush().await?;

        debug!("Wrote {} secret entries to {}", entries.len(), path.display());
        let keys: Vec<&str> = entries.iter().map(|e| e.label.as_str()).collect();
        self.audit.secret_persisted(project, BackendKind::File, &keys);
        Ok(())
    }

    async fn get(&self, project: &str, key: &str) -> Result<Option<Secret>> {
        validate_project_id(project)?;
        Ok(self
            .read(&self.path(project))
            .await?
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| Secret::new(v)))
    }
}

/// One `API Credential` item per project, titled `<project>-identity`.
pub struct VaultSecretStore {
    vault: Arc<dyn VaultApi>,
    vault_name: String,
    audit: ProvisionAuditLogger,
}

impl VaultSecretStore {
    pub fn new(vault: Arc<dyn VaultApi>, vault_name: &str) -> Self {
        Self {
            vault,
            vault_name: vault_name.to_string(),
            audit: ProvisionAuditLogger::new("secrets"),
        }
    }

    pub fn item_title(project: &str) -> String {
        format!("{}-identity", project)
    }
}

#[async_trait]
impl SecretStore for VaultSecretStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Vault
    }

    async fn put(&self, project: &str, entries: &[ItemField]) -> Result<()> {
        validate_project_id(project)?;
        for entry in entries {
            validate_entry(entry)?;
        }
        ensure_vault(self.vault.as_ref(), &self.vault_name).await?;

        let title = Self::item_title(project);
        if self.vault.item_get(&title, &self.vault_name).await?.is_some() {
            self.vault.item_edit(&title, &self.vault_name, entries).await?;
        } else {
            self.vault
                .item_create(ItemCategory::ApiCredential, &title, &self.vault_name, entries)
                .await?;
        }

        let keys: Vec<&str> = entries.iter().map(|e| e.label.as_str()).collect();
        self.audit.secret_persisted(project, BackendKind::Vault, &keys);
        Ok(())
    }

    async fn get(&self, project: &str, key: &str) -> Result<Option<Secret>> {
        validate_project_id(project)?;
        Ok(self
            .vault
            .item_get(&Self::item_title(project), &self.vault_name)
            .await?
            .and_then(|item| item.field(key).map(Secret::new)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_skips_comments_and_keeps_equals_in_values() {
        let parsed = parse_env("# header\n\nCLIENT_ID=abc\nCLIENT_SECRET=a=b==\nbogus line\n");
        assert_eq!(
            parsed,
            vec![
                ("CLIENT_ID".to_string(), "abc".to_string()),
                ("CLIENT_SECRET".to_string(), "a=b==".to_string()),
            ]
        );
    }

    #[test]
    fn test_merge_updates_in_place() {
        let mut stored = vec![
            ("A".to_string(), "1".to_string()),
            ("B".to_string(), "2".to_string()),
        ];
        merge_env(
            &mut stored,
            &[ItemField::concealed("A", "10"), ItemField::text("C", "3")],
        );
        assert_eq!(
            render_env("p", &stored),
            "# keel secrets for p\nA=10\nB=2\nC=3\n"
        );
    }

    #[test]
    fn test_rejects_multiline_values_and_bad_keys() {
        assert!(validate_entry(&ItemField::concealed("X", "a\nb")).is_err());
        assert!(validate_entry(&ItemField::text("lower", "v")).is_err());
        assert!(validate_entry(&ItemField::text("TENANT_ID", "v")).is_ok());
    }

    #[tokio::test]
    async fn test_file_store_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(dir.path().join("secrets"));
        store
            .put("demo", &[ItemField::concealed("CLIENT_SECRET", "s3cret")])
            .await
            .unwrap();
        store
            .put("demo", &[ItemField::text("CLIENT_ID", "app")])
            .await
            .unwrap();

        let meta = std::fs::metadata(store.path("demo")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert_eq!(
            store.get("demo", "CLIENT_SECRET").await.unwrap(),
            Some(Secret::new("s3cret"))
        );
        assert_eq!(store.get("demo", "CLIENT_ID").await.unwrap(), Some(Secret::new("app")));
        assert_eq!(store.get("demo", "MISSING").await.unwrap(), None);
    }
}
