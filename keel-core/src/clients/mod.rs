//! Clients for the external providers.
//!
//! Each provider is a trait so the engine can run against fakes in tests:
//! - [`ResourceApi`]: compute instances, firewalls and SSH keys (hcloud)
//! - [`IdentityApi`]: application registrations and service principals (az)
//! - [`VaultApi`]: vault-resident secrets and keys (op)

pub mod exec;
pub mod hcloud;
pub mod identity;
pub mod vault;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::credential::Secret;
use crate::error::Result;
use crate::resource::{DesiredResourceSpec, FirewallRule, Observation, ObservedResource, ResourceKind};

pub use exec::Tool;
pub use hcloud::HcloudClient;
pub use identity::AzClient;
pub use vault::OpClient;

/// Compute, firewall and key resource API.
#[async_trait]
pub trait ResourceApi: Send + Sync {
    /// Look a resource up by its unique name.
    async fn describe(&self, kind: ResourceKind, name: &str)
        -> Result<Observation<ObservedResource>>;

    /// Create a resource with all of its attributes. Returns the provider id.
    /// Firewalls are created empty; their rules go through [`add_rule`](Self::add_rule).
    async fn create(&self, spec: &DesiredResourceSpec) -> Result<String>;

    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<()>;

    /// Every resource of `kind` in the project. The reconcilers never call
    /// this; they only touch the resource they were given by name.
    async fn list(&self, kind: ResourceKind) -> Result<Vec<ObservedResource>>;

    async fn add_rule(&self, firewall_id: &str, rule: &FirewallRule) -> Result<()>;

    async fn delete_rule(&self, firewall_id: &str, rule: &FirewallRule) -> Result<()>;
}

/// Identifiers of a freshly created application registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIds {
    /// Client id, used by every other call.
    pub app_id: String,
    pub object_id: String,
}

/// Mutable attributes of an application registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppPatch {
    pub redirect_uris: Vec<String>,
    pub identifier_uris: Vec<String>,
}

impl AppPatch {
    pub fn is_empty(&self) -> bool {
        self.redirect_uris.is_empty() && self.identifier_uris.is_empty()
    }
}

/// A permission an application requests from an API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionGrant {
    /// Resource application id of the API (e.g. Microsoft Graph).
    pub api: String,
    /// `<permission-id>=<Scope|Role>`.
    pub permission: String,
}

/// Provider view of an application registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppRegistration {
    pub app_id: String,
    pub object_id: String,
    pub display_name: String,
    pub redirect_uris: Vec<String>,
    pub identifier_uris: Vec<String>,
    pub permission_count: usize,
}

/// Signed-in identity provider account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub tenant_id: String,
    pub user: String,
}

/// Identity provider API.
#[async_trait]
pub trait IdentityApi: Send + Sync {
    /// Current signed-in account; fails when not authenticated.
    async fn account(&self) -> Result<Account>;

    async fn create_app(&self, display_name: &str, audience: &str) -> Result<AppIds>;

    async fn update_app(&self, app_id: &str, patch: &AppPatch) -> Result<()>;

    async fn add_permission(&self, app_id: &str, grant: &PermissionGrant) -> Result<()>;

    /// Returns the service principal object id.
    async fn create_service_principal(&self, app_id: &str) -> Result<String>;

    async fn grant_admin_consent(&self, app_id: &str) -> Result<()>;

    /// Generate a new client secret on the registration.
    async fn create_secret(&self, app_id: &str, display_name: &str) -> Result<Secret>;

    async fn show_app(&self, app_id: &str) -> Result<Option<AppRegistration>>;

    /// Returns the service principal object id when it exists.
    async fn show_service_principal(&self, app_id: &str) -> Result<Option<String>>;

    async fn delete_app(&self, app_id: &str) -> Result<()>;

    async fn delete_service_principal(&self, sp_id: &str) -> Result<()>;
}

/// Vault item categories used by keel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemCategory {
    SshKey,
    ApiCredential,
}

impl ItemCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemCategory::SshKey => "SSH Key",
            ItemCategory::ApiCredential => "API Credential",
        }
    }
}

/// A labelled field on a vault item.
#[derive(Clone, PartialEq, Eq)]
pub struct ItemField {
    pub label: String,
    pub value: String,
    pub concealed: bool,
}

impl ItemField {
    pub fn text(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
            concealed: false,
        }
    }

    pub fn concealed(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
            concealed: true,
        }
    }
}

impl std::fmt::Debug for ItemField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = if self.concealed { "<redacted>" } else { &self.value };
        f.debug_struct("ItemField")
            .field("label", &self.label)
            .field("value", &value)
            .finish()
    }
}

/// A vault item as returned by the vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultItem {
    pub id: String,
    pub title: String,
    pub vault: String,
    pub fields: Vec<ItemField>,
}

impl VaultItem {
    pub fn field(&self, label: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.label.eq_ignore_ascii_case(label))
            .map(|f| f.value.as_str())
    }
}

/// Secret vault API.
#[async_trait]
pub trait VaultApi: Send + Sync {
    /// Whether the vault tool is installed and signed in right now.
    async fn is_authenticated(&self) -> bool;

    /// Returns the vault id when it exists.
    async fn vault_get(&self, name: &str) -> Result<Option<String>>;

    async fn vault_create(&self, name: &str) -> Result<String>;

    async fn item_get(&self, title: &str, vault: &str) -> Result<Option<VaultItem>>;

    /// Create an item. An SSH key item without a `private key` field gets a
    /// freshly generated key.
    async fn item_create(
        &self,
        category: ItemCategory,
        title: &str,
        vault: &str,
        fields: &[ItemField],
    ) -> Result<VaultItem>;

    /// Replace the given fields on an existing item.
    async fn item_edit(&self, title: &str, vault: &str, fields: &[ItemField]) -> Result<VaultItem>;
}
