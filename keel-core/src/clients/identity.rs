//! Client for the Azure CLI (`az`) identity commands.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::exec::{CommandOutput, Tool};
use super::{Account, AppIds, AppPatch, AppRegistration, IdentityApi, PermissionGrant};
use crate::credential::Secret;
use crate::error::Result;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountJson {
    tenant_id: String,
    user: Option<UserJson>,
}

#[derive(Debug, Deserialize)]
struct UserJson {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppJson {
    app_id: String,
    id: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    identifier_uris: Vec<String>,
    web: Option<WebJson>,
    #[serde(default)]
    required_resource_access: Vec<ResourceAccessJson>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebJson {
    #[serde(default)]
    redirect_uris: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceAccessJson {
    #[serde(default)]
    resource_access: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ObjectJson {
    id: String,
}

#[derive(Deserialize)]
struct CredentialJson {
    password: String,
}

impl From<AppJson> for AppRegistration {
    fn from(app: AppJson) -> Self {
        AppRegistration {
            app_id: app.app_id,
            object_id: app.id,
            display_name: app.display_name,
            redirect_uris: app.web.map(|w| w.redirect_uris).unwrap_or_default(),
            identifier_uris: app.identifier_uris,
            permission_count: app
                .required_resource_access
                .iter()
                .map(|r| r.resource_access.len())
                .sum(),
        }
    }
}

fn is_missing(output: &CommandOutput) -> bool {
    let stderr = output.stderr.to_lowercase();
    stderr.contains("does not exist") || stderr.contains("not found")
}

/// Client for Entra ID application registrations through `az`.
#[derive(Debug, Clone)]
pub struct AzClient {
    tool: Tool,
}

impl AzClient {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            tool: Tool::new(program, "az"),
        }
    }
}

#[async_trait]
impl IdentityApi for AzClient {
    async fn account(&self) -> Result<Account> {
        let account: AccountJson = self.tool.run_json(["account", "show", "-o", "json"]).await?;
        Ok(Account {
            tenant_id: account.tenant_id,
            user: account.user.map(|u| u.name).unwrap_or_default(),
        })
    }

    async fn create_app(&self, display_name: &str, audience: &str) -> Result<AppIds> {
        info!("Creating app registration {}", display_name);
        let app: AppJson = self
            .tool
            .run_json([
                "ad",
                "app",
                "create",
                "--display-name",
                display_name,
                "--sign-in-audience",
                audience,
                "-o",
                "json",
            ])
            .await?;
        Ok(AppIds {
            app_id: app.app_id,
            object_id: app.id,
        })
    }

    async fn update_app(&self, app_id: &str, patch: &AppPatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let mut args = vec![
            "ad".to_string(),
            "app".to_string(),
            "update".to_string(),
            "--id".to_string(),
            app_id.to_string(),
        ];
        if !patch.redirect_uris.is_empty() {
            args.push("--web-redirect-uris".to_string());
            args.extend(patch.redirect_uris.iter().cloned());
        }
        if !patch.identifier_uris.is_empty() {
            args.push("--identifier-uris".to_string());
            args.extend(patch.identifier_uris.iter().cloned());
        }
        debug!("Updating app registration {}", app_id);
        self.tool.run_checked(args).await?;
        Ok(())
    }

    async fn add_permission(&self, app_id: &str, grant: &PermissionGrant) -> Result<()> {
        debug!("Adding permission {} on {} to {}", grant.permission, grant.api, app_id);
        self.tool
            .run_checked([
                "ad",
                "app",
                "permission",
                "add",
                "--id",
                app_id,
                "--api",
                grant.api.as_str(),
                "--api-permissions",
                grant.permission.as_str(),
            ])
            .await?;
        Ok(())
    }

    async fn create_service_principal(&self, app_id: &str) -> Result<String> {
        info!("Creating service principal for {}", app_id);
        let sp: ObjectJson = self
            .tool
            .run_json(["ad", "sp", "create", "--id", app_id, "-o", "json"])
            .await?;
        Ok(sp.id)
    }

    async fn grant_admin_consent(&self, app_id: &str) -> Result<()> {
        info!("Requesting admin consent for {}", app_id);
        self.tool
            .run_checked(["ad", "app", "permission", "admin-consent", "--id", app_id])
            .await?;
        Ok(())
    }

    async fn create_secret(&self, app_id: &str, display_name: &str) -> Result<Secret> {
        info!("Generating client secret for {}", app_id);
        let credential: CredentialJson = self
            .tool
            .run_json([
                "ad",
                "app",
                "credential",
                "reset",
                "--id",
                app_id,
                "--append",
                "--display-name",
                display_name,
                "--years",
                "2",
                "-o",
                "json",
            ])
            .await?;
        Ok(Secret::new(credential.password))
    }

    async fn show_app(&self, app_id: &str) -> Result<Option<AppRegistration>> {
        let output = self
            .tool
            .run(["ad", "app", "show", "--id", app_id, "-o", "json"])
            .await?;
        if !output.success && is_missing(&output) {
            return Ok(None);
        }
        let stdout = self.tool.check(output)?;
        Ok(Some(self.tool.parse_json::<AppJson>(&stdout)?.into()))
    }

    async fn show_service_principal(&self, app_id: &str) -> Result<Option<String>> {
        let output = self
            .tool
            .run(["ad", "sp", "show", "--id", app_id, "-o", "json"])
            .await?;
        if !output.success && is_missing(&output) {
            return Ok(None);
        }
        let stdout = self.tool.check(output)?;
        Ok(Some(self.tool.parse_json::<ObjectJson>(&stdout)?.id))
    }

    async fn delete_app(&self, app_id: &str) -> Result<()> {
        info!("Deleting app registration {}", app_id);
        self.tool
            .run_checked(["ad", "app", "delete", "--id", app_id])
            .await?;
        Ok(())
    }

    async fn delete_service_principal(&self, sp_id: &str) -> Result<()> {
        info!("Deleting service principal {}", sp_id);
        self.tool
            .run_checked(["ad", "sp", "delete", "--id", sp_id])
            .await?;
        Ok(())
    }
}
