//! Client for the 1Password CLI (`op`).
//!
//! Items carrying secret material are always sent as a JSON template on
//! stdin, never as command line arguments.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::exec::{CommandOutput, Tool};
use super::{ItemCategory, ItemField, VaultApi, VaultItem};
use crate::error::Result;

/// Field label 1Password uses for the private half of an SSH key item.
pub const PRIVATE_KEY_FIELD: &str = "private key";
/// Field label 1Password uses for the public half of an SSH key item.
pub const PUBLIC_KEY_FIELD: &str = "public key";

#[derive(Debug, Deserialize)]
struct VaultJson {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ItemVaultJson {
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct FieldJson {
    #[serde(default)]
    label: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default, rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct ItemJson {
    id: String,
    title: String,
    vault: Option<ItemVaultJson>,
    #[serde(default)]
    fields: Vec<FieldJson>,
}

#[derive(Serialize)]
struct TemplateField<'a> {
    label: &'a str,
    value: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Serialize)]
struct Template<'a> {
    title: &'a str,
    category: &'a str,
    fields: Vec<TemplateField<'a>>,
}

fn template_category(category: ItemCategory) -> &'static str {
    match category {
        ItemCategory::SshKey => "SSH_KEY",
        ItemCategory::ApiCredential => "API_CREDENTIAL",
    }
}

fn template_field(field: &ItemField) -> TemplateField<'_> {
    let kind = if field.label == PRIVATE_KEY_FIELD {
        "SSHKEY"
    } else if field.concealed {
        "CONCEALED"
    } else {
        "STRING"
    };
    TemplateField {
        label: &field.label,
        value: &field.value,
        kind,
    }
}

impl ItemJson {
    fn into_item(self, vault: &str) -> VaultItem {
        VaultItem {
            id: self.id,
            title: self.title,
            vault: self
                .vault
                .map(|v| v.name)
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| vault.to_string()),
            fields: self
                .fields
                .into_iter()
                .filter(|f| !f.label.is_empty())
                .map(|f| ItemField {
                    concealed: f.kind == "CONCEALED" || f.kind == "SSHKEY",
                    label: f.label,
                    value: f.value.unwrap_or_default(),
                })
                .collect(),
        }
    }
}

fn is_missing(output: &CommandOutput) -> bool {
    let stderr = output.stderr.to_lowercase();
    stderr.contains("isn't a vault") || stderr.contains("isn't an item") || stderr.contains("not found")
}

/// Client for interacting with 1Password through `op`.
#[derive(Debug, Clone)]
pub struct OpClient {
    tool: Tool,
}

impl OpClient {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            tool: Tool::new(program, "op"),
        }
    }

    fn render_template(&self, category: ItemCategory, title: &str, fields: &[ItemField]) -> Result<String> {
        let template = Template {
            title,
            category: template_category(category),
            fields: fields.iter().map(template_field).collect(),
        };
        serde_json::to_string(&template)
            .map_err(|e| self.tool.error(format!("failed to encode item template: {}", e)))
    }
}

#[async_trait]
impl VaultApi for OpClient {
    async fn is_authenticated(&self) -> bool {
        match self.tool.run(["whoami", "--format", "json"]).await {
            Ok(output) => output.success,
            Err(e) => {
                debug!("op unavailable: {}", e);
                false
            }
        }
    }

    async fn vault_get(&self, name: &str) -> Result<Option<String>> {
        let output = self
            .tool
            .run(["vault", "get", name, "--format", "json"])
            .await?;
        if !output.success && is_missing(&output) {
            return Ok(None);
        }
        let stdout = self.tool.check(output)?;
        Ok(Some(self.tool.parse_json::<VaultJson>(&stdout)?.id))
    }

    async fn vault_create(&self, name: &str) -> Result<String> {
        info!("Creating vault {}", name);
        let vault: VaultJson = self
            .tool
            .run_json(["vault", "create", name, "--format", "json"])
            .await?;
        Ok(vault.id)
    }

    async fn item_get(&self, title: &str, vault: &str) -> Result<Option<VaultItem>> {
        let output = self
            .tool
            .run(["item", "get", title, "--vault", vault, "--format", "json"])
            .await?;
        if !output.success && is_missing(&output) {
            return Ok(None);
        }
        let stdout = self.tool.check(output)?;
        Ok(Some(self.tool.parse_json::<ItemJson>(&stdout)?.into_item(vault)))
    }

    async fn item_create(
        &self,
        category: ItemCategory,
        title: &str,
        vault: &str,
        fields: &[ItemField],
    ) -> Result<VaultItem> {
        let generate = category == ItemCategory::SshKey
            && !fields.iter().any(|f| f.label == PRIVATE_KEY_FIELD);

        let output = if generate {
            info!("Creating vault item {} with a generated ed25519 key", title);
            self.tool
                .run([
                    "item",
                    "create",
                    "--category",
                    category.as_str(),
                    "--title",
                    title,
                    "--vault",
                    vault,
                    "--ssh-generate-key",
                    "ed25519",
                    "--format",
                    "json",
                ])
                .await?
        } else {
            info!("Creating vault item {} ({})", title, category.as_str());
            let template = self.render_template(category, title, fields)?;
            self.tool
                .run_with_stdin(
                    ["item", "create", "--vault", vault, "--format", "json", "-"],
                    &template,
                )
                .await?
        };

        let stdout = self.tool.check(output)?;
        Ok(self.tool.parse_json::<ItemJson>(&stdout)?.into_item(vault))
    }

    async fn item_edit(&self, title: &str, vault: &str, fields: &[ItemField]) -> Result<VaultItem> {
        info!("Updating vault item {}", title);
        let template = self.render_template(ItemCategory::ApiCredential, title, fields)?;
        let output = self
            .tool
            .run_with_stdin(
                ["item", "edit", title, "--vault", vault, "--format", "json", "-"],
                &template,
            )
            .await?;
        let stdout = self.tool.check(output)?;
        Ok(self.tool.parse_json::<ItemJson>(&stdout)?.into_item(vault))
    }
}
