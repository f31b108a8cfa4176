//! Desired-state configuration (`keel.toml`).

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::clients::PermissionGrant;
use crate::credential::validate_project_id;
use crate::error::{ProvisionError, Result};
use crate::resource::{DesiredResourceSpec, FirewallRule, InstanceAttributes};

/// Expand a leading `~/` to the current user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

/// Where credential material lives for both backends.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CredentialSettings {
    /// Vault that holds SSH keys and identity secrets.
    pub vault: String,
    /// Directory for file-backed SSH keys.
    pub key_dir: PathBuf,
    /// File name prefix for file-backed SSH keys.
    pub key_prefix: String,
    /// Directory for file-backed `KEY=VALUE` secret files.
    pub secrets_dir: PathBuf,
    /// SSH agent socket serving vault-resident keys.
    pub agent_socket: PathBuf,
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            vault: "keel".to_string(),
            key_dir: PathBuf::from("~/.ssh"),
            key_prefix: "keel_".to_string(),
            secrets_dir: PathBuf::from("~/.config/keel/secrets"),
            agent_socket: PathBuf::from("~/.1password/agent.sock"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FirewallConfig {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<FirewallRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshKeyConfig {
    /// Name of the key at the provider.
    pub name: String,
}

fn default_ready_timeout() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    5
}

fn default_login_user() -> String {
    "root".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceConfig {
    pub name: String,
    pub server_type: String,
    pub image: String,
    pub location: String,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Login account written to the SSH client config.
    #[serde(default = "default_login_user")]
    pub user: String,
}

/// One application registration. `{app_id}` in identifier URIs is replaced
/// with the id assigned at creation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub display_name: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub identifier_uris: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<PermissionGrant>,
    /// Generate and persist a client secret for this registration.
    #[serde(default)]
    pub secret: bool,
    /// Minimum number of permission grants expected during verification.
    #[serde(default)]
    pub min_permissions: usize,
}

fn default_audience() -> String {
    "AzureADMyOrg".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityConfig {
    #[serde(default = "default_audience")]
    pub audience: String,
    pub server: AppConfig,
    pub client: AppConfig,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshConfigSettings {
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for SshConfigSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("~/.ssh/config"),
            enabled: true,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeelConfig {
    pub project: String,
    #[serde(default)]
    pub credentials: CredentialSettings,
    pub firewall: Option<FirewallConfig>,
    pub ssh_key: Option<SshKeyConfig>,
    pub instance: Option<InstanceConfig>,
    pub identity: Option<IdentityConfig>,
    #[serde(default)]
    pub ssh_config: SshConfigSettings,
}

impl KeelConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ProvisionError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let mut config: KeelConfig =
            toml::from_str(contents).map_err(|e| ProvisionError::Config(e.to_string()))?;
        config.validate()?;
        config.expand_paths();
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        validate_project_id(&self.project).map_err(|e| ProvisionError::Config(e.to_string()))?;

        let mut names = Vec::new();
        if let Some(fw) = &self.firewall {
            names.push(("firewall.name", fw.name.as_str()));
        }
        if let Some(key) = &self.ssh_key {
            names.push(("ssh_key.name", key.name.as_str()));
        }
        if let Some(instance) = &self.instance {
            names.push(("instance.name", instance.name.as_str()));
            names.push(("instance.server_type", instance.server_type.as_str()));
            names.push(("instance.image", instance.image.as_str()));
            names.push(("instance.location", instance.location.as_str()));
            if instance.poll_interval_secs == 0 {
                return Err(ProvisionError::Config(
                    "instance.poll_interval_secs must be positive".to_string(),
                ));
            }
        }
        if let Some(identity) = &self.identity {
            names.push(("identity.server.display_name", identity.server.display_name.as_str()));
            names.push(("identity.client.display_name", identity.client.display_name.as_str()));
        }
        if let Some((field, _)) = names.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(ProvisionError::Config(format!("{} must not be empty", field)));
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        let creds = &mut self.credentials;
        creds.key_dir = expand_home(&creds.key_dir);
        creds.secrets_dir = expand_home(&creds.secrets_dir);
        creds.agent_socket = expand_home(&creds.agent_socket);
        self.ssh_config.path = expand_home(&self.ssh_config.path);
    }

    /// Provider-side SSH key name; defaults to the project id.
    pub fn ssh_key_name(&self) -> String {
        self.ssh_key
            .as_ref()
            .map(|k| k.name.clone())
            .unwrap_or_else(|| self.project.clone())
    }

    pub fn firewall_spec(&self) -> Option<DesiredResourceSpec> {
        self.firewall
            .as_ref()
            .map(|fw| DesiredResourceSpec::firewall(&fw.name, fw.rules.clone()))
    }

    /// Instance spec; the SSH key and firewall from this config are attached at creation.
    pub fn instance_spec(&self) -> Option<DesiredResourceSpec> {
        self.instance.as_ref().map(|instance| {
            DesiredResourceSpec::instance(
                &instance.name,
                InstanceAttributes {
                    server_type: instance.server_type.clone(),
                    image: instance.image.clone(),
                    location: instance.location.clone(),
                    ssh_keys: vec![self.ssh_key_name()],
                    firewalls: self.firewall.iter().map(|fw| fw.name.clone()).collect(),
                },
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Direction, Protocol, ResourceAttributes};

    const SAMPLE: &str = r#"
project = "demo"

[credentials]
vault = "infra"

[firewall]
name = "demo-fw"

[[firewall.rules]]
direction = "in"
protocol = "tcp"
port = "22"
source_ips = ["0.0.0.0/0", "::/0"]

[[firewall.rules]]
direction = "in"
protocol = "icmp"
source_ips = ["0.0.0.0/0"]

[instance]
name = "demo-1"
server_type = "cx22"
image = "ubuntu-24.04"
location = "fsn1"

[identity.server]
display_name = "demo-api"
identifier_uris = ["api://{app_id}"]

[identity.client]
display_name = "demo-web"
redirect_uris = ["https://demo.example.com/auth/callback"]
secret = true
min_permissions = 1

[[identity.client.permissions]]
api = "00000003-0000-0000-c000-000000000000"
permission = "e1fe6dd8-ba31-4d61-89e7-88639da4683d=Scope"
"#;

    #[test]
    fn test_parse_sample() {
        let config = KeelConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.project, "demo");
        assert_eq!(config.credentials.vault, "infra");
        assert_eq!(config.credentials.key_prefix, "keel_");

        let fw = config.firewall_spec().unwrap();
        match fw.attributes {
            ResourceAttributes::Firewall { rules } => {
                assert_eq!(rules.len(), 2);
                assert_eq!(rules[0].direction, Direction::In);
                assert_eq!(rules[1].protocol, Protocol::Icmp);
            }
            other => panic!("unexpected attributes: {:?}", other),
        }

        let identity = config.identity.as_ref().unwrap();
        assert_eq!(identity.audience, "AzureADMyOrg");
        assert!(identity.client.secret);
        assert!(!identity.server.secret);
        assert_eq!(identity.client.permissions.len(), 1);
    }

    #[test]
    fn test_instance_spec_attaches_key_and_firewall() {
        let config = KeelConfig::from_toml(SAMPLE).unwrap();
        let spec = config.instance_spec().unwrap();
        match spec.attributes {
            ResourceAttributes::Instance(attrs) => {
                assert_eq!(attrs.ssh_keys, vec!["demo"]);
                assert_eq!(attrs.firewalls, vec!["demo-fw"]);
            }
            other => panic!("unexpected attributes: {:?}", other),
        }
        assert_eq!(config.instance.unwrap().ready_timeout_secs, 300);
    }

    #[test]
    fn test_rejects_bad_project_id() {
        let err = KeelConfig::from_toml("project = \"../etc\"").unwrap_err();
        assert!(matches!(err, ProvisionError::Config(_)));
    }

    #[test]
    fn test_rejects_empty_names() {
        let err = KeelConfig::from_toml("project = \"demo\"\n[firewall]\nname = \" \"\n").unwrap_err();
        assert!(err.to_string().contains("firewall.name"));
    }

    #[test]
    fn test_rejects_unknown_protocol() {
        let toml = "project = \"demo\"\n[firewall]\nname = \"fw\"\n[[firewall.rules]]\ndirection = \"in\"\nprotocol = \"sctp\"\n";
        assert!(matches!(
            KeelConfig::from_toml(toml),
            Err(ProvisionError::Config(_))
        ));
    }

    #[test]
    fn test_expand_home() {
        let expanded = expand_home(Path::new("~/.ssh/config"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join(".ssh/config"));
        }
        assert_eq!(expand_home(Path::new("/etc/x")), PathBuf::from("/etc/x"));
    }
}
