//! Client for the Hetzner Cloud CLI (`hcloud`).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::exec::{CommandOutput, Tool};
use super::ResourceApi;
use crate::error::{ProvisionError, Result};
use crate::resource::{
    DesiredResourceSpec, FirewallRule, InstanceAttributes, Observation, ObservedResource,
    ResourceAttributes, ResourceKind,
};

#[derive(Debug, Deserialize)]
struct FirewallJson {
    id: u64,
    name: String,
    #[serde(default)]
    rules: Vec<FirewallRule>,
}

#[derive(Debug, Deserialize)]
struct NameRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct DatacenterJson {
    location: NameRef,
}

#[derive(Debug, Deserialize)]
struct Ipv4Json {
    ip: String,
}

#[derive(Debug, Deserialize)]
struct PublicNetJson {
    ipv4: Option<Ipv4Json>,
}

#[derive(Debug, Deserialize)]
struct ServerJson {
    id: u64,
    name: String,
    status: String,
    server_type: NameRef,
    image: Option<NameRef>,
    datacenter: Option<DatacenterJson>,
    public_net: Option<PublicNetJson>,
}

#[derive(Debug, Deserialize)]
struct SshKeyJson {
    id: u64,
    name: String,
    public_key: String,
}

impl From<FirewallJson> for ObservedResource {
    fn from(fw: FirewallJson) -> Self {
        ObservedResource {
            kind: ResourceKind::Firewall,
            name: fw.name,
            id: fw.id.to_string(),
            attributes: ResourceAttributes::Firewall { rules: fw.rules },
            status: None,
            public_ipv4: None,
        }
    }
}

impl From<ServerJson> for ObservedResource {
    fn from(server: ServerJson) -> Self {
        ObservedResource {
            kind: ResourceKind::Instance,
            name: server.name,
            id: server.id.to_string(),
            attributes: ResourceAttributes::Instance(InstanceAttributes {
                server_type: server.server_type.name,
                image: server.image.map(|i| i.name).unwrap_or_default(),
                location: server
                    .datacenter
                    .map(|d| d.location.name)
                    .unwrap_or_default(),
                ssh_keys: vec![],
                firewalls: vec![],
            }),
            status: Some(server.status),
            public_ipv4: server.public_net.and_then(|n| n.ipv4).map(|ip| ip.ip),
        }
    }
}

impl From<SshKeyJson> for ObservedResource {
    fn from(key: SshKeyJson) -> Self {
        ObservedResource {
            kind: ResourceKind::SshKey,
            name: key.name,
            id: key.id.to_string(),
            attributes: ResourceAttributes::SshKey {
                public_key: key.public_key,
            },
            status: None,
            public_ipv4: None,
        }
    }
}

fn subcommand(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Firewall => "firewall",
        ResourceKind::Instance => "server",
        ResourceKind::SshKey => "ssh-key",
    }
}

/// hcloud `create -o json` wraps the object (`{"server": {...}}`); accept both shapes.
fn created_id(value: &Value, wrapper: &str) -> Option<String> {
    value
        .get(wrapper)
        .unwrap_or(value)
        .get("id")
        .and_then(Value::as_u64)
        .map(|id| id.to_string())
}

fn rule_args(firewall_id: &str, action: &str, rule: &FirewallRule) -> Vec<String> {
    let mut args = vec![
        "firewall".to_string(),
        action.to_string(),
        firewall_id.to_string(),
        "--direction".to_string(),
        rule.direction.as_str().to_string(),
        "--protocol".to_string(),
        rule.protocol.as_str().to_string(),
    ];
    if let Some(port) = &rule.port {
        args.push("--port".to_string());
        args.push(port.clone());
    }
    for ip in &rule.source_ips {
        args.push("--source-ips".to_string());
        args.push(ip.clone());
    }
    for ip in &rule.destination_ips {
        args.push("--destination-ips".to_string());
        args.push(ip.clone());
    }
    if let Some(description) = &rule.description {
        args.push("--description".to_string());
        args.push(description.clone());
    }
    args
}

/// Sort a `describe` invocation into present (raw JSON), absent or empty.
/// Any other failure is an external API error.
fn classify_describe<'a>(tool: &Tool, output: &'a CommandOutput) -> Result<Observation<&'a str>> {
    if !output.success {
        if output.stderr.to_lowercase().contains("not found") {
            return Ok(Observation::Absent);
        }
        return Err(tool.error(output.stderr.trim().to_string()));
    }
    if output.stdout.trim().is_empty() {
        return Ok(Observation::Empty);
    }
    Ok(Observation::Present(&output.stdout))
}

/// Client for interacting with Hetzner Cloud through `hcloud`.
#[derive(Debug, Clone)]
pub struct HcloudClient {
    tool: Tool,
}

impl HcloudClient {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            tool: Tool::new(program, "hcloud"),
        }
    }

    fn parse_observed(&self, kind: ResourceKind, stdout: &str) -> Result<ObservedResource> {
        Ok(match kind {
            ResourceKind::Firewall => self.tool.parse_json::<FirewallJson>(stdout)?.into(),
            ResourceKind::Instance => self.tool.parse_json::<ServerJson>(stdout)?.into(),
            ResourceKind::SshKey => self.tool.parse_json::<SshKeyJson>(stdout)?.into(),
        })
    }

    fn parse_list(&self, kind: ResourceKind, stdout: &str) -> Result<Vec<ObservedResource>> {
        Ok(match kind {
            ResourceKind::Firewall => self
                .tool
                .parse_json::<Vec<FirewallJson>>(stdout)?
                .into_iter()
                .map(Into::into)
                .collect(),
            ResourceKind::Instance => self
                .tool
                .parse_json::<Vec<ServerJson>>(stdout)?
                .into_iter()
                .map(Into::into)
                .collect(),
            ResourceKind::SshKey => self
                .tool
                .parse_json::<Vec<SshKeyJson>>(stdout)?
                .into_iter()
                .map(Into::into)
                .collect(),
        })
    }

    async fn create_with(&self, args: Vec<String>, wrapper: &str) -> Result<String> {
        let value: Value = self.tool.run_json(args).await?;
        created_id(&value, wrapper)
            .ok_or_else(|| self.tool.error(format!("create response without {} id", wrapper)))
    }
}

#[async_trait]
impl ResourceApi for HcloudClient {
    async fn describe(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Observation<ObservedResource>> {
        debug!("Describing {} {}", kind, name);
        let output = self
            .tool
            .run([subcommand(kind), "describe", name, "-o", "json"])
            .await?;

        Ok(match classify_describe(&self.tool, &output)? {
            Observation::Present(stdout) => Observation::Present(self.parse_observed(kind, stdout)?),
            Observation::Absent => Observation::Absent,
            Observation::Empty => Observation::Empty,
        })
    }

    async fn create(&self, spec: &DesiredResourceSpec) -> Result<String> {
        match &spec.attributes {
            ResourceAttributes::Firewall { rules } => {
                if !rules.is_empty() {
                    return Err(ProvisionError::Validation(format!(
                        "firewall '{}' must be created without rules, add them with add-rule",
                        spec.name
                    )));
                }
                info!("Creating firewall {}", spec.name);
                self
                    .create_with(
                        vec![
                            "firewall".to_string(),
                            "create".to_string(),
                            "--name".to_string(),
                            spec.name.clone(),
                            "-o".to_string(),
                            "json".to_string(),
                        ],
                        "firewall",
                    )
                    .await
            }
            ResourceAttributes::Instance(attrs) => {
                info!(
                    "Creating server {} ({} / {} / {})",
                    spec.name, attrs.server_type, attrs.image, attrs.location
                );
                let mut args = vec![
                    "server".to_string(),
                    "create".to_string(),
                    "--name".to_string(),
                    spec.name.clone(),
                    "--type".to_string(),
                    attrs.server_type.clone(),
                    "--image".to_string(),
                    attrs.image.clone(),
                    "--location".to_string(),
                    attrs.location.clone(),
                ];
                for key in &attrs.ssh_keys {
                    args.push("--ssh-key".to_string());
                    args.push(key.clone());
                }
                for fw in &attrs.firewalls {
                    args.push("--firewall".to_string());
                    args.push(fw.clone());
                }
                args.push("-o".to_string());
                args.push("json".to_string());
                self.create_with(args, "server").await
            }
            ResourceAttributes::SshKey { public_key } => {
                info!("Creating ssh key {}", spec.name);
                self.create_with(
                    vec![
                        "ssh-key".to_string(),
                        "create".to_string(),
                        "--name".to_string(),
                        spec.name.clone(),
                        "--public-key".to_string(),
                        public_key.trim().to_string(),
                        "-o".to_string(),
                        "json".to_string(),
                    ],
                    "ssh_key",
                )
                .await
            }
        }
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<()> {
        info!("Deleting {} {}", kind, id);
        self.tool.run_checked([subcommand(kind), "delete", id]).await?;
        Ok(())
    }

    async fn list(&self, kind: ResourceKind) -> Result<Vec<ObservedResource>> {
        let stdout = self
            .tool
            .run_checked([subcommand(kind), "list", "-o", "json"])
            .await?;
        self.parse_list(kind, &stdout)
    }

    async fn add_rule(&self, firewall_id: &str, rule: &FirewallRule) -> Result<()> {
        debug!("Adding rule to firewall {}: {}", firewall_id, rule.canonical());
        self.tool
            .run_checked(rule_args(firewall_id, "add-rule", rule))
            .await?;
        Ok(())
    }

    async fn delete_rule(&self, firewall_id: &str, rule: &FirewallRule) -> Result<()> {
        debug!("Deleting rule from firewall {}: {}", firewall_id, rule.canonical());
        self.tool
            .run_checked(rule_args(firewall_id, "delete-rule", rule))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Direction, Protocol};

    #[test]
    fn test_parse_firewall_describe() {
        let client = HcloudClient::new("hcloud");
        let json = r#"{
            "id": 42,
            "name": "web",
            "labels": {},
            "rules": [
                {"direction": "in", "protocol": "tcp", "port": "22",
                 "source_ips": ["0.0.0.0/0", "::/0"], "destination_ips": [], "description": null},
                {"direction": "in", "protocol": "icmp", "port": null,
                 "source_ips": ["0.0.0.0/0"], "destination_ips": []}
            ]
        }"#;
        let observed = client.parse_observed(ResourceKind::Firewall, json).unwrap();
        assert_eq!(observed.id, "42");
        match observed.attributes {
            ResourceAttributes::Firewall { rules } => {
                assert_eq!(rules.len(), 2);
                assert_eq!(rules[0].direction, Direction::In);
                assert_eq!(rules[1].protocol, Protocol::Icmp);
                assert_eq!(rules[1].port, None);
            }
            other => panic!("unexpected attributes: {:?}", other),
        }
    }

    #[test]
    fn test_parse_server_describe() {
        let client = HcloudClient::new("hcloud");
        let json = r#"{
            "id": 7, "name": "app-1", "status": "running",
            "server_type": {"name": "cx22", "cores": 2},
            "image": {"name": "ubuntu-24.04"},
            "datacenter": {"name": "fsn1-dc14", "location": {"name": "fsn1"}},
            "public_net": {"ipv4": {"ip": "203.0.113.10"}}
        }"#;
        let observed = client.parse_observed(ResourceKind::Instance, json).unwrap();
        assert_eq!(observed.status.as_deref(), Some("running"));
        assert_eq!(observed.public_ipv4.as_deref(), Some("203.0.113.10"));
        match observed.attributes {
            ResourceAttributes::Instance(attrs) => {
                assert_eq!(attrs.location, "fsn1");
                assert_eq!(attrs.image, "ubuntu-24.04");
            }
            other => panic!("unexpected attributes: {:?}", other),
        }
    }

    fn output(success: bool, stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            success,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_classify_describe() {
        let tool = Tool::new("hcloud", "hcloud");

        let missing = output(false, "", "hcloud: Firewall not found: web\n");
        assert_eq!(classify_describe(&tool, &missing).unwrap(), Observation::Absent);

        let empty = output(true, "  \n", "");
        assert_eq!(classify_describe(&tool, &empty).unwrap(), Observation::Empty);

        let found = output(true, "{\"id\": 1}", "");
        assert_eq!(
            classify_describe(&tool, &found).unwrap(),
            Observation::Present("{\"id\": 1}")
        );

        let denied = output(false, "", "hcloud: unauthorized (unauthorized)\n");
        match classify_describe(&tool, &denied) {
            Err(ProvisionError::ExternalApi { service, message }) => {
                assert_eq!(service, "hcloud");
                assert_eq!(message, "hcloud: unauthorized (unauthorized)");
            }
            other => panic!("expected an external failure, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_describe_is_external_failure() {
        let client = HcloudClient::new("hcloud");
        assert!(matches!(
            client.parse_observed(ResourceKind::Firewall, "{\"id\": "),
            Err(ProvisionError::ExternalApi { .. })
        ));
        assert!(matches!(
            client.parse_observed(ResourceKind::SshKey, "[]"),
            Err(ProvisionError::ExternalApi { .. })
        ));
    }

    #[tokio::test]
    async fn test_firewall_created_without_rules_only() {
        let client = HcloudClient::new("/nonexistent/hcloud");
        let rule = FirewallRule {
            direction: Direction::In,
            protocol: Protocol::Icmp,
            port: None,
            source_ips: vec!["0.0.0.0/0".to_string()],
            destination_ips: vec![],
            description: None,
        };
        let result = client
            .create(&DesiredResourceSpec::firewall("web", vec![rule]))
            .await;
        assert!(matches!(result, Err(ProvisionError::Validation(_))));
    }

    #[test]
    fn test_created_id_accepts_wrapped_and_flat() {
        let wrapped: Value = serde_json::from_str(r#"{"server": {"id": 9}, "root_password": null}"#).unwrap();
        let flat: Value = serde_json::from_str(r#"{"id": 11}"#).unwrap();
        assert_eq!(created_id(&wrapped, "server").as_deref(), Some("9"));
        assert_eq!(created_id(&flat, "firewall").as_deref(), Some("11"));
    }

    #[test]
    fn test_rule_args() {
        let rule = FirewallRule {
            direction: Direction::In,
            protocol: Protocol::Tcp,
            port: Some("80".to_string()),
            source_ips: vec!["0.0.0.0/0".to_string()],
            destination_ips: vec![],
            description: None,
        };
        assert_eq!(
            rule_args("5", "add-rule", &rule).join(" "),
            "firewall add-rule 5 --direction in --protocol tcp --port 80 --source-ips 0.0.0.0/0"
        );
    }
}
