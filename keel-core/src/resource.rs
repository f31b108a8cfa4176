//! Resource model shared by the reconcilers and the provider clients.
//!
//! Attributes are a closed set of per-kind variants. Comparison always goes
//! through [`ResourceAttributes::canonical`], which renders attributes into a
//! sorted set of lines so that ordering of rules or address lists never counts
//! as drift.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::keys;

/// Resource kinds the reconciler knows how to converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Firewall,
    Instance,
    SshKey,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Firewall => "firewall",
            ResourceKind::Instance => "instance",
            ResourceKind::SshKey => "ssh-key",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Traffic direction of a firewall rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

/// Protocol matched by a firewall rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Esp,
    Gre,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::Esp => "esp",
            Protocol::Gre => "gre",
        }
    }
}

/// A single firewall rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub direction: Direction,
    pub protocol: Protocol,
    /// Single port or `start-end` range. Absent for icmp/esp/gre.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default)]
    pub source_ips: Vec<String>,
    #[serde(default)]
    pub destination_ips: Vec<String>,
    /// Cosmetic; ignored when comparing rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FirewallRule {
    /// Order-insensitive textual form used for comparison and diffs.
    pub fn canonical(&self) -> String {
        let mut sources: Vec<&str> = self.source_ips.iter().map(String::as_str).collect();
        sources.sort_unstable();
        sources.dedup();
        let mut destinations: Vec<&str> =
            self.destination_ips.iter().map(String::as_str).collect();
        destinations.sort_unstable();
        destinations.dedup();

        format!(
            "rule {} {} port={} src={} dst={}",
            self.direction.as_str(),
            self.protocol.as_str(),
            self.port.as_deref().unwrap_or("-"),
            join_or_dash(&sources),
            join_or_dash(&destinations),
        )
    }
}

fn join_or_dash(items: &[&str]) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(",")
    }
}

/// Compute instance attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceAttributes {
    pub server_type: String,
    pub image: String,
    pub location: String,
    /// Creation-only: SSH key names installed at first boot.
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    /// Creation-only: firewalls attached at first boot.
    #[serde(default)]
    pub firewalls: Vec<String>,
}

/// Kind-specific attributes of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceAttributes {
    Firewall { rules: Vec<FirewallRule> },
    Instance(InstanceAttributes),
    SshKey { public_key: String },
}

impl ResourceAttributes {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceAttributes::Firewall { .. } => ResourceKind::Firewall,
            ResourceAttributes::Instance(_) => ResourceKind::Instance,
            ResourceAttributes::SshKey { .. } => ResourceKind::SshKey,
        }
    }

    /// Canonical, key-sorted form. Two attribute values are equal when their
    /// canonical sets are equal.
    pub fn canonical(&self) -> BTreeSet<String> {
        match self {
            ResourceAttributes::Firewall { rules } => {
                rules.iter().map(FirewallRule::canonical).collect()
            }
            // Creation-only fields are not observable afterwards and are left out.
            ResourceAttributes::Instance(attrs) => BTreeSet::from([
                format!("image={}", attrs.image),
                format!("location={}", attrs.location),
                format!("server_type={}", attrs.server_type),
            ]),
            ResourceAttributes::SshKey { public_key } => {
                let id = keys::fingerprint(public_key)
                    .unwrap_or_else(|_| public_key.trim().to_string());
                BTreeSet::from([format!("fingerprint={}", id)])
            }
        }
    }

    pub fn matches(&self, other: &ResourceAttributes) -> bool {
        self.canonical() == other.canonical()
    }
}

/// Difference between desired and observed attributes, in canonical form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeDiff {
    /// Present in the desired state only.
    pub added: Vec<String>,
    /// Present in the observed state only.
    pub removed: Vec<String>,
}

impl AttributeDiff {
    pub fn between(desired: &ResourceAttributes, observed: &ResourceAttributes) -> Self {
        let desired = desired.canonical();
        let observed = observed.canonical();
        Self {
            added: desired.difference(&observed).cloned().collect(),
            removed: observed.difference(&desired).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl fmt::Display for AttributeDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.removed {
            writeln!(f, "  - {}", line)?;
        }
        for line in &self.added {
            writeln!(f, "  + {}", line)?;
        }
        Ok(())
    }
}

/// Desired state for one named resource. Built per invocation, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredResourceSpec {
    pub name: String,
    pub attributes: ResourceAttributes,
}

impl DesiredResourceSpec {
    pub fn firewall(name: impl Into<String>, rules: Vec<FirewallRule>) -> Self {
        Self {
            name: name.into(),
            attributes: ResourceAttributes::Firewall { rules },
        }
    }

    pub fn instance(name: impl Into<String>, attrs: InstanceAttributes) -> Self {
        Self {
            name: name.into(),
            attributes: ResourceAttributes::Instance(attrs),
        }
    }

    pub fn ssh_key(name: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: ResourceAttributes::SshKey {
                public_key: public_key.into(),
            },
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.attributes.kind()
    }
}

/// The provider's current view of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedResource {
    pub kind: ResourceKind,
    pub name: String,
    pub id: String,
    pub attributes: ResourceAttributes,
    /// Provider lifecycle status, where the kind has one (instances).
    pub status: Option<String>,
    pub public_ipv4: Option<String>,
}

/// Result of looking a resource up by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation<T> {
    Present(T),
    /// The provider explicitly reported the name as unknown.
    Absent,
    /// The provider answered successfully but with no content. Cannot be told
    /// apart from a transient or auth problem on some providers.
    Empty,
}

impl<T> Observation<T> {
    pub fn into_present(self) -> Option<T> {
        match self {
            Observation::Present(value) => Some(value),
            Observation::Absent | Observation::Empty => None,
        }
    }
}
