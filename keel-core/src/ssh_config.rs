//! SSH client configuration writer.
//!
//! One `Host` block per managed target. Blocks are updated by rewriting
//! individual lines, so comments, ordering and unmanaged blocks survive.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::credential::PrivateKeyReference;
use crate::error::Result;

/// Directives that select a key. Any of these not in the entry are removed
/// from its block, so switching backends does not leave a stale identity.
const IDENTITY_KEYS: &[&str] = &["IdentityFile", "IdentityAgent"];

const INDENT: &str = "    ";

/// Desired contents of one `Host` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub name: String,
    pub host_name: String,
    pub user: String,
    pub directives: Vec<(String, String)>,
}

impl HostEntry {
    pub fn new(name: impl Into<String>, host_name: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host_name: host_name.into(),
            user: user.into(),
            directives: Vec::new(),
        }
    }

    /// Add the directives selecting `key`.
    pub fn with_key(mut self, key: &PrivateKeyReference) -> Self {
        self.directives.extend(
            key.ssh_directives()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v)),
        );
        self
    }

    fn lines(&self) -> Vec<(&str, &str)> {
        let mut lines = vec![("HostName", self.host_name.as_str()), ("User", self.user.as_str())];
        lines.extend(self.directives.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        lines
    }
}

/// Keyword of a config line, if it has one.
fn keyword(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    trimmed.split(|c: char| c.is_whitespace() || c == '=').next()
}

fn starts_block(line: &str) -> bool {
    matches!(keyword(line), Some(k) if k.eq_ignore_ascii_case("host") || k.eq_ignore_ascii_case("match"))
}

fn is_host_line(line: &str, name: &str) -> bool {
    match keyword(line) {
        Some(k) if k.eq_ignore_ascii_case("host") => line
            .trim_start()[k.len()..]
            .split(|c: char| c.is_whitespace() || c == '=')
            .any(|pattern| pattern == name),
        _ => false,
    }
}

/// Return `contents` with the block for `entry.name` created or updated.
pub fn upsert_host(contents: &str, entry: &HostEntry) -> String {
    let mut lines: Vec<String> = contents.lines().map(str::to_string).collect();
    let wanted = entry.lines();

    let Some(start) = lines.iter().position(|l| is_host_line(l, &entry.name)) else {
        let mut out = contents.to_string();
        if !out.is_empty() {
            if !out.ends_with('\n') {
                out.push('\n');
            }
            if !out.ends_with("\n\n") {
                out.push('\n');
            }
        }
        out.push_str(&format!("Host {}\n", entry.name));
        for (key, value) in &wanted {
            out.push_str(&format!("{}{} {}\n", INDENT, key, value));
        }
        return out;
    };

    let end = lines[start + 1..]
        .iter()
        .position(|l| starts_block(l))
        .map(|offset| start + 1 + offset)
        .unwrap_or(lines.len());

    let indent = lines[start + 1..end]
        .iter()
        .find(|l| keyword(l).is_some())
        .map(|l| l[..l.len() - l.trim_start().len()].to_string())
        .unwrap_or_else(|| INDENT.to_string());

    let mut block: Vec<String> = Vec::new();
    let mut written: Vec<&str> = Vec::new();
    for line in &lines[start + 1..end] {
        let Some(key) = keyword(line) else {
            block.push(line.clone());
            continue;
        };
        if let Some((k, v)) = wanted.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
            if !written.contains(k) {
                block.push(format!("{}{} {}", indent, k, v));
                written.push(*k);
            }
        } else if !IDENTITY_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key)) {
            block.push(line.clone());
        }
    }

    let insert_at = block
        .iter()
        .rposition(|l| !l.trim().is_empty())
        .map(|i| i + 1)
        .unwrap_or(0);
    let missing: Vec<String> = wanted
        .iter()
        .filter(|(k, _)| !written.contains(k))
        .map(|(k, v)| format!("{}{} {}", indent, k, v))
        .collect();
    block.splice(insert_at..insert_at, missing);

    lines.splice(start + 1..end, block);
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// An SSH client configuration file on disk.
#[derive(Debug, Clone)]
pub struct SshConfigFile {
    path: PathBuf,
}

impl SshConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create or update the block for `entry`. Returns whether the file changed.
    pub async fn apply(&self, entry: &HostEntry) -> Result<bool> {
        let current = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let updated = upsert_host(&current, entry);
        if updated == current {
            debug!("{} already up to date for {}", self.path.display(), entry.name);
            return Ok(false);
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Mode only applies when the file is created.
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&self.path)
            .await?;
        file.write_all(updated.as_bytes()).await?;
        file.flush().await?;

        info!("Updated host {} in {}", entry.name, self.path.display());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn entry(ip: &str) -> HostEntry {
        HostEntry::new("demo", ip, "root").with_key(&PrivateKeyReference::File {
            path: PathBuf::from("/home/u/.ssh/keel_demo"),
        })
    }

    const EXISTING: &str = "\
# personal hosts
Host github.com
    User git

Host demo
    HostName 10.0.0.1
    # pinned
    User admin
    IdentityFile ~/.ssh/old

Host *
    ServerAliveInterval 30
";

    #[test]
    fn test_appends_missing_host() {
        let out = upsert_host("Host other\n    User x\n", &entry("1.2.3.4"));
        assert_eq!(
            out,
            "Host other\n    User x\n\nHost demo\n    HostName 1.2.3.4\n    User root\n    \
             IdentityFile /home/u/.ssh/keel_demo\n    IdentitiesOnly yes\n"
        );
    }

    #[test]
    fn test_rewrites_only_target_block() {
        let out = upsert_host(EXISTING, &entry("5.6.7.8"));
        let expected = "\
# personal hosts
Host github.com
    User git

Host demo
    HostName 5.6.7.8
    # pinned
    User root
    IdentityFile /home/u/.ssh/keel_demo
    IdentitiesOnly yes

Host *
    ServerAliveInterval 30
";
        assert_eq!(out, expected);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let once = upsert_host(EXISTING, &entry("5.6.7.8"));
        assert_eq!(upsert_host(&once, &entry("5.6.7.8")), once);
    }

    #[test]
    fn test_switching_to_agent_drops_identity_file() {
        let agent = HostEntry::new("demo", "5.6.7.8", "root").with_key(&PrivateKeyReference::Agent {
            locator: "op://keel/demo-ssh/private key".to_string(),
            socket: PathBuf::from("/home/u/.1password/agent.sock"),
        });
        let out = upsert_host(EXISTING, &agent);
        assert!(out.contains("    IdentityAgent /home/u/.1password/agent.sock\n"));
        assert!(!out.contains("IdentityFile"));
        assert!(out.contains("Host github.com\n    User git\n"));
    }

    #[test]
    fn test_host_pattern_lists_match() {
        let out = upsert_host("Host demo demo.example.com\n    HostName 1.1.1.1\n", &entry("2.2.2.2"));
        assert!(out.starts_with("Host demo demo.example.com\n    HostName 2.2.2.2\n"));
        assert_eq!(out.matches("Host ").count(), 1);
    }

    #[tokio::test]
    async fn test_apply_creates_owner_only_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = SshConfigFile::new(dir.path().join("ssh").join("config"));

        assert!(file.apply(&entry("1.2.3.4")).await.unwrap());
        assert!(!file.apply(&entry("1.2.3.4")).await.unwrap());

        let mode = std::fs::metadata(file.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let contents = std::fs::read_to_string(file.path()).unwrap();
        assert!(contents.starts_with("Host demo\n"));
    }
}
