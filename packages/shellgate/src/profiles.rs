use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use shell_session::RemoteAuth;

/// How a saved profile authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Password,
    Key,
    Agent,
}

/// A saved SSH destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshProfile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub auth_method: AuthMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    /// Stored only when the user opts in to saving it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    /// Server host key fingerprint seen on the last connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl SshProfile {
    /// Authentication material for a connection attempt.
    pub fn auth(&self) -> RemoteAuth {
        match self.auth_method {
            AuthMethod::Password => {
                RemoteAuth::Password(self.password.clone().unwrap_or_default())
            }
            AuthMethod::Key => RemoteAuth::Key {
                path: PathBuf::from(self.key_path.clone().unwrap_or_default()),
                passphrase: self.passphrase.clone(),
            },
            AuthMethod::Agent => RemoteAuth::Agent,
        }
    }
}

/// File-backed SSH profile store (`profiles.json` in the data directory).
pub struct ProfileStore {
    path: PathBuf,
    cache: RwLock<Vec<SshProfile>>,
}

impl ProfileStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join("profiles.json");

        let profiles = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Vec<SshProfile>>(&content) {
                Ok(profiles) => profiles,
                Err(e) => {
                    warn!("Ignoring unreadable profile store {}: {}", path.display(), e);
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };

        info!("Loaded {} SSH profiles", profiles.len());

        Ok(Self {
            path,
            cache: RwLock::new(profiles),
        })
    }

    pub async fn list(&self) -> Vec<SshProfile> {
        self.cache.read().await.clone()
    }

    /// Replace the whole profile list.
    pub async fn save_all(&self, profiles: Vec<SshProfile>) -> Result<()> {
        let mut cache = self.cache.write().await;
        *cache = profiles;
        self.persist(&cache).await
    }

    /// Upsert a profile after a successful connection, stamping the host key
    /// fingerprint and the connection time.
    pub async fn record_connected(
        &self,
        mut profile: SshProfile,
        fingerprint: Option<String>,
    ) -> Result<()> {
        if profile.id.is_empty() {
            profile.id = uuid::Uuid::new_v4().to_string();
        }
        if fingerprint.is_some() {
            profile.fingerprint = fingerprint;
        }
        profile.last_connected = Some(chrono::Utc::now().to_rfc3339());

        let mut cache = self.cache.write().await;
        match cache.iter_mut().find(|p| p.id == profile.id) {
            Some(existing) => *existing = profile,
            None => cache.push(profile),
        }
        self.persist(&cache).await
    }

    async fn persist(&self, profiles: &[SshProfile]) -> Result<()> {
        let content = serde_json::to_string_pretty(profiles)?;
        tokio::fs::write(&self.path, content).await?;
        debug!("Persisted {} SSH profiles", profiles.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(id: &str) -> SshProfile {
        SshProfile {
            id: id.to_string(),
            name: "build box".to_string(),
            host: "build.example.com".to_string(),
            port: 22,
            username: "ci".to_string(),
            auth_method: AuthMethod::Key,
            key_path: Some("/home/ci/.ssh/id_ed25519".to_string()),
            password: None,
            passphrase: None,
            fingerprint: None,
            last_connected: None,
        }
    }

    #[tokio::test]
    async fn record_connected_inserts_and_stamps() {
        let dir = TempDir::new().unwrap();
        let store = ProfileStore::new(dir.path()).unwrap();

        store
            .record_connected(sample(""), Some("SHA256:abcdef".to_string()))
            .await
            .unwrap();

        let profiles = store.list().await;
        assert_eq!(profiles.len(), 1);
        assert!(!profiles[0].id.is_empty(), "Missing id should be minted");
        assert_eq!(profiles[0].fingerprint.as_deref(), Some("SHA256:abcdef"));
        assert!(profiles[0].last_connected.is_some());
    }

    #[tokio::test]
    async fn record_connected_updates_in_place() {
        let dir = TempDir::new().unwrap();
        let store = ProfileStore::new(dir.path()).unwrap();

        store.record_connected(sample("p1"), None).await.unwrap();
        let mut changed = sample("p1");
        changed.host = "new.example.com".to_string();
        store
            .record_connected(changed, Some("SHA256:123".to_string()))
            .await
            .unwrap();

        let profiles = store.list().await;
        assert_eq!(profiles.len(), 1, "Same id must not duplicate");
        assert_eq!(profiles[0].host, "new.example.com");
        assert_eq!(profiles[0].fingerprint.as_deref(), Some("SHA256:123"));
    }

    #[tokio::test]
    async fn profiles_survive_a_restart() {
        let dir = TempDir::new().unwrap();
        {
            let store = ProfileStore::new(dir.path()).unwrap();
            store
                .save_all(vec![sample("p1"), sample("p2")])
                .await
                .unwrap();
        }

        let reopened = ProfileStore::new(dir.path()).unwrap();
        let profiles = reopened.list().await;
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].id, "p1");
        assert_eq!(profiles[1].id, "p2");
    }

    #[tokio::test]
    async fn corrupt_store_file_is_tolerated() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("profiles.json"), "{ not json").unwrap();

        let store = ProfileStore::new(dir.path()).unwrap();
        assert!(store.list().await.is_empty());
    }

    #[test]
    fn auth_material_follows_the_method() {
        let mut profile = sample("p");
        assert!(matches!(
            profile.auth(),
            RemoteAuth::Key { path, passphrase: None } if path.ends_with("id_ed25519")
        ));

        profile.auth_method = AuthMethod::Password;
        profile.password = Some("hunter2".to_string());
        assert!(matches!(profile.auth(), RemoteAuth::Password(p) if p == "hunter2"));

        profile.auth_method = AuthMethod::Agent;
        assert!(matches!(profile.auth(), RemoteAuth::Agent));
    }

    #[test]
    fn wire_format_defaults() {
        let json = r#"{"host":"h","username":"u","auth_method":"password"}"#;
        let profile: SshProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.port, 22);
        assert_eq!(profile.id, "");
        assert!(profile.key_path.is_none());

        let out = serde_json::to_string(&profile).unwrap();
        assert!(!out.contains("key_path"), "None fields stay off the wire");
        assert!(out.contains("\"auth_method\":\"password\""));
    }
}
