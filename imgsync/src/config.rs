use std::collections::HashMap;
use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use ociclient::Credentials;
use serde::Deserialize;

use crate::error::Result;

pub const DOCKER_HUB_HOST: &str = "docker.io";
pub const DOCKER_HUB_ENDPOINT: &str = "https://registry-1.docker.io";

/// Per-registry settings, keyed by registry host
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub repositories: HashMap<String, RepositoryConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Where and how to reach one registry host
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEndpoint {
    pub url: String,
    pub credentials: Option<Credentials>,
}

impl AppConfig {
    /// Load configuration from an optional JSON file, then `IMGSYNC__*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Json).required(true));
        }

        // Hosts containing dots cannot be addressed through environment keys
        builder = builder.add_source(Environment::with_prefix("IMGSYNC").separator("__"));

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Resolve the endpoint URL and credentials for `host`.
    pub fn resolve(&self, host: &str) -> RegistryEndpoint {
        let mut url = if host == DOCKER_HUB_HOST {
            DOCKER_HUB_ENDPOINT.to_string()
        } else {
            format!("https://{}", host)
        };
        let mut credentials = None;

        let entry = self
            .repositories
            .get(host)
            .or_else(|| self.repositories.get(&host.to_ascii_lowercase()));
        if let Some(entry) = entry {
            if !entry.username.is_empty() || !entry.password.is_empty() {
                credentials = Some(Credentials::new(&entry.username, &entry.password));
            }
            if !entry.endpoint.is_empty() {
                url = entry.endpoint.trim_end_matches('/').to_string();
            }
        }

        RegistryEndpoint { url, credentials }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_entry() {
        let config = AppConfig::default();
        assert_eq!(config.resolve("docker.io").url, DOCKER_HUB_ENDPOINT);
        let quay = config.resolve("quay.io");
        assert_eq!(quay.url, "https://quay.io");
        assert_eq!(quay.credentials, None);
    }

    #[test]
    fn loads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "repositories": {
                    "registry.local:5000": {"endpoint": "http://10.0.0.5:5000/", "username": "ci", "password": "pw"},
                    "docker.io": {"username": "me", "password": "token"}
                }
            }"#,
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();

        let local = config.resolve("registry.local:5000");
        assert_eq!(local.url, "http://10.0.0.5:5000");
        assert_eq!(local.credentials, Some(Credentials::new("ci", "pw")));

        let hub = config.resolve("docker.io");
        assert_eq!(hub.url, DOCKER_HUB_ENDPOINT);
        assert_eq!(hub.credentials, Some(Credentials::new("me", "token")));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AppConfig::load(Some(&dir.path().join("absent.json"))).is_err());
    }
}
