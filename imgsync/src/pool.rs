use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use ociclient::{Client, ClientConfig, DEFAULT_CHUNK_SIZE};
use tracing::debug;

use crate::config::AppConfig;
use crate::error::Result;

/// Registry clients of one run, created on first use and keyed by host.
#[derive(Debug)]
pub struct ClientPool {
    config: AppConfig,
    proxy: Option<String>,
    clients: Mutex<HashMap<String, Client>>,
}

impl ClientPool {
    pub fn new(config: AppConfig, proxy: Option<String>) -> Self {
        Self {
            config,
            proxy,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn client_for(&self, host: &str) -> Result<Client> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(host) {
            return Ok(client.clone());
        }

        let endpoint = self.config.resolve(host);
        debug!(
            host,
            url = %endpoint.url,
            authenticated = endpoint.credentials.is_some(),
            "creating registry client"
        );
        let client = Client::from_config(&ClientConfig {
            registry_url: endpoint.url,
            credentials: endpoint.credentials,
            proxy: self.proxy.clone(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        })?;

        clients.insert(host.to_string(), client.clone());
        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepositoryConfig;

    #[test]
    fn reuses_clients_per_host() {
        let mut config = AppConfig::default();
        config.repositories.insert(
            "mirror.local".to_string(),
            RepositoryConfig {
                endpoint: "http://127.0.0.1:5000/".to_string(),
                ..Default::default()
            },
        );
        let pool = ClientPool::new(config, None);

        let first = pool.client_for("mirror.local").unwrap();
        let again = pool.client_for("mirror.local").unwrap();
        let hub = pool.client_for("docker.io").unwrap();

        assert_eq!(first.registry_url(), "http://127.0.0.1:5000");
        assert_eq!(again.registry_url(), first.registry_url());
        assert_eq!(hub.registry_url(), "https://registry-1.docker.io");
        assert_eq!(pool.len(), 2);
    }
}
