//! In-memory Distribution API registry.
//!
//! [`TestRegistry`] binds an ephemeral local port, serves the registry API
//! from memory and records every request it answers, so callers can assert
//! on exactly what a client sent.

pub mod api;
pub mod digest;
pub mod error;
pub mod state;
pub mod storage;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::error;

pub use state::{AuthPolicy, RecordedRequest, RegistryState};
pub use storage::{Storage, StoredManifest};

/// A registry served from memory on `127.0.0.1`
pub struct TestRegistry {
    addr: SocketAddr,
    state: Arc<RegistryState>,
    server: JoinHandle<()>,
}

impl TestRegistry {
    pub async fn start() -> std::io::Result<Self> {
        Self::start_with(AuthPolicy::Anonymous).await
    }

    pub async fn start_with(auth: AuthPolicy) -> std::io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(RegistryState::new(auth, format!("http://{}/token", addr)));
        let app = api::routes::registry_router(Arc::clone(&state));

        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("registry server stopped: {}", e);
            }
        });

        Ok(Self { addr, state, server })
    }

    /// Base URL, e.g. `http://127.0.0.1:40123`
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// `host:port`, usable as the first segment of an image reference
    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    pub fn storage(&self) -> &Storage {
        &self.state.storage
    }

    pub fn state(&self) -> &Arc<RegistryState> {
        &self.state
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests()
    }

    pub fn clear_requests(&self) {
        self.state.clear_requests()
    }

    /// Number of answered, authenticated requests with this method whose
    /// path contains `fragment`.
    pub fn count(&self, method: &str, fragment: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.status != 401 && r.method == method && r.path.contains(fragment))
            .count()
    }
}

impl Drop for TestRegistry {
    fn drop(&mut self) {
        self.server.abort();
    }
}
