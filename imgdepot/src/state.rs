use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use crate::storage::Storage;

/// How the registry authenticates clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthPolicy {
    Anonymous,
    /// Plain `Authorization: Basic` on every request
    Basic { username: String, password: String },
    /// Bearer challenge; tokens are issued by `/token` against these credentials
    Bearer { username: String, password: String },
}

/// One request seen by the registry, recorded after it was answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub status: u16,
}

#[derive(Debug)]
pub struct RegistryState {
    pub storage: Storage,
    pub auth: AuthPolicy,
    pub realm: String,
    pub token: String,
    requests: Mutex<Vec<RecordedRequest>>,
    token_scopes: Mutex<Vec<String>>,
    failing_uploads: Mutex<HashSet<String>>,
}

impl RegistryState {
    pub fn new(auth: AuthPolicy, realm: String) -> Self {
        Self {
            storage: Storage::new(),
            auth,
            realm,
            token: uuid::Uuid::new_v4().simple().to_string(),
            requests: Mutex::new(Vec::new()),
            token_scopes: Mutex::new(Vec::new()),
            failing_uploads: Mutex::new(HashSet::new()),
        }
    }

    pub fn record(&self, request: RecordedRequest) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn record_scope(&self, scope: String) {
        self.token_scopes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(scope);
    }

    pub fn token_scopes(&self) -> Vec<String> {
        self.token_scopes.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Make the closing PUT of any upload of `digest` fail with a 500.
    pub fn fail_uploads_of(&self, digest: &str) {
        self.failing_uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(digest.to_string());
    }

    pub fn upload_fails(&self, digest: &str) -> bool {
        self.failing_uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(digest)
    }
}
