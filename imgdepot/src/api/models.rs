use serde::{Deserialize, Serialize};

// Distribution API wire models

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub errors: Vec<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    pub detail: Option<serde_json::Value>,
}

// Tags list response
#[derive(Debug, Serialize, Deserialize)]
pub struct TagsListResponse {
    pub name: String,
    pub tags: Vec<String>,
}

// Token endpoint query
#[derive(Debug, Deserialize)]
pub struct TokenParams {
    pub service: Option<String>,
    pub scope: Option<String>,
}

// Token endpoint response
#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
    pub expires_in: u64,
}
