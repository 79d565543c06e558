use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::{debug, info};

use super::models::{TokenParams, TokenResponse};
use super::routes::{parse_path, AppState, Endpoint};
use crate::error::{AppError, Result};
use crate::state::AuthPolicy;

const SERVICE: &str = "imgdepot";

// Authentication middleware for the /v2 tree
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match &state.auth {
        AuthPolicy::Anonymous => next.run(request).await,
        AuthPolicy::Basic { username, password } => {
            if basic_matches(authorization.as_deref(), username, password) {
                next.run(request).await
            } else {
                debug!("rejecting request without valid basic credentials");
                challenge(format!(r#"Basic realm="{}""#, SERVICE))
            }
        }
        AuthPolicy::Bearer { .. } => {
            let presented = authorization.as_deref().and_then(|v| v.strip_prefix("Bearer "));
            if presented == Some(state.token.as_str()) {
                return next.run(request).await;
            }

            let mut value = format!(r#"Bearer realm="{}",service="{}""#, state.realm, SERVICE);
            if let Some(repository) =
                parse_path(request.uri().path()).and_then(|e| e.repository())
            {
                value.push_str(&format!(r#",scope="repository:{}:pull,push""#, repository));
            }
            challenge(value)
        }
    }
}

fn challenge(value: String) -> Response {
    (StatusCode::UNAUTHORIZED, [(header::WWW_AUTHENTICATE, value)]).into_response()
}

fn basic_matches(authorization: Option<&str>, username: &str, password: &str) -> bool {
    let Some(encoded) = authorization.and_then(|v| v.strip_prefix("Basic ")) else {
        return false;
    };
    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    String::from_utf8(decoded)
        .map(|credentials| credentials == format!("{}:{}", username, password))
        .unwrap_or(false)
}

// Token endpoint handler
pub async fn token_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<TokenParams>,
) -> Result<Json<TokenResponse>> {
    let AuthPolicy::Bearer { username, password } = &state.auth else {
        return Err(AppError::BadRequest("token service disabled".to_string()));
    };

    let authorization = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    if !basic_matches(authorization, username, password) {
        return Err(AppError::Unauthorized("invalid credentials".to_string()));
    }

    info!(service = ?params.service, scope = ?params.scope, "issuing token");
    if let Some(scope) = params.scope {
        state.record_scope(scope);
    }

    Ok(Json(TokenResponse {
        token: state.token.clone(),
        expires_in: 3600,
    }))
}

impl<'a> Endpoint<'a> {
    pub fn repository(&self) -> Option<&'a str> {
        match self {
            Endpoint::Version => None,
            Endpoint::Tags(name)
            | Endpoint::Manifest(name, _)
            | Endpoint::Blob(name, _)
            | Endpoint::Upload(name, _) => Some(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_scope_names_the_repository() {
        fn scope(path: &str) -> Option<&str> {
            parse_path(path).and_then(|e| e.repository())
        }
        assert_eq!(scope("/v2/team/app/blobs/uploads/"), Some("team/app"));
        assert_eq!(scope("/v2/library/nginx/manifests/latest"), Some("library/nginx"));
        assert_eq!(scope("/v2/"), None);
    }

    #[test]
    fn basic_credentials_must_match() {
        let header = format!("Basic {}", STANDARD.encode("ci:secret"));
        assert!(basic_matches(Some(&header), "ci", "secret"));
        assert!(!basic_matches(Some(&header), "ci", "other"));
        assert!(!basic_matches(Some("Bearer abc"), "ci", "secret"));
        assert!(!basic_matches(None, "ci", "secret"));
    }
}
