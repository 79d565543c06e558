use bytes::Bytes;
use imgdepot::digest::sha256_digest;
use imgdepot::{AuthPolicy, TestRegistry};

#[tokio::test]
async fn test_api_version_check() {
    let registry = TestRegistry::start().await.unwrap();

    let response = reqwest::get(format!("{}/v2/", registry.url())).await.unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(registry.count("GET", "/v2/"), 1);
}

#[tokio::test]
async fn test_monolithic_upload_then_fetch() {
    let registry = TestRegistry::start().await.unwrap();
    let client = reqwest::Client::new();
    let content = Bytes::from_static(b"layer content");
    let digest = sha256_digest(&content);

    let response = client
        .post(format!("{}/v2/team/app/blobs/uploads/", registry.url()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 202);
    let location = response.headers()["location"].to_str().unwrap().to_string();
    assert!(location.starts_with("/v2/team/app/blobs/uploads/"));

    let response = client
        .put(format!("{}{}?digest={}", registry.url(), location, digest))
        .body(content.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 201);

    let fetched = client
        .get(format!("{}/v2/team/app/blobs/{}", registry.url(), digest))
        .send()
        .await
        .unwrap();
    assert_eq!(fetched.status().as_u16(), 200);
    assert_eq!(fetched.bytes().await.unwrap(), content);
    assert_eq!(registry.storage().open_uploads(), 0);
}

#[tokio::test]
async fn test_bearer_challenge_and_token() {
    let registry = TestRegistry::start_with(AuthPolicy::Bearer {
        username: "ci".to_string(),
        password: "secret".to_string(),
    })
    .await
    .unwrap();
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/v2/app/manifests/latest", registry.url()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
    let challenge = response.headers()["www-authenticate"].to_str().unwrap();
    assert!(challenge.starts_with("Bearer realm="));
    assert!(challenge.contains(r#"scope="repository:app:pull,push""#));

    let denied = client
        .get(format!("{}/token", registry.url()))
        .basic_auth("ci", Some("wrong"))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status().as_u16(), 401);

    let token: serde_json::Value = client
        .get(format!("{}/token?scope=repository:app:pull", registry.url()))
        .basic_auth("ci", Some("secret"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let token = token["token"].as_str().unwrap();

    let response = client
        .get(format!("{}/v2/app/manifests/latest", registry.url()))
        .bearer_auth(token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
    assert_eq!(registry.state().token_scopes(), vec!["repository:app:pull".to_string()]);
}
