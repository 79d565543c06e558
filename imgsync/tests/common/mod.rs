#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use imgdepot::TestRegistry;
use imgsync::{AppConfig, RepositoryConfig};
use ociclient::models::{MEDIA_TYPE_MANIFEST_LIST, MEDIA_TYPE_SCHEMA2};
use ociclient::{Client, Manifest, OciDigest};
use tokio_util::sync::CancellationToken;

pub const CONFIG_TYPE: &str = "application/vnd.docker.container.image.v1+json";
pub const LAYER_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Blob content with its digest
#[derive(Debug, Clone)]
pub struct Blob {
    pub digest: OciDigest,
    pub content: Vec<u8>,
}

impl Blob {
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        let content = content.into();
        Self {
            digest: OciDigest::sha256(&content),
            content,
        }
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }
}

/// sha512 digest of `data`
pub fn sha512_of(data: &[u8]) -> OciDigest {
    let mut verifier = OciDigest::new("sha512", &"0".repeat(128)).unwrap().verifier();
    verifier.update(data);
    verifier.finish()
}

pub fn schema2_json(config: &Blob, layers: &[&Blob]) -> String {
    let layers: Vec<String> = layers
        .iter()
        .map(|layer| {
            format!(
                r#"{{"mediaType":"{LAYER_TYPE}","size":{},"digest":"{}"}}"#,
                layer.size(),
                layer.digest
            )
        })
        .collect();
    format!(
        r#"{{"schemaVersion":2,"mediaType":"{MEDIA_TYPE_SCHEMA2}","config":{{"mediaType":"{CONFIG_TYPE}","size":{},"digest":"{}"}},"layers":[{}]}}"#,
        config.size(),
        config.digest,
        layers.join(",")
    )
}

pub fn list_json(children: &[(&str, &str)]) -> String {
    let entries: Vec<String> = children
        .iter()
        .map(|(payload, arch)| {
            format!(
                r#"{{"mediaType":"{MEDIA_TYPE_SCHEMA2}","size":{},"digest":"{}","platform":{{"architecture":"{arch}","os":"linux"}}}}"#,
                payload.len(),
                OciDigest::sha256(payload.as_bytes())
            )
        })
        .collect();
    format!(
        r#"{{"schemaVersion":2,"mediaType":"{MEDIA_TYPE_MANIFEST_LIST}","manifests":[{}]}}"#,
        entries.join(",")
    )
}

pub fn manifest(json: &str) -> Manifest {
    Manifest::decode(None, Bytes::from(json.to_string())).unwrap()
}

/// Builds tar archives entry by entry, with arbitrary paths
pub struct TarBuilder {
    builder: tar::Builder<Vec<u8>>,
}

impl TarBuilder {
    pub fn new() -> Self {
        Self {
            builder: tar::Builder::new(Vec::new()),
        }
    }

    pub fn entry(mut self, path: &str, content: &[u8]) -> Self {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        self.builder.append_data(&mut header, path, content).unwrap();
        self
    }

    pub fn blob(self, blob: &Blob) -> Self {
        let path = format!("blob/{}", blob.digest);
        self.entry(&path, &blob.content)
    }

    pub fn write(self, dir: &Path) -> PathBuf {
        let path = dir.join("images.tar");
        std::fs::write(&path, self.builder.into_inner().unwrap()).unwrap();
        path
    }

    /// Like [`write`](Self::write), but the end-of-archive blocks are
    /// replaced by a header block that fails to parse.
    pub fn write_corrupt(self, dir: &Path) -> PathBuf {
        let path = dir.join("images.tar");
        let mut bytes = self.builder.into_inner().unwrap();
        bytes.truncate(bytes.len() - 1024);
        bytes.extend_from_slice(&[b'A'; 512]);
        std::fs::write(&path, bytes).unwrap();
        path
    }
}

/// Every entry of a tar file, in order
pub fn read_archive(path: &Path) -> Vec<(String, Vec<u8>)> {
    let mut archive = tar::Archive::new(std::fs::File::open(path).unwrap());
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut content = Vec::new();
            std::io::Read::read_to_end(&mut entry, &mut content).unwrap();
            (name, content)
        })
        .collect()
}

pub fn archive_map(path: &Path) -> HashMap<String, Vec<u8>> {
    read_archive(path).into_iter().collect()
}

/// Configuration pointing the registry's host at its plain-HTTP URL
pub fn config_for(registry: &TestRegistry) -> AppConfig {
    let mut config = AppConfig::default();
    config.repositories.insert(
        registry.host(),
        RepositoryConfig {
            endpoint: registry.url(),
            ..Default::default()
        },
    );
    config
}

/// Push blobs and a manifest straight to a registry
pub async fn seed(client: &Client, repository: &str, reference: &str, blobs: &[&Blob], json: &str) {
    let cancel = CancellationToken::new();
    for blob in blobs {
        client
            .upload_blob(
                repository,
                &blob.digest,
                Cursor::new(blob.content.clone()),
                Some(blob.size() as u64),
                &cancel,
            )
            .await
            .unwrap();
    }
    client.put_manifest(repository, reference, &manifest(json)).await.unwrap();
}
