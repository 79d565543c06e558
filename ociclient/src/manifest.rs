//! Manifest decoding and blob extraction.
//!
//! A [`Manifest`] keeps the exact bytes it was decoded from. Those bytes are
//! what gets pushed and archived, so the digest of a manifest never changes
//! on its way through this crate.

use bytes::Bytes;
use thiserror::Error;

use crate::digest::OciDigest;
use crate::models::{
    Descriptor, ImageManifest, ManifestList, SchemaV1Manifest, Versioned, MEDIA_TYPE_MANIFEST_LIST,
    MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST, MEDIA_TYPE_SCHEMA1, MEDIA_TYPE_SCHEMA1_SIGNED,
    MEDIA_TYPE_SCHEMA2,
};

/// Accept header value enumerating every manifest type we can decode.
pub const ACCEPT_MANIFEST: &str = concat!(
    "application/vnd.docker.distribution.manifest.v2+json, ",
    "application/vnd.docker.distribution.manifest.list.v2+json, ",
    "application/vnd.oci.image.manifest.v1+json, ",
    "application/vnd.oci.image.index.v1+json, ",
    "application/vnd.docker.distribution.manifest.v1+prettyjws"
);

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("unsupported manifest media type: {0}")]
    UnsupportedMediaType(String),
    #[error("failed to decode manifest: {0}")]
    Decode(#[from] serde_json::Error),
}

/// The four manifest kinds this crate understands
#[derive(Debug, Clone, PartialEq)]
pub enum ManifestVariant {
    SchemaV1(SchemaV1Manifest),
    SchemaV2(ImageManifest),
    Oci(ImageManifest),
    List(ManifestList),
}

/// A blob a manifest depends on.
///
/// Schema1 manifests carry no size or media type for their layers.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobReference {
    pub digest: OciDigest,
    pub size: Option<u64>,
    pub media_type: Option<String>,
}

impl From<&Descriptor> for BlobReference {
    fn from(descriptor: &Descriptor) -> Self {
        Self {
            digest: descriptor.digest.clone(),
            size: Some(descriptor.size),
            media_type: Some(descriptor.media_type.clone()),
        }
    }
}

/// A decoded manifest together with its original payload
#[derive(Debug, Clone)]
pub struct Manifest {
    media_type: String,
    raw: Bytes,
    variant: ManifestVariant,
}

impl Manifest {
    /// Decode `raw` into a manifest.
    ///
    /// `declared` is the media type announced out of band (an HTTP
    /// `Content-Type`). When absent, the payload's own `mediaType` field is
    /// used instead.
    pub fn decode(declared: Option<&str>, raw: Bytes) -> Result<Self, ManifestError> {
        let versioned: Versioned = serde_json::from_slice(&raw)?;

        let declared = declared
            .map(|value| value.split(';').next().unwrap_or("").trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| versioned.media_type.clone());

        if versioned.schema_version == 1 {
            let manifest: SchemaV1Manifest = serde_json::from_slice(&raw)?;
            let media_type = match declared.as_deref() {
                Some(t @ (MEDIA_TYPE_SCHEMA1 | MEDIA_TYPE_SCHEMA1_SIGNED)) => t.to_string(),
                _ if versioned.signatures.is_some() => MEDIA_TYPE_SCHEMA1_SIGNED.to_string(),
                _ => MEDIA_TYPE_SCHEMA1.to_string(),
            };
            return Ok(Self {
                media_type,
                raw,
                variant: ManifestVariant::SchemaV1(manifest),
            });
        }

        // OCI allows omitting mediaType; fall back to the document shape
        let media_type = match declared {
            Some(media_type) => media_type,
            None if versioned.schema_version == 2 && versioned.manifests.is_some() => {
                MEDIA_TYPE_OCI_INDEX.to_string()
            }
            None if versioned.schema_version == 2 && versioned.config.is_some() => {
                MEDIA_TYPE_OCI_MANIFEST.to_string()
            }
            None => return Err(ManifestError::UnsupportedMediaType(String::new())),
        };

        let variant = match media_type.as_str() {
            MEDIA_TYPE_SCHEMA2 => ManifestVariant::SchemaV2(serde_json::from_slice(&raw)?),
            MEDIA_TYPE_OCI_MANIFEST => ManifestVariant::Oci(serde_json::from_slice(&raw)?),
            MEDIA_TYPE_MANIFEST_LIST | MEDIA_TYPE_OCI_INDEX => {
                ManifestVariant::List(serde_json::from_slice(&raw)?)
            }
            _ => return Err(ManifestError::UnsupportedMediaType(media_type)),
        };

        Ok(Self {
            media_type,
            raw,
            variant,
        })
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// The media type and exact bytes to send or store
    pub fn payload(&self) -> (&str, &Bytes) {
        (&self.media_type, &self.raw)
    }

    pub fn variant(&self) -> &ManifestVariant {
        &self.variant
    }

    /// sha256 digest of the payload
    pub fn digest(&self) -> OciDigest {
        OciDigest::sha256(&self.raw)
    }

    pub fn is_list(&self) -> bool {
        matches!(self.variant, ManifestVariant::List(_))
    }

    /// Blobs this manifest references directly, config first.
    ///
    /// Lists reference manifests rather than blobs and yield nothing here.
    pub fn blob_references(&self) -> Vec<BlobReference> {
        match &self.variant {
            ManifestVariant::SchemaV1(m) => m
                .fs_layers
                .iter()
                .map(|layer| BlobReference {
                    digest: layer.blob_sum.clone(),
                    size: None,
                    media_type: None,
                })
                .collect(),
            ManifestVariant::SchemaV2(m) | ManifestVariant::Oci(m) => std::iter::once(&m.config)
                .chain(m.layers.iter())
                .map(BlobReference::from)
                .collect(),
            ManifestVariant::List(_) => Vec::new(),
        }
    }

    /// Manifests referenced by a list; empty for every other kind
    pub fn child_manifests(&self) -> &[Descriptor] {
        match &self.variant {
            ManifestVariant::List(list) => &list.manifests,
            ManifestVariant::SchemaV1(_)
            | ManifestVariant::SchemaV2(_)
            | ManifestVariant::Oci(_) => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const LAYER: &str = "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn schema2() -> Bytes {
        Bytes::from(format!(
            r#"{{
   "schemaVersion": 2,
   "mediaType": "{MEDIA_TYPE_SCHEMA2}",
   "config": {{"mediaType": "application/vnd.docker.container.image.v1+json", "size": 7, "digest": "{CONFIG}"}},
   "layers": [{{"mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip", "size": 32, "digest": "{LAYER}"}}]
}}"#
        ))
    }

    #[test]
    fn decodes_schema2_and_keeps_bytes() {
        let raw = schema2();
        let manifest = Manifest::decode(None, raw.clone()).unwrap();
        assert!(matches!(manifest.variant(), ManifestVariant::SchemaV2(_)));
        let (media_type, payload) = manifest.payload();
        assert_eq!(media_type, MEDIA_TYPE_SCHEMA2);
        assert_eq!(payload, &raw);
        assert_eq!(manifest.digest(), OciDigest::sha256(&raw));

        let refs = manifest.blob_references();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].digest.to_string(), CONFIG);
        assert_eq!(refs[0].size, Some(7));
        assert_eq!(refs[1].digest.to_string(), LAYER);
    }

    #[test]
    fn content_type_parameters_are_ignored() {
        let declared = format!("{}; charset=utf-8", MEDIA_TYPE_SCHEMA2);
        let manifest = Manifest::decode(Some(&declared), schema2()).unwrap();
        assert_eq!(manifest.media_type(), MEDIA_TYPE_SCHEMA2);
    }

    #[test]
    fn decodes_index_without_media_type_by_shape() {
        let raw = Bytes::from(format!(
            r#"{{"schemaVersion":2,"manifests":[{{"mediaType":"{MEDIA_TYPE_OCI_MANIFEST}","digest":"{CONFIG}","size":10,"platform":{{"os":"linux","architecture":"amd64"}}}}]}}"#
        ));
        let manifest = Manifest::decode(None, raw).unwrap();
        assert!(manifest.is_list());
        assert_eq!(manifest.media_type(), MEDIA_TYPE_OCI_INDEX);
        assert!(manifest.blob_references().is_empty());
        assert_eq!(manifest.child_manifests().len(), 1);
        assert_eq!(
            manifest.child_manifests()[0].platform.as_ref().unwrap().architecture,
            "amd64"
        );
    }

    #[test]
    fn schema1_layers_have_no_size() {
        let raw = Bytes::from(format!(
            r#"{{"schemaVersion":1,"name":"app","tag":"v1","architecture":"amd64","fsLayers":[{{"blobSum":"{LAYER}"}}],"signatures":[]}}"#
        ));
        let manifest = Manifest::decode(None, raw).unwrap();
        assert_eq!(manifest.media_type(), MEDIA_TYPE_SCHEMA1_SIGNED);
        let refs = manifest.blob_references();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].size, None);
    }

    #[test]
    fn unknown_media_type_is_rejected() {
        let raw = Bytes::from_static(br#"{"schemaVersion":2,"mediaType":"application/x-custom"}"#);
        let err = Manifest::decode(None, raw).unwrap_err();
        assert!(matches!(
            err,
            ManifestError::UnsupportedMediaType(t) if t == "application/x-custom"
        ));
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        let raw = Bytes::from_static(b"{not json");
        let err = Manifest::decode(Some(MEDIA_TYPE_SCHEMA2), raw).unwrap_err();
        assert!(matches!(err, ManifestError::Decode(_)));
    }
}
