//! Writer and reader for an OCI image layout directory
//! (`oci-layout`, `index.json`, `blobs/sha256/*`).

use super::oci_err;
use crate::rootfs::LayerBlob;
use crate::runtime::constants::labels;
use botstrap_shared::errors::{BotstrapError, BotstrapResult};
use chrono::{DateTime, SecondsFormat, Utc};
use oci_spec::image::{
    Arch, ConfigBuilder, Descriptor, DescriptorBuilder, Digest, HistoryBuilder, ImageConfiguration,
    ImageConfigurationBuilder, ImageIndex, ImageIndexBuilder, ImageManifest, ImageManifestBuilder,
    MediaType, Os, RootFsBuilder, SCHEMA_VERSION,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest as _, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;

const OCI_LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
const IMAGE_LAYOUT_VERSION: &str = "1.0.0";

/// Target platform recorded in the image config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

impl Default for Platform {
    fn default() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        Self {
            architecture: architecture.to_string(),
            os: "linux".to_string(),
        }
    }
}

/// Runtime config accumulated by the stages before publishing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageConfigDraft {
    pub user: Option<String>,
    pub env: Vec<String>,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub working_dir: Option<String>,
    pub labels: BTreeMap<String, String>,
}

/// A layer plus the history line describing where it came from.
#[derive(Debug, Clone)]
pub struct LayerRecord {
    pub blob: LayerBlob,
    pub created_by: String,
}

/// Digests of a published image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedImage {
    pub manifest_digest: String,
    pub config_digest: String,
    pub layers: usize,
}

/// An OCI image layout directory.
#[derive(Debug, Clone)]
pub struct OciLayout {
    root: PathBuf,
}

fn parse_digest(value: &str) -> BotstrapResult<Digest> {
    Digest::from_str(value).map_err(oci_err)
}

fn timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl OciLayout {
    /// Create the directory skeleton.
    pub fn create(root: &Path) -> BotstrapResult<Self> {
        let layout = Self::open(root);
        std::fs::create_dir_all(layout.blobs_dir())?;
        let marker = serde_json::json!({ "imageLayoutVersion": IMAGE_LAYOUT_VERSION });
        std::fs::write(root.join(OCI_LAYOUT_FILE), marker.to_string())?;
        Ok(layout)
    }

    pub fn open(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    pub fn blob_path(&self, digest: &str) -> BotstrapResult<PathBuf> {
        let hex = digest.strip_prefix("sha256:").ok_or_else(|| {
            BotstrapError::Image(format!("unsupported digest algorithm: {}", digest))
        })?;
        Ok(self.blobs_dir().join(hex))
    }

    /// Store a JSON document as a blob, returning its digest and size.
    fn write_json_blob<T: Serialize>(&self, value: &T) -> BotstrapResult<(String, u64)> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| BotstrapError::Image(format!("Failed to serialize blob: {}", e)))?;
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&bytes)));
        std::fs::write(self.blob_path(&digest)?, &bytes)?;
        Ok((digest, bytes.len() as u64))
    }

    fn descriptor(
        media_type: MediaType,
        digest: &str,
        size: u64,
        annotations: Option<HashMap<String, String>>,
    ) -> BotstrapResult<Descriptor> {
        let mut builder = DescriptorBuilder::default()
            .media_type(media_type)
            .digest(parse_digest(digest)?)
            .size(size);
        if let Some(annotations) = annotations {
            builder = builder.annotations(annotations);
        }
        builder.build().map_err(oci_err)
    }

    /// Write config, manifest and index for `layers` (already in the blob store).
    pub fn publish(
        &self,
        platform: &Platform,
        draft: &ImageConfigDraft,
        layers: &[LayerRecord],
        ref_name: &str,
        created: DateTime<Utc>,
    ) -> BotstrapResult<PublishedImage> {
        let created = timestamp(created);

        let mut config = ConfigBuilder::default()
            .env(draft.env.clone())
            .entrypoint(draft.entrypoint.clone())
            .cmd(draft.cmd.clone())
            .labels(
                draft
                    .labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<HashMap<_, _>>(),
            );
        if let Some(user) = &draft.user {
            config = config.user(user.clone());
        }
        if let Some(dir) = &draft.working_dir {
            config = config.working_dir(dir.clone());
        }
        let config = config.build().map_err(oci_err)?;

        let rootfs = RootFsBuilder::default()
            .typ("layers")
            .diff_ids(
                layers
                    .iter()
                    .map(|layer| layer.blob.diff_id.clone())
                    .collect::<Vec<_>>(),
            )
            .build()
            .map_err(oci_err)?;

        let history = layers
            .iter()
            .map(|layer| {
                HistoryBuilder::default()
                    .created(created.clone())
                    .created_by(layer.created_by.clone())
                    .empty_layer(false)
                    .build()
                    .map_err(oci_err)
            })
            .collect::<BotstrapResult<Vec<_>>>()?;

        let image_config = ImageConfigurationBuilder::default()
            .created(created.clone())
            .architecture(Arch::from(platform.architecture.as_str()))
            .os(Os::from(platform.os.as_str()))
            .config(config)
            .rootfs(rootfs)
            .history(history)
            .build()
            .map_err(oci_err)?;

        let (config_digest, config_size) = self.write_json_blob(&image_config)?;
        let config_descriptor =
            Self::descriptor(MediaType::ImageConfig, &config_digest, config_size, None)?;

        let layer_descriptors = layers
            .iter()
            .map(|layer| {
                Self::descriptor(
                    MediaType::ImageLayerGzip,
                    &layer.blob.digest,
                    layer.blob.size,
                    None,
                )
            })
            .collect::<BotstrapResult<Vec<_>>>()?;

        let manifest = ImageManifestBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .media_type(MediaType::ImageManifest)
            .config(config_descriptor)
            .layers(layer_descriptors)
            .annotations(HashMap::from([(labels::CREATED.to_string(), created.clone())]))
            .build()
            .map_err(oci_err)?;
        let (manifest_digest, manifest_size) = self.write_json_blob(&manifest)?;

        let manifest_descriptor = Self::descriptor(
            MediaType::ImageManifest,
            &manifest_digest,
            manifest_size,
            Some(HashMap::from([(labels::REF_NAME.to_string(), ref_name.to_string())])),
        )?;
        let index = ImageIndexBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .media_type(MediaType::ImageIndex)
            .manifests(vec![manifest_descriptor])
            .build()
            .map_err(oci_err)?;
        let index_bytes = serde_json::to_vec_pretty(&index)
            .map_err(|e| BotstrapError::Image(format!("Failed to serialize index: {}", e)))?;
        std::fs::write(self.root.join(INDEX_FILE), index_bytes)?;

        tracing::info!(
            manifest = %manifest_digest,
            config = %config_digest,
            layers = layers.len(),
            reference = %ref_name,
            "Image layout written"
        );

        Ok(PublishedImage {
            manifest_digest,
            config_digest,
            layers: layers.len(),
        })
    }

    fn read_json<T: DeserializeOwned>(path: &Path) -> BotstrapResult<T> {
        let bytes = std::fs::read(path).map_err(|e| {
            BotstrapError::Image(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| BotstrapError::Image(format!("Invalid {}: {}", path.display(), e)))
    }

    pub fn read_index(&self) -> BotstrapResult<ImageIndex> {
        Self::read_json(&self.root.join(INDEX_FILE))
    }

    /// The single manifest referenced by the index.
    pub fn read_manifest(&self) -> BotstrapResult<ImageManifest> {
        let index = self.read_index()?;
        let descriptor = index
            .manifests()
            .first()
            .ok_or_else(|| BotstrapError::Image("index has no manifests".into()))?;
        Self::read_json(&self.blob_path(&descriptor.digest().to_string())?)
    }

    pub fn read_config(&self) -> BotstrapResult<ImageConfiguration> {
        let manifest = self.read_manifest()?;
        Self::read_json(&self.blob_path(&manifest.config().digest().to_string())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rootfs::{ChangeSet, Rootfs, write_layer};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_publish_and_read_back() {
        let out = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let layout = OciLayout::create(out.path()).unwrap();

        let mut rootfs = Rootfs::open(root.path());
        rootfs.write_file("/app/main.py", b"print('hi')\n", 0o644).unwrap();
        let blob = write_layer(root.path(), &rootfs.take_changes(), &layout.blobs_dir()).unwrap();
        let empty = write_layer(root.path(), &ChangeSet::default(), &layout.blobs_dir()).unwrap();

        let draft = ImageConfigDraft {
            user: Some("botuser".into()),
            env: vec!["TZ=UTC".into()],
            entrypoint: vec!["python3".into(), "main.py".into()],
            working_dir: Some("/app".into()),
            labels: BTreeMap::from([("org.botstrap.secrets".to_string(), "TELEGRAM_TOKEN".to_string())]),
            ..Default::default()
        };
        let layers = vec![
            LayerRecord { blob: blob.clone(), created_by: "payload".into() },
            LayerRecord { blob: empty, created_by: "environment".into() },
        ];
        let published = layout
            .publish(&Platform::default(), &draft, &layers, "bot:latest", Utc::now())
            .unwrap();
        assert_eq!(published.layers, 2);

        let manifest = layout.read_manifest().unwrap();
        assert_eq!(manifest.layers().len(), 2);
        assert_eq!(manifest.layers()[0].digest().to_string(), blob.digest);

        let config = layout.read_config().unwrap();
        assert_eq!(config.rootfs().diff_ids()[0], blob.diff_id);
        let runtime = config.config().as_ref().unwrap();
        assert_eq!(runtime.user().as_deref(), Some("botuser"));
        assert_eq!(runtime.working_dir().as_deref(), Some("/app"));
        assert_eq!(
            runtime.entrypoint().as_ref().unwrap(),
            &vec!["python3".to_string(), "main.py".to_string()]
        );

        let marker = std::fs::read_to_string(out.path().join("oci-layout")).unwrap();
        assert!(marker.contains("1.0.0"));
    }

    #[test]
    fn test_blob_path_rejects_other_algorithms() {
        let layout = OciLayout::open(Path::new("/tmp/x"));
        assert!(layout.blob_path("sha512:abc").is_err());
    }
}
