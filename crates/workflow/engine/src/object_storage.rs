//! Object storage collaborators
//!
//! - [`StorageService`]: existence checks and listings in a bucket
//! - [`CredentialIssuer`]: scoped access secrets for a storage location
//! - [`DicomMetadataSource`]: DICOM tag values and patient details of a payload
//!
//! [`InMemoryObjectStorage`] implements all three for tests and local runs.
//! A path "exists" when an object is stored under exactly that key or when
//! it is a directory prefix of at least one stored object.

use crate::store::{StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use workflow_dsl::DicomTag;
use workflow_types::{ArtifactPaths, Credentials, PatientDetails, PayloadId, StorageInfo};

/// Existence checks and listings
#[async_trait]
pub trait StorageService: Send + Sync {
    /// The subset of `artifacts` whose paths exist in `bucket`
    async fn verify_objects_exist(
        &self,
        bucket: &str,
        artifacts: &ArtifactPaths,
    ) -> StoreResult<ArtifactPaths>;

    async fn verify_object_exists(&self, bucket: &str, path: &str) -> StoreResult<bool>;

    /// Every object key under `prefix`
    async fn list_objects(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<String>>;
}

/// Issues scoped credentials for a storage location
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue_access_secret(&self, storage: &StorageInfo) -> StoreResult<Credentials>;
}

/// DICOM metadata of a payload
#[async_trait]
pub trait DicomMetadataSource: Send + Sync {
    /// Value of `tag` in each DICOM JSON file of the payload, in file order;
    /// files without the tag contribute an empty string
    async fn tag_values(
        &self,
        bucket: &str,
        payload_id: &PayloadId,
        tag: &DicomTag,
    ) -> StoreResult<Vec<String>>;

    async fn patient_details(
        &self,
        bucket: &str,
        payload_id: &PayloadId,
    ) -> StoreResult<PatientDetails>;
}

// ── In-memory implementation ─────────────────────────────────────────

type DicomFiles = Vec<BTreeMap<String, String>>;

/// In-memory object storage for development and testing
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStorage {
    objects: Arc<RwLock<HashMap<String, BTreeSet<String>>>>,
    dicom: Arc<RwLock<HashMap<(String, PayloadId), DicomFiles>>>,
    patients: Arc<RwLock<HashMap<(String, PayloadId), PatientDetails>>>,
    /// Treat every path as present
    assume_present: bool,
    unavailable: Arc<AtomicBool>,
    credentials_issued: Arc<AtomicU64>,
}

impl InMemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage in which every existence check succeeds
    pub fn assume_present() -> Self {
        Self {
            assume_present: true,
            ..Self::default()
        }
    }

    pub async fn put_object(&self, bucket: &str, path: &str) {
        self.objects
            .write()
            .await
            .entry(bucket.to_string())
            .or_default()
            .insert(path.trim_start_matches('/').to_string());
    }

    /// Add one DICOM JSON file's tag values (key `ggggeeee` → value)
    pub async fn put_dicom_json(
        &self,
        bucket: &str,
        payload_id: &PayloadId,
        tags: BTreeMap<String, String>,
    ) {
        let tags = tags
            .into_iter()
            .map(|(k, v)| (k.to_ascii_uppercase(), v))
            .collect();
        self.dicom
            .write()
            .await
            .entry((bucket.to_string(), payload_id.clone()))
            .or_default()
            .push(tags);
    }

    pub async fn set_patient_details(
        &self,
        bucket: &str,
        payload_id: &PayloadId,
        details: PatientDetails,
    ) {
        self.patients
            .write()
            .await
            .insert((bucket.to_string(), payload_id.clone()), details);
    }

    /// Make every call fail with a connection error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of credentials issued so far
    pub fn credentials_issued(&self) -> u64 {
        self.credentials_issued.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("object storage unavailable".into()));
        }
        Ok(())
    }

    async fn exists(&self, bucket: &str, path: &str) -> bool {
        if self.assume_present {
            return true;
        }
        let path = path.trim_start_matches('/');
        let directory = format!("{}/", path.trim_end_matches('/'));
        let objects = self.objects.read().await;
        objects.get(bucket).is_some_and(|keys| {
            keys.contains(path) || keys.iter().any(|k| k.starts_with(&directory))
        })
    }
}

#[async_trait]
impl StorageService for InMemoryObjectStorage {
    async fn verify_objects_exist(
        &self,
        bucket: &str,
        artifacts: &ArtifactPaths,
    ) -> StoreResult<ArtifactPaths> {
        self.check_available()?;
        let mut verified = ArtifactPaths::new();
        for (name, path) in artifacts {
            if self.exists(bucket, path).await {
                verified.insert(name.clone(), path.clone());
            }
        }
        Ok(verified)
    }

    async fn verify_object_exists(&self, bucket: &str, path: &str) -> StoreResult<bool> {
        self.check_available()?;
        Ok(self.exists(bucket, path).await)
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<String>> {
        self.check_available()?;
        let prefix = prefix.trim_start_matches('/');
        let objects = self.objects.read().await;
        Ok(objects
            .get(bucket)
            .map(|keys| {
                keys.iter()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl CredentialIssuer for InMemoryObjectStorage {
    async fn issue_access_secret(&self, storage: &StorageInfo) -> StoreResult<Credentials> {
        self.check_available()?;
        let n = self.credentials_issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Credentials {
            access_key: format!("key-{}-{}", storage.bucket, n),
            access_token: uuid::Uuid::new_v4().to_string(),
            session_token: None,
        })
    }
}

#[async_trait]
impl DicomMetadataSource for InMemoryObjectStorage {
    async fn tag_values(
        &self,
        bucket: &str,
        payload_id: &PayloadId,
        tag: &DicomTag,
    ) -> StoreResult<Vec<String>> {
        self.check_available()?;
        let key = tag.key();
        let dicom = self.dicom.read().await;
        Ok(dicom
            .get(&(bucket.to_string(), payload_id.clone()))
            .map(|files| {
                files
                    .iter()
                    .map(|f| f.get(&key).cloned().unwrap_or_default())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn patient_details(
        &self,
        bucket: &str,
        payload_id: &PayloadId,
    ) -> StoreResult<PatientDetails> {
        self.check_available()?;
        let patients = self.patients.read().await;
        Ok(patients
            .get(&(bucket.to_string(), payload_id.clone()))
            .cloned()
            .unwrap_or_default())
    }
}
