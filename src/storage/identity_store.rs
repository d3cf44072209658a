use crate::common::{FaceGateError, Result};
use crate::core::normalizer::Sample;
use crate::storage::atomic::write_atomic;
use chrono::{DateTime, Utc};
use image::ImageOutputFormat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

const STORAGE_VERSION: u32 = 1;
const METADATA_FILE: &str = "identities.bin";
const MODEL_FILE: &str = "face_model.bin";
const SAMPLES_DIR: &str = "users";

pub type IdentityId = u32;

/// How `create_identity` picks the next id.
///
/// Only `MaxPlusOne` guarantees that the id of a deleted identity is never
/// handed out again. `CountPlusOne` can reuse one once its sample directory
/// is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdPolicy {
    #[default]
    MaxPlusOne,
    CountPlusOne,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub display_name: String,
    pub enrolled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoreMetadata {
    version: u32,
    identities: BTreeMap<IdentityId, Identity>,
    /// Highest id ever handed out, deleted identities included.
    highest_assigned: IdentityId,
    /// Set when the corpus changed without a retrain.
    model_stale: bool,
}

impl Default for StoreMetadata {
    fn default() -> Self {
        Self {
            version: STORAGE_VERSION,
            identities: BTreeMap::new(),
            highest_assigned: 0,
            model_stale: false,
        }
    }
}

/// Result of `delete_identity`. The model is always stale afterwards.
#[derive(Debug, Clone)]
pub struct DeletedIdentity {
    pub identity: Identity,
    pub samples_removed: usize,
}

/// Owns the identity metadata, the per-identity sample images and the
/// location of the persisted model.
pub struct IdentityStore {
    data_dir: PathBuf,
    samples_dir: PathBuf,
    sample_size: (u32, u32),
    id_policy: IdPolicy,
    metadata: StoreMetadata,
}

impl IdentityStore {
    pub fn open(data_dir: impl Into<PathBuf>, sample_size: (u32, u32), id_policy: IdPolicy) -> Result<Self> {
        let data_dir = data_dir.into();
        let samples_dir = data_dir.join(SAMPLES_DIR);
        fs::create_dir_all(&samples_dir).map_err(|e| {
            FaceGateError::Persistence(format!("Failed to create {}: {}", samples_dir.display(), e))
        })?;

        let mut store = Self {
            data_dir,
            samples_dir,
            sample_size,
            id_policy,
            metadata: StoreMetadata::default(),
        };
        store.reload()?;
        Ok(store)
    }

    /// Re-reads the metadata file, discarding the in-memory copy.
    pub fn reload(&mut self) -> Result<()> {
        let path = self.metadata_path();
        if !path.exists() {
            tracing::debug!("No identity metadata at {}, starting empty", path.display());
            self.metadata = StoreMetadata::default();
            return Ok(());
        }

        let bytes = fs::read(&path).map_err(|e| {
            FaceGateError::Persistence(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut metadata: StoreMetadata = bincode::deserialize(&bytes).map_err(|e| {
            FaceGateError::Persistence(format!("Failed to deserialize {}: {}", path.display(), e))
        })?;

        if metadata.version > STORAGE_VERSION {
            return Err(FaceGateError::Persistence(format!(
                "{} was written by a newer version (format {})",
                path.display(),
                metadata.version
            )));
        }
        metadata.version = STORAGE_VERSION;

        tracing::info!("Loaded {} identities from {}", metadata.identities.len(), path.display());
        self.metadata = metadata;
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn model_path(&self) -> PathBuf {
        self.data_dir.join(MODEL_FILE)
    }

    pub fn sample_size(&self) -> (u32, u32) {
        self.sample_size
    }

    pub fn id_policy(&self) -> IdPolicy {
        self.id_policy
    }

    /// The id `create_identity` would assign right now.
    pub fn next_id(&self) -> IdentityId {
        let mut candidate = match self.id_policy {
            IdPolicy::MaxPlusOne => {
                let live_max = self.metadata.identities.keys().next_back().copied().unwrap_or(0);
                live_max.max(self.metadata.highest_assigned) + 1
            }
            IdPolicy::CountPlusOne => self.metadata.identities.len() as IdentityId + 1,
        };

        // Leftover sample directories belong to someone; never write into them.
        while self.metadata.identities.contains_key(&candidate) || self.sample_dir(candidate).exists() {
            candidate += 1;
        }
        candidate
    }

    pub fn create_identity(&mut self, name: &str) -> Result<IdentityId> {
        let display_name = validate_name(name)?;
        let id = self.next_id();

        let sample_dir = self.sample_dir(id);
        fs::create_dir_all(&sample_dir).map_err(|e| {
            FaceGateError::Persistence(format!("Failed to create {}: {}", sample_dir.display(), e))
        })?;

        self.metadata.identities.insert(
            id,
            Identity {
                id,
                display_name,
                enrolled_at: Utc::now(),
            },
        );
        let previous_highest = self.metadata.highest_assigned;
        self.metadata.highest_assigned = previous_highest.max(id);
        if let Err(e) = self.save_metadata() {
            self.metadata.identities.remove(&id);
            self.metadata.highest_assigned = previous_highest;
            let _ = fs::remove_dir_all(&sample_dir);
            return Err(e);
        }

        tracing::info!("Created identity {} ({})", id, name.trim());
        Ok(id)
    }

    /// Writes the sample as the next `<n>.png` under the identity.
    pub fn append_sample(&mut self, id: IdentityId, sample: &Sample) -> Result<PathBuf> {
        if !self.contains(id) {
            return Err(FaceGateError::UnknownIdentity(id));
        }
        if sample.dimensions() != self.sample_size {
            return Err(FaceGateError::InvalidSample(format!(
                "Sample is {:?}, store expects {:?}",
                sample.dimensions(),
                self.sample_size
            )));
        }

        let dir = self.sample_dir(id);
        let index = sample_indices(&dir)?.last().map(|n| n + 1).unwrap_or(0);
        let path = dir.join(format!("{}.png", index));

        let mut encoded = Cursor::new(Vec::new());
        sample.image().write_to(&mut encoded, ImageOutputFormat::Png)?;
        write_atomic(&path, encoded.get_ref())?;

        tracing::debug!("Stored sample {} for identity {}", index, id);
        Ok(path)
    }

    pub fn list_identities(&self) -> BTreeMap<IdentityId, String> {
        self.metadata
            .identities
            .iter()
            .map(|(id, identity)| (*id, identity.display_name.clone()))
            .collect()
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.metadata.identities.values()
    }

    pub fn get(&self, id: IdentityId) -> Option<&Identity> {
        self.metadata.identities.get(&id)
    }

    pub fn contains(&self, id: IdentityId) -> bool {
        self.metadata.identities.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.metadata.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.identities.is_empty()
    }

    pub fn rename_identity(&mut self, id: IdentityId, name: &str) -> Result<()> {
        let display_name = validate_name(name)?;
        let identity = self
            .metadata
            .identities
            .get_mut(&id)
            .ok_or(FaceGateError::UnknownIdentity(id))?;

        let previous = std::mem::replace(&mut identity.display_name, display_name);
        if let Err(e) = self.save_metadata() {
            if let Some(identity) = self.metadata.identities.get_mut(&id) {
                identity.display_name = previous;
            }
            return Err(e);
        }

        tracing::info!("Renamed identity {} from {:?} to {:?}", id, previous, name.trim());
        Ok(())
    }

    /// Removes the metadata and every sample of `id`. The model is not
    /// retrained; it is flagged stale until someone retrains explicitly.
    pub fn delete_identity(&mut self, id: IdentityId) -> Result<DeletedIdentity> {
        let deleted = self.remove_identity(id, true)?;
        tracing::warn!(
            "Deleted identity {} ({}); model is stale until retrained",
            id,
            deleted.identity.display_name
        );
        Ok(deleted)
    }

    /// Undoes a `create_identity` whose enrollment never completed.
    ///
    /// Staleness is only raised when the new samples already reached a saved model.
    pub(crate) fn discard_identity(&mut self, id: IdentityId, model_includes_it: bool) -> Result<()> {
        self.remove_identity(id, model_includes_it)?;
        tracing::info!("Rolled back identity {}", id);
        Ok(())
    }

    fn remove_identity(&mut self, id: IdentityId, mark_stale: bool) -> Result<DeletedIdentity> {
        let identity = self
            .metadata
            .identities
            .remove(&id)
            .ok_or(FaceGateError::UnknownIdentity(id))?;
        let was_stale = self.metadata.model_stale;
        self.metadata.model_stale |= mark_stale;

        if let Err(e) = self.save_metadata() {
            self.metadata.identities.insert(id, identity);
            self.metadata.model_stale = was_stale;
            return Err(e);
        }

        // Metadata is committed; leftover files only block id reuse.
        let dir = self.sample_dir(id);
        let samples_removed = sample_indices(&dir).map(|s| s.len()).unwrap_or(0);
        if dir.exists() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                return Err(FaceGateError::Persistence(format!(
                    "Identity {} removed but its samples in {} could not be deleted: {}",
                    id,
                    dir.display(),
                    e
                )));
            }
        }

        Ok(DeletedIdentity {
            identity,
            samples_removed,
        })
    }

    pub fn sample_count(&self, id: IdentityId) -> Result<usize> {
        if !self.contains(id) {
            return Err(FaceGateError::UnknownIdentity(id));
        }
        Ok(sample_indices(&self.sample_dir(id))?.len())
    }

    /// Every stored sample, by ascending identity id then ascending sample index.
    ///
    /// Fails if a sample cannot be decoded or has the wrong size, or if a
    /// registered identity has no samples left, so that training never
    /// silently leaves an identity out of the model.
    pub fn corpus(&self) -> Result<Vec<(Sample, IdentityId)>> {
        let mut corpus = Vec::new();

        for id in self.metadata.identities.keys() {
            let dir = self.sample_dir(*id);
            let indices = sample_indices(&dir)?;
            if indices.is_empty() {
                return Err(FaceGateError::Persistence(format!(
                    "Identity {} has no samples in {}", id, dir.display()
                )));
            }
            for index in indices {
                let path = dir.join(format!("{}.png", index));
                let sample = image::open(&path)
                    .map_err(FaceGateError::from)
                    .and_then(|img| Sample::from_image(img.to_luma8(), self.sample_size))
                    .map_err(|e| {
                        FaceGateError::Persistence(format!("Unusable sample {}: {}", path.display(), e))
                    })?;
                corpus.push((sample, *id));
            }
        }

        tracing::debug!("Collected {} samples across {} identities", corpus.len(), self.len());
        Ok(corpus)
    }

    pub fn is_model_stale(&self) -> bool {
        self.metadata.model_stale
    }

    pub fn mark_model_fresh(&mut self) -> Result<()> {
        if !self.metadata.model_stale {
            return Ok(());
        }
        self.metadata.model_stale = false;
        if let Err(e) = self.save_metadata() {
            self.metadata.model_stale = true;
            return Err(e);
        }
        Ok(())
    }

    fn save_metadata(&self) -> Result<()> {
        let encoded = bincode::serialize(&self.metadata)
            .map_err(|e| FaceGateError::Persistence(format!("Failed to serialize metadata: {}", e)))?;
        write_atomic(&self.metadata_path(), &encoded)
    }

    fn metadata_path(&self) -> PathBuf {
        self.data_dir.join(METADATA_FILE)
    }

    fn sample_dir(&self, id: IdentityId) -> PathBuf {
        self.samples_dir.join(id.to_string())
    }
}

pub(crate) fn validate_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_control) {
        return Err(FaceGateError::InvalidName(name.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Sorted numeric indices of `<n>.png` files in `dir`; a missing dir has none.
fn sample_indices(dir: &Path) -> Result<Vec<u32>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(dir).map_err(|e| {
        FaceGateError::Persistence(format!("Failed to list {}: {}", dir.display(), e))
    })?;

    let mut indices = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("png") {
            continue;
        }
        if let Some(index) = path.file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse().ok()) {
            indices.push(index);
        }
    }
    indices.sort_unstable();
    Ok(indices)
}
