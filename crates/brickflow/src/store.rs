use crate::{Error, LabelVolume, VolumeBounds, encode_labels};
use bytes::Bytes;
use core::future::Future;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Failure reported by a [`VolumeStore`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Timeout, reset, overload. Worth retrying.
    #[error("transient: {0}")]
    Transient(String),
    /// Missing object, out-of-range read. Retrying will not help.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Transient(msg) => Error::TransientIo(msg),
            StoreError::Permanent(msg) => Error::Store(msg),
        }
    }
}

/// Client for the shared backend holding the input volume and receiving
/// results.
pub trait VolumeStore: Send + Sync + 'static {
    /// Reads the voxels in `bounds` as a little-endian `u64` block.
    fn fetch(&self, bounds: &VolumeBounds) -> impl Future<Output = Result<Bytes, StoreError>> + Send;

    /// Writes `data` under `key`, replacing any previous object.
    fn put(&self, key: &str, data: Bytes) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Store backed by an in-memory volume. Useful for tests and small runs.
#[derive(Debug)]
pub struct InMemoryStore {
    source: LabelVolume,
    objects: Mutex<BTreeMap<String, Bytes>>,
}

impl InMemoryStore {
    pub fn new(source: LabelVolume) -> Self {
        Self {
            source,
            objects: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn source(&self) -> &LabelVolume {
        &self.source
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }
}

impl VolumeStore for InMemoryStore {
    fn fetch(&self, bounds: &VolumeBounds) -> impl Future<Output = Result<Bytes, StoreError>> + Send {
        let result = if self.source.bounds().contains_bounds(bounds) {
            self.source
                .crop(bounds)
                .map(|block| encode_labels(&block))
                .ok_or_else(|| StoreError::Permanent(format!("empty read {bounds}")))
        } else {
            Err(StoreError::Permanent(format!(
                "read {bounds} outside stored volume {}",
                self.source.bounds()
            )))
        };
        core::future::ready(result)
    }

    fn put(&self, key: &str, data: Bytes) -> impl Future<Output = Result<(), StoreError>> + Send {
        self.objects.lock().insert(key.to_owned(), data);
        core::future::ready(Ok(()))
    }
}

impl<S: VolumeStore> VolumeStore for std::sync::Arc<S> {
    fn fetch(&self, bounds: &VolumeBounds) -> impl Future<Output = Result<Bytes, StoreError>> + Send {
        (**self).fetch(bounds)
    }

    fn put(&self, key: &str, data: Bytes) -> impl Future<Output = Result<(), StoreError>> + Send {
        (**self).put(key, data)
    }
}
