use crate::{ChunkId, Error, GlobalLabel, LabelVolume, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

/// Global labeling produced by the stitcher.
///
/// Maps every observed `(chunk, local label)` to its class representative
/// and every class to a compact global id. Ids are handed out in ascending
/// order of representative, starting at `label_offset + 1` and skipping the
/// background value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalResult {
    representatives: BTreeMap<GlobalLabel, GlobalLabel>,
    global_ids: BTreeMap<GlobalLabel, u64>,
    background: u64,
}

/// Bytes per entry of [`FinalResult::encode_mapping`].
pub const MAPPING_ENTRY_WIDTH: usize = 3 * 8 + 8 + 8;

impl FinalResult {
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the ids above `label_offset` run out
    /// before every object has one.
    pub(crate) fn new(
        representatives: BTreeMap<GlobalLabel, GlobalLabel>,
        background: u64,
        label_offset: u64,
    ) -> Result<Self> {
        let mut reps: Vec<GlobalLabel> = representatives.values().copied().collect();
        reps.sort_unstable();
        reps.dedup();

        let mut ids = (label_offset..=u64::MAX).skip(1).filter(|id| *id != background);
        let mut global_ids = BTreeMap::new();
        for rep in reps {
            let Some(id) = ids.next() else {
                return Err(Error::config(format!(
                    "label_offset {label_offset} leaves no global id for object {rep}"
                )));
            };
            global_ids.insert(rep, id);
        }

        Ok(Self {
            representatives,
            global_ids,
            background,
        })
    }

    /// Representative of `key`, or `None` if it was never observed.
    pub fn representative(&self, key: &GlobalLabel) -> Option<GlobalLabel> {
        self.representatives.get(key).copied()
    }

    /// Representative of `key`, or `key` itself if unknown.
    ///
    /// Idempotent: resolving a representative returns it unchanged.
    pub fn resolve(&self, key: GlobalLabel) -> GlobalLabel {
        self.representative(&key).unwrap_or(key)
    }

    /// Global id of a local label. Background maps to the background value.
    pub fn global_id(&self, chunk: ChunkId, label: u64) -> Option<u64> {
        if label == self.background {
            return Some(self.background);
        }
        let rep = self.representative(&GlobalLabel::new(chunk, label))?;
        self.global_ids.get(&rep).copied()
    }

    /// Number of distinct global objects.
    pub fn object_count(&self) -> usize {
        self.global_ids.len()
    }

    pub fn label_count(&self) -> usize {
        self.representatives.len()
    }

    pub fn background(&self) -> u64 {
        self.background
    }

    /// `(local, representative)` pairs, sorted by local key.
    pub fn iter(&self) -> impl Iterator<Item = (&GlobalLabel, &GlobalLabel)> {
        self.representatives.iter()
    }

    /// Members of every object keyed by global id.
    pub fn objects(&self) -> BTreeMap<u64, Vec<GlobalLabel>> {
        let mut out: BTreeMap<u64, Vec<GlobalLabel>> = BTreeMap::new();
        for (key, rep) in &self.representatives {
            if let Some(id) = self.global_ids.get(rep) {
                out.entry(*id).or_default().push(*key);
            }
        }
        out
    }

    /// Rewrites a chunk's local labels to global ids.
    ///
    /// Labels the stitcher never saw become background.
    pub fn remap_volume(&self, chunk: ChunkId, volume: &LabelVolume) -> LabelVolume {
        let mut out = volume.clone();
        out.map_labels(|label| self.global_id(chunk, label).unwrap_or(self.background));
        out
    }

    /// Serializes the mapping as fixed-width little-endian records:
    /// `chunk z, y, x (i64)`, `local label (u64)`, `global id (u64)`,
    /// sorted by chunk then label.
    pub fn encode_mapping(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.representatives.len() * MAPPING_ENTRY_WIDTH);
        for (key, rep) in &self.representatives {
            let Some(id) = self.global_ids.get(rep) else {
                continue;
            };
            for coord in key.chunk.0 {
                buf.put_i64_le(coord);
            }
            buf.put_u64_le(key.label);
            buf.put_u64_le(*id);
        }
        buf.freeze()
    }
}
