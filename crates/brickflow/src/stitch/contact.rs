use crate::{ChunkId, Face, PartialResult};
use core::fmt;
use std::collections::BTreeMap;

/// A chunk-local label made globally unique by its chunk.
///
/// Ordered by chunk id first, then label, which gives the canonical
/// representative of every equivalence class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GlobalLabel {
    pub chunk: ChunkId,
    pub label: u64,
}

impl GlobalLabel {
    pub const fn new(chunk: ChunkId, label: u64) -> Self {
        Self { chunk, label }
    }
}

impl fmt::Display for GlobalLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.chunk, self.label)
    }
}

/// How labels of neighboring chunks are matched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ContactRule {
    /// Labels on either side of the shared face, one voxel apart.
    #[default]
    FaceAdjacency,
    /// Labels assigned to the same voxel by both chunks, compared over the
    /// halo each chunk sees of the other.
    HaloOverlap,
}

/// Label `label` of `chunk` touches `touching_label` of `touching_chunk`
/// across `face` over `voxels` voxels.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BoundaryContact {
    pub face: Face,
    pub chunk: ChunkId,
    pub label: u64,
    pub touching_chunk: ChunkId,
    pub touching_label: u64,
    pub voxels: u64,
}

impl BoundaryContact {
    pub const fn local(&self) -> GlobalLabel {
        GlobalLabel::new(self.chunk, self.label)
    }

    pub const fn remote(&self) -> GlobalLabel {
        GlobalLabel::new(self.touching_chunk, self.touching_label)
    }

    /// The same contact as reported from the other side.
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self {
            face: self.face.opposite(),
            chunk: self.touching_chunk,
            label: self.touching_label,
            touching_chunk: self.chunk,
            touching_label: self.label,
            voxels: self.voxels,
        }
    }

    /// Orientation-free key: both reports of one contact map to it.
    pub fn canonical(&self) -> (GlobalLabel, GlobalLabel) {
        let (a, b) = (self.local(), self.remote());
        if a <= b { (a, b) } else { (b, a) }
    }
}

/// Finds the label pairs that meet between two face-adjacent chunks.
///
/// Only labels present in each chunk's own core take part, so a label a
/// chunk saw only in its halo never becomes a class member. Returns an
/// empty list if the chunks are not neighbors or a face slab is missing.
/// Output is sorted by label pair.
pub fn detect_contacts(
    a: &PartialResult,
    b: &PartialResult,
    rule: ContactRule,
    background: u64,
) -> Vec<BoundaryContact> {
    let Some(face) = a.chunk.shared_face(&b.chunk) else {
        return Vec::new();
    };
    let (Some(a_slab), Some(b_slab)) = (a.slab(face), b.slab(face.opposite())) else {
        return Vec::new();
    };

    let mut counts: BTreeMap<(u64, u64), u64> = BTreeMap::new();
    let mut record = |la: u64, lb: u64| {
        if la != background
            && lb != background
            && a.labels.contains_key(&la)
            && b.labels.contains_key(&lb)
        {
            *counts.entry((la, lb)).or_default() += 1;
        }
    };

    match rule {
        ContactRule::FaceAdjacency => {
            let axis = face.axis();
            let plane = if face.is_upper() {
                a.core.max()[axis] - 1
            } else {
                a.core.min()[axis]
            };
            for (p, la) in a_slab.inner.iter().filter(|(p, _)| p[axis] == plane) {
                if let Some(lb) = b_slab.inner.get(face.cross(p)) {
                    record(la, lb);
                }
            }
        }
        ContactRule::HaloOverlap => {
            if let Some(outer) = &a_slab.outer {
                for (p, la) in outer.iter() {
                    if let Some(lb) = b_slab.inner.get(p) {
                        record(la, lb);
                    }
                }
            }
            if let Some(outer) = &b_slab.outer {
                for (p, lb) in outer.iter() {
                    if let Some(la) = a_slab.inner.get(p) {
                        record(la, lb);
                    }
                }
            }
        }
    }

    counts
        .into_iter()
        .map(|((label, touching_label), voxels)| BoundaryContact {
            face,
            chunk: a.chunk,
            label,
            touching_chunk: b.chunk,
            touching_label,
            voxels,
        })
        .collect()
}
