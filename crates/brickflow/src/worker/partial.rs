use crate::{Chunk, ChunkId, Face, LabelVolume, VolumeBounds};
use std::collections::BTreeMap;

/// What a chunk knows about one of its local labels.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LabelSummary {
    /// Voxels carrying the label inside the chunk core.
    pub voxels: u64,
    /// Tight bounding box of those voxels.
    pub extent: VolumeBounds,
}

/// Labels next to one interior face of a chunk.
///
/// `inner` is the layer of the core adjacent to the face; `outer` is the
/// halo just beyond it, as labeled by this chunk. The stitcher compares
/// slabs of neighboring chunks to find contacts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FaceSlab {
    pub face: Face,
    pub inner: LabelVolume,
    pub outer: Option<LabelVolume>,
}

/// Output of one successful worker task. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartialResult {
    pub chunk: ChunkId,
    pub core: VolumeBounds,
    /// Non-background local labels present in the core.
    pub labels: BTreeMap<u64, LabelSummary>,
    pub slabs: Vec<FaceSlab>,
    /// Local labels over the core, used when persisting.
    pub volume: LabelVolume,
}

impl PartialResult {
    /// Summarizes the payload output for `chunk`.
    ///
    /// `labels` must cover `chunk.bounds`. `depth` is the thickness of the
    /// core layer kept per face (at least one voxel).
    pub fn from_labels(chunk: &Chunk, labels: &LabelVolume, background: u64, depth: i64) -> Self {
        let volume = labels
            .crop(&chunk.core)
            .unwrap_or_else(|| LabelVolume::filled(chunk.core, background));

        let mut extents: BTreeMap<u64, (u64, [i64; 3], [i64; 3])> = BTreeMap::new();
        for (p, label) in volume.iter() {
            if label == background {
                continue;
            }
            let entry = extents.entry(label).or_insert((0, p, p));
            entry.0 += 1;
            for a in 0..3 {
                entry.1[a] = entry.1[a].min(p[a]);
                entry.2[a] = entry.2[a].max(p[a]);
            }
        }
        let summaries = extents
            .into_iter()
            .filter_map(|(label, (voxels, lo, hi))| {
                let extent = VolumeBounds::new(lo, hi.map(|v| v + 1)).ok()?;
                Some((label, LabelSummary { voxels, extent }))
            })
            .collect();

        let depth = depth.max(1);
        let slabs = chunk
            .interior
            .iter()
            .filter_map(|face| {
                let (inner, outer) = face_regions(chunk, face, depth);
                Some(FaceSlab {
                    face,
                    inner: labels.crop(&inner?)?,
                    outer: outer.and_then(|o| labels.crop(&o)),
                })
            })
            .collect();

        Self {
            chunk: chunk.id,
            core: chunk.core,
            labels: summaries,
            slabs,
            volume,
        }
    }

    pub fn slab(&self, face: Face) -> Option<&FaceSlab> {
        self.slabs.iter().find(|s| s.face == face)
    }

    pub fn label_count(&self) -> usize {
        self.labels.len()
    }
}

/// Core layer of `depth` voxels against `face`, and the halo beyond it.
fn face_regions(chunk: &Chunk, face: Face, depth: i64) -> (Option<VolumeBounds>, Option<VolumeBounds>) {
    let a = face.axis();
    let (cmin, cmax) = (chunk.core.min()[a], chunk.core.max()[a]);
    let (bmin, bmax) = (chunk.bounds.min()[a], chunk.bounds.max()[a]);
    if face.is_upper() {
        (
            chunk.core.with_axis(a, (cmax - depth).max(cmin), cmax),
            chunk.bounds.with_axis(a, cmax, bmax),
        )
    } else {
        (
            chunk.core.with_axis(a, cmin, (cmin + depth).min(cmax)),
            chunk.bounds.with_axis(a, bmin, cmin),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Partitioner;

    #[test]
    fn summarizes_core_labels_and_interior_faces() {
        let volume = VolumeBounds::new([0, 0, 0], [1, 8, 8]).unwrap();
        let p = Partitioner::new(volume, [1, 4, 4], 1).unwrap();
        let chunk = p.chunk(crate::ChunkId::new(0, 0, 0)).unwrap();
        assert_eq!(chunk.bounds, VolumeBounds::new([0, 0, 0], [1, 5, 5]).unwrap());

        // label 7 fills x == 4 (halo only), label 3 sits on the core corner
        let labels = LabelVolume::from_fn(chunk.bounds, |[_, y, x]| match (y, x) {
            (_, 4) => 7,
            (3, 3) => 3,
            _ => 0,
        });
        let partial = PartialResult::from_labels(&chunk, &labels, 0, 1);

        assert_eq!(partial.labels.len(), 1);
        let summary = &partial.labels[&3];
        assert_eq!(summary.voxels, 1);
        assert_eq!(summary.extent, VolumeBounds::new([0, 3, 3], [1, 4, 4]).unwrap());

        let faces: Vec<_> = partial.slabs.iter().map(|s| s.face).collect();
        assert_eq!(faces, vec![Face::MaxY, Face::MaxX]);

        let max_x = partial.slab(Face::MaxX).unwrap();
        assert_eq!(max_x.inner.bounds(), &VolumeBounds::new([0, 0, 3], [1, 4, 4]).unwrap());
        let outer = max_x.outer.as_ref().unwrap();
        assert_eq!(outer.bounds(), &VolumeBounds::new([0, 0, 4], [1, 5, 5]).unwrap());
        assert!(outer.labels().iter().all(|l| *l == 7));
    }

    #[test]
    fn no_halo_means_no_outer_slab() {
        let volume = VolumeBounds::new([0, 0, 0], [2, 2, 4]).unwrap();
        let p = Partitioner::new(volume, [2, 2, 2], 0).unwrap();
        let chunk = p.chunk(crate::ChunkId::new(0, 0, 1)).unwrap();
        let labels = LabelVolume::filled(chunk.bounds, 1);
        let partial = PartialResult::from_labels(&chunk, &labels, 0, 0);
        let slab = partial.slab(Face::MinX).unwrap();
        assert!(slab.outer.is_none());
        assert_eq!(slab.inner.bounds().shape(), [2, 2, 1]);
    }
}
