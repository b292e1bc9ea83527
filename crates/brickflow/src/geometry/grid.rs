use super::{AXES, Face, FaceSet, Point, VolumeBounds};
use crate::{Error, Result};
use core::fmt;

/// Stable grid coordinate of a chunk, ordered `[z, y, x]`.
///
/// Ordering is lexicographic, which is what the stitcher uses to pick the
/// canonical representative of an equivalence class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChunkId(pub [i64; AXES]);

impl ChunkId {
    pub const fn new(z: i64, y: i64, x: i64) -> Self {
        Self([z, y, x])
    }

    /// Grid coordinate of the chunk across `face`.
    pub fn neighbor(&self, face: Face) -> Self {
        Self(face.cross(self.0))
    }

    /// The face of `self` shared with `other`, if the two are face-adjacent.
    pub fn shared_face(&self, other: &Self) -> Option<Face> {
        Face::ALL.into_iter().find(|f| self.neighbor(*f) == *other)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.0[0], self.0[1], self.0[2])
    }
}

/// Lifecycle of a chunk within one run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChunkStatus {
    #[default]
    Pending,
    Running,
    Done,
    Failed,
}

impl ChunkStatus {
    /// `Running -> Pending` is a requeue; `Done` is terminal.
    pub const fn can_transition_to(self, next: ChunkStatus) -> bool {
        use ChunkStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Running, Done) | (Running, Failed) | (Running, Pending)
        )
    }
}

/// One rectangular piece of the volume.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Chunk {
    pub id: ChunkId,
    /// Region this chunk owns. Cores tile the volume exactly.
    pub core: VolumeBounds,
    /// Core grown by the halo and clipped to the volume; what gets fetched.
    pub bounds: VolumeBounds,
    pub status: ChunkStatus,
    /// Faces shared with another chunk (not on the outer volume boundary).
    #[cfg_attr(feature = "serde", serde(skip))]
    pub interior: FaceSet,
}

impl Chunk {
    /// Applies a status transition, rejecting illegal ones.
    pub fn transition(&mut self, next: ChunkStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::invalid(format!(
                "chunk {} cannot move from {:?} to {:?}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }
}

/// Cuts a volume into a regular grid of chunks.
///
/// Grid coordinates are `floor((p - origin) / edge)` per axis, so the chunk
/// id of a voxel depends only on the origin and the edge length, never on
/// iteration order. The last chunk on each axis may be smaller than `edge`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partitioner {
    volume: VolumeBounds,
    edge: [i64; AXES],
    halo: i64,
    origin: Point,
}

impl Partitioner {
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a non-positive edge or negative halo.
    pub fn new(volume: VolumeBounds, edge: [i64; AXES], halo: i64) -> Result<Self> {
        if let Some(a) = (0..AXES).find(|a| edge[*a] <= 0) {
            return Err(Error::config(format!(
                "chunk edge must be positive, got {} on axis {a}",
                edge[a]
            )));
        }
        if halo < 0 {
            return Err(Error::config(format!(
                "halo must be non-negative, got {halo}"
            )));
        }
        Ok(Self {
            volume,
            edge,
            halo,
            origin: [0; AXES],
        })
    }

    /// Cubic chunks with the same edge on every axis.
    pub fn cubic(volume: VolumeBounds, edge: i64, halo: i64) -> Result<Self> {
        Self::new(volume, [edge; AXES], halo)
    }

    /// Anchors the grid at `origin` instead of the coordinate origin.
    #[must_use]
    pub const fn with_origin(mut self, origin: Point) -> Self {
        self.origin = origin;
        self
    }

    pub const fn volume(&self) -> &VolumeBounds {
        &self.volume
    }

    pub const fn halo(&self) -> i64 {
        self.halo
    }

    fn cell(&self, p: i64, axis: usize) -> i64 {
        (p - self.origin[axis]).div_euclid(self.edge[axis])
    }

    /// First and last grid coordinate per axis, inclusive.
    fn id_range(&self) -> [(i64, i64); AXES] {
        let (min, max) = (self.volume.min(), self.volume.max());
        core::array::from_fn(|a| (self.cell(min[a], a), self.cell(max[a] - 1, a)))
    }

    /// Number of chunks along each axis.
    pub fn grid_shape(&self) -> [usize; AXES] {
        self.id_range().map(|(lo, hi)| (hi - lo + 1) as usize)
    }

    pub fn chunk_count(&self) -> usize {
        self.grid_shape().iter().product()
    }

    /// Chunk that owns voxel `p`, if `p` lies inside the volume.
    pub fn chunk_id_for(&self, p: Point) -> Option<ChunkId> {
        self.volume
            .contains(p)
            .then(|| ChunkId(core::array::from_fn(|a| self.cell(p[a], a))))
    }

    /// Builds the chunk at grid coordinate `id`, if it touches the volume.
    pub fn chunk(&self, id: ChunkId) -> Option<Chunk> {
        let cell_min: Point =
            core::array::from_fn(|a| self.origin[a] + id.0[a] * self.edge[a]);
        let cell_max: Point = core::array::from_fn(|a| cell_min[a] + self.edge[a]);
        let cell = VolumeBounds::new(cell_min, cell_max).ok()?;
        let core = cell.intersection(&self.volume)?;
        let bounds = core
            .grow([self.halo; AXES])
            .intersection(&self.volume)
            .unwrap_or(core);

        let mut interior = FaceSet::empty();
        for face in Face::ALL {
            let a = face.axis();
            let on_outer = if face.is_upper() {
                core.max()[a] == self.volume.max()[a]
            } else {
                core.min()[a] == self.volume.min()[a]
            };
            if !on_outer {
                interior.insert(face);
            }
        }

        Some(Chunk {
            id,
            core,
            bounds,
            status: ChunkStatus::Pending,
            interior,
        })
    }

    /// All chunks, ordered lexicographically by id.
    pub fn chunks(&self) -> Vec<Chunk> {
        let [(z0, z1), (y0, y1), (x0, x1)] = self.id_range();
        let mut out = Vec::with_capacity(self.chunk_count());
        for z in z0..=z1 {
            for y in y0..=y1 {
                for x in x0..=x1 {
                    out.extend(self.chunk(ChunkId::new(z, y, x)));
                }
            }
        }
        out
    }
}
