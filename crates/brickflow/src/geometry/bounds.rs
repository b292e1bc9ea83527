use crate::{Error, Result};
use core::fmt;

/// Number of spatial axes.
pub const AXES: usize = 3;

/// A voxel coordinate, ordered `[z, y, x]`.
pub type Point = [i64; AXES];

/// Half-open, axis-aligned integer box `[min, max)`.
///
/// Invariant: `min[a] < max[a]` on every axis, so a `VolumeBounds` is never
/// empty. Operations that could produce an empty box return `Option`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "BoundsRepr", into = "BoundsRepr")
)]
pub struct VolumeBounds {
    min: Point,
    max: Point,
}

impl VolumeBounds {
    /// Creates a box, rejecting empty or inverted extents.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `min[a] >= max[a]` on any axis.
    pub fn new(min: Point, max: Point) -> Result<Self> {
        Self::checked(min, max).ok_or_else(|| {
            Error::config(format!(
                "bounds {min:?}..{max:?} must be non-empty on every axis"
            ))
        })
    }

    fn checked(min: Point, max: Point) -> Option<Self> {
        (0..AXES)
            .all(|a| min[a] < max[a])
            .then_some(Self { min, max })
    }

    pub const fn min(&self) -> Point {
        self.min
    }

    pub const fn max(&self) -> Point {
        self.max
    }

    /// Extent along each axis.
    pub fn shape(&self) -> [usize; AXES] {
        core::array::from_fn(|a| (self.max[a] - self.min[a]) as usize)
    }

    pub fn voxel_count(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn contains(&self, p: Point) -> bool {
        (0..AXES).all(|a| self.min[a] <= p[a] && p[a] < self.max[a])
    }

    pub fn contains_bounds(&self, other: &Self) -> bool {
        (0..AXES).all(|a| self.min[a] <= other.min[a] && other.max[a] <= self.max[a])
    }

    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let min = core::array::from_fn(|a| self.min[a].max(other.min[a]));
        let max = core::array::from_fn(|a| self.max[a].min(other.max[a]));
        Self::checked(min, max)
    }

    /// Expands every face outward by `margin[a]` voxels.
    pub fn grow(&self, margin: [i64; AXES]) -> Self {
        Self {
            min: core::array::from_fn(|a| self.min[a] - margin[a].max(0)),
            max: core::array::from_fn(|a| self.max[a] + margin[a].max(0)),
        }
    }

    /// Replaces the `[lo, hi)` range on one axis, keeping the others.
    pub fn with_axis(&self, axis: usize, lo: i64, hi: i64) -> Option<Self> {
        let mut min = self.min;
        let mut max = self.max;
        min[axis] = lo;
        max[axis] = hi;
        Self::checked(min, max)
    }

    /// Row-major offset of `p` inside this box (x varies fastest).
    pub fn linear_index(&self, p: Point) -> Option<usize> {
        if !self.contains(p) {
            return None;
        }
        let [_, sy, sx] = self.shape();
        let z = (p[0] - self.min[0]) as usize;
        let y = (p[1] - self.min[1]) as usize;
        let x = (p[2] - self.min[2]) as usize;
        Some((z * sy + y) * sx + x)
    }

    /// Every point in row-major order.
    pub fn points(&self) -> impl Iterator<Item = Point> + '_ {
        (self.min[0]..self.max[0]).flat_map(move |z| {
            (self.min[1]..self.max[1])
                .flat_map(move |y| (self.min[2]..self.max[2]).map(move |x| [z, y, x]))
        })
    }
}

impl fmt::Display for VolumeBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},{})x[{},{})x[{},{})",
            self.min[0], self.max[0], self.min[1], self.max[1], self.min[2], self.max[2]
        )
    }
}

#[cfg(feature = "serde")]
#[derive(serde::Serialize, serde::Deserialize)]
struct BoundsRepr {
    min: Point,
    max: Point,
}

#[cfg(feature = "serde")]
impl TryFrom<BoundsRepr> for VolumeBounds {
    type Error = Error;

    fn try_from(repr: BoundsRepr) -> Result<Self> {
        Self::new(repr.min, repr.max)
    }
}

#[cfg(feature = "serde")]
impl From<VolumeBounds> for BoundsRepr {
    fn from(bounds: VolumeBounds) -> Self {
        Self {
            min: bounds.min,
            max: bounds.max,
        }
    }
}
