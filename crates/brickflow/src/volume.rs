use crate::{Error, Point, Result, VolumeBounds};

/// Dense `u64` labels over a box, stored row-major (x fastest).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelVolume {
    bounds: VolumeBounds,
    labels: Vec<u64>,
}

impl LabelVolume {
    /// # Errors
    ///
    /// Returns [`Error::Codec`] when `labels.len()` does not match the
    /// number of voxels in `bounds`.
    pub fn new(bounds: VolumeBounds, labels: Vec<u64>) -> Result<Self> {
        let expected = bounds.voxel_count();
        if labels.len() != expected {
            return Err(Error::Codec {
                expected,
                actual: labels.len(),
            });
        }
        Ok(Self { bounds, labels })
    }

    pub fn filled(bounds: VolumeBounds, label: u64) -> Self {
        Self {
            bounds,
            labels: vec![label; bounds.voxel_count()],
        }
    }

    pub fn from_fn(bounds: VolumeBounds, mut f: impl FnMut(Point) -> u64) -> Self {
        Self {
            bounds,
            labels: bounds.points().map(&mut f).collect(),
        }
    }

    pub const fn bounds(&self) -> &VolumeBounds {
        &self.bounds
    }

    pub fn labels(&self) -> &[u64] {
        &self.labels
    }

    pub fn into_labels(self) -> Vec<u64> {
        self.labels
    }

    pub fn get(&self, p: Point) -> Option<u64> {
        self.bounds.linear_index(p).map(|i| self.labels[i])
    }

    /// Returns `false` if `p` lies outside the volume.
    pub fn set(&mut self, p: Point, label: u64) -> bool {
        match self.bounds.linear_index(p) {
            Some(i) => {
                self.labels[i] = label;
                true
            }
            None => false,
        }
    }

    /// `(point, label)` pairs in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (Point, u64)> + '_ {
        self.bounds.points().zip(self.labels.iter().copied())
    }

    /// Copies the part of this volume inside `region`.
    pub fn crop(&self, region: &VolumeBounds) -> Option<Self> {
        let region = self.bounds.intersection(region)?;
        Some(Self::from_fn(region, |p| {
            // region is inside self.bounds, so the index always exists
            self.bounds
                .linear_index(p)
                .map_or(0, |i| self.labels[i])
        }))
    }

    /// Rewrites every label through `f`.
    pub fn map_labels(&mut self, mut f: impl FnMut(u64) -> u64) {
        for label in &mut self.labels {
            *label = f(*label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_must_match_bounds() {
        let b = VolumeBounds::new([0, 0, 0], [2, 2, 2]).unwrap();
        assert!(LabelVolume::new(b, vec![0; 8]).is_ok());
        assert_eq!(
            LabelVolume::new(b, vec![0; 7]),
            Err(Error::Codec {
                expected: 8,
                actual: 7
            })
        );
    }

    #[test]
    fn crop_keeps_coordinates() {
        let b = VolumeBounds::new([0, 0, 0], [4, 4, 4]).unwrap();
        let vol = LabelVolume::from_fn(b, |[z, y, x]| (z * 100 + y * 10 + x) as u64);
        let region = VolumeBounds::new([1, 2, 3], [3, 9, 9]).unwrap();
        let cropped = vol.crop(&region).unwrap();
        assert_eq!(cropped.bounds().shape(), [2, 2, 1]);
        assert_eq!(cropped.get([2, 3, 3]), Some(233));
        assert_eq!(cropped.get([0, 0, 0]), None);
    }

    #[test]
    fn set_outside_is_rejected() {
        let b = VolumeBounds::new([0, 0, 0], [1, 1, 2]).unwrap();
        let mut vol = LabelVolume::filled(b, 0);
        assert!(vol.set([0, 0, 1], 9));
        assert!(!vol.set([0, 0, 2], 9));
        vol.map_labels(|l| l + 1);
        assert_eq!(vol.labels(), &[1, 10]);
    }
}
