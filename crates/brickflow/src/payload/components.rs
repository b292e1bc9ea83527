use crate::{Face, LabelVolume, Payload, PayloadError, VolumeBounds, decode_labels};
use std::collections::VecDeque;

/// 6-connected components of equal input value.
///
/// Every maximal face-connected region of voxels sharing the same
/// non-background input value gets its own label, numbered from 1 in
/// row-major order of first appearance. Background stays background.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectedComponents {
    pub background: u64,
}

impl ConnectedComponents {
    pub const fn new(background: u64) -> Self {
        Self { background }
    }

    /// Labels an already decoded volume.
    pub fn label(&self, input: &LabelVolume) -> LabelVolume {
        let bounds = *input.bounds();
        let values = input.labels();
        let mut out = vec![self.background; values.len()];
        let mut seen = vec![false; values.len()];
        let mut queue = VecDeque::new();
        let mut next = 0u64;

        for (start, point) in bounds.points().enumerate() {
            if seen[start] || values[start] == self.background {
                continue;
            }
            next += 1;
            // label ids must not collide with the background sentinel
            if next == self.background {
                next += 1;
            }
            let value = values[start];
            seen[start] = true;
            queue.push_back(point);

            while let Some(p) = queue.pop_front() {
                if let Some(i) = bounds.linear_index(p) {
                    out[i] = next;
                }
                for face in Face::ALL {
                    let q = face.cross(p);
                    let Some(j) = bounds.linear_index(q) else {
                        continue;
                    };
                    if !seen[j] && values[j] == value {
                        seen[j] = true;
                        queue.push_back(q);
                    }
                }
            }
        }

        // lengths match by construction
        LabelVolume::new(bounds, out).unwrap_or_else(|_| LabelVolume::filled(bounds, self.background))
    }
}

impl Payload for ConnectedComponents {
    fn process(&self, data: &[u8], bounds: &VolumeBounds) -> Result<LabelVolume, PayloadError> {
        let input = decode_labels(data, *bounds).map_err(|e| PayloadError(e.to_string()))?;
        Ok(self.label(&input))
    }
}
