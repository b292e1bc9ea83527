use crate::{LabelVolume, Payload, PayloadError, VolumeBounds, decode_labels};

/// Passes stored labels through unchanged.
///
/// For inputs that already carry a labeling that is consistent across
/// chunk borders.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityLabels;

impl Payload for IdentityLabels {
    fn process(&self, data: &[u8], bounds: &VolumeBounds) -> Result<LabelVolume, PayloadError> {
        decode_labels(data, *bounds).map_err(|e| PayloadError(e.to_string()))
    }
}
