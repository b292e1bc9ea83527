use crate::{LabelVolume, VolumeBounds};

/// Failure reported by a payload on otherwise valid input. Never retried.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct PayloadError(pub String);

impl PayloadError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<PayloadError> for crate::Error {
    fn from(err: PayloadError) -> Self {
        crate::Error::Payload(err.0)
    }
}

/// Per-chunk processing step supplied by the application.
///
/// `data` is the raw block fetched for `bounds` (halo included). The result
/// must cover exactly `bounds`. Labels are local to the chunk; the stitcher
/// makes them global.
pub trait Payload: Send + Sync + 'static {
    fn process(&self, data: &[u8], bounds: &VolumeBounds) -> Result<LabelVolume, PayloadError>;
}

impl<F> Payload for F
where
    F: Fn(&[u8], &VolumeBounds) -> Result<LabelVolume, PayloadError> + Send + Sync + 'static,
{
    fn process(&self, data: &[u8], bounds: &VolumeBounds) -> Result<LabelVolume, PayloadError> {
        self(data, bounds)
    }
}
