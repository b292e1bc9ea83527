//! Little-endian `u64` block encoding for label volumes.
//!
//! Stores exchange chunks as raw blocks: one `u64` per voxel, row-major,
//! no header. The bounds travel out of band with the request.

use crate::{Error, LabelVolume, Result, VolumeBounds};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const LABEL_WIDTH: usize = core::mem::size_of::<u64>();

/// Serializes labels into a contiguous little-endian block.
pub fn encode_labels(volume: &LabelVolume) -> Bytes {
    let mut buf = BytesMut::with_capacity(volume.labels().len() * LABEL_WIDTH);
    for label in volume.labels() {
        buf.put_u64_le(*label);
    }
    buf.freeze()
}

/// Parses a block produced by [`encode_labels`] for the given bounds.
///
/// # Errors
///
/// Returns [`Error::Codec`] if `data` is not exactly one `u64` per voxel.
pub fn decode_labels(mut data: &[u8], bounds: VolumeBounds) -> Result<LabelVolume> {
    let expected = bounds.voxel_count() * LABEL_WIDTH;
    if data.len() != expected {
        return Err(Error::Codec {
            expected,
            actual: data.len(),
        });
    }
    let mut labels = Vec::with_capacity(bounds.voxel_count());
    while data.has_remaining() {
        labels.push(data.get_u64_le());
    }
    LabelVolume::new(bounds, labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_is_little_endian_row_major() {
        let b = VolumeBounds::new([0, 0, 0], [1, 1, 2]).unwrap();
        let vol = LabelVolume::new(b, vec![1, 0x0102]).unwrap();
        let bytes = encode_labels(&vol);
        assert_eq!(&bytes[..], &[1, 0, 0, 0, 0, 0, 0, 0, 2, 1, 0, 0, 0, 0, 0, 0]);
        assert_eq!(decode_labels(&bytes, b).unwrap(), vol);
    }

    #[test]
    fn truncated_block_is_rejected() {
        let b = VolumeBounds::new([0, 0, 0], [2, 2, 2]).unwrap();
        let err = decode_labels(&[0u8; 60], b).unwrap_err();
        assert_eq!(
            err,
            Error::Codec {
                expected: 64,
                actual: 60
            }
        );
    }
}
