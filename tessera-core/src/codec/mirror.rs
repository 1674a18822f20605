use super::{ShareBody, ShareEnvelope};
use crate::crypto::Digest;
use crate::error::{Result, TesseraError};
use bytes::Bytes;

/// Full-copy "sharing": each share holds the whole blob
///
/// Reconstruction still demands `threshold` shares that agree on the digest
/// and verify against it, so a single lying node cannot substitute data.
#[derive(Debug, Clone)]
pub struct MirrorCodec {
    threshold: usize,
}

impl MirrorCodec {
    pub fn new(threshold: usize) -> Result<Self> {
        if threshold == 0 || threshold > 255 {
            return Err(TesseraError::Configuration(format!(
                "mirror threshold must be within 1..=255, got {threshold}"
            )));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub(super) fn encode_bodies(&self, blob: &[u8], total: usize) -> Vec<ShareBody> {
        let digest = Digest::compute(blob);
        (0..total)
            .map(|_| ShareBody::Mirror {
                digest,
                data: blob.to_vec(),
            })
            .collect()
    }

    pub(super) fn decode_group(&self, group: &[ShareEnvelope]) -> Option<Bytes> {
        let mut verified = group.iter().filter_map(|share| match &share.body {
            ShareBody::Mirror { digest, data } if digest.verify(data) => Some(data),
            _ => None,
        });

        let first = verified.next()?;
        if 1 + verified.count() >= self.threshold {
            Some(Bytes::copy_from_slice(first))
        } else {
            None
        }
    }
}
