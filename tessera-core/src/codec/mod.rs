//! Secret-sharing codec
//!
//! Turns a blob into N self-describing shares and back. Two interchangeable
//! variants exist:
//!
//! - [`MirrorCodec`]: every share is a full copy plus digest. No
//!   confidentiality; useful for tests and debugging.
//! - [`ThresholdCodec`]: computational secret sharing. The blob is encrypted
//!   with a fresh AES-256-GCM key, the ciphertext is Reed-Solomon coded into
//!   K data and N-K parity shards, and the key is Shamir-shared with
//!   threshold K. Fewer than K shares reveal neither key nor plaintext.
//!
//! Every share carries the distribution-set identifier it was produced for,
//! so shares from different encodings are never mixed. Decoding is a pure
//! function of the supplied shares.

mod mirror;
pub mod shamir;
mod threshold;

pub use mirror::MirrorCodec;
pub use threshold::ThresholdCodec;

use crate::error::{ReconstructionError, Result, TesseraError};
use crate::fragment::DistributionSet;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Upper bound on K-subsets tried before giving up on a corrupted group
pub const MAX_RECONSTRUCTION_ATTEMPTS: usize = 512;

/// Which codec variant to build from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    Mirror,
    #[default]
    Threshold,
}

/// Closed set of secret-sharing variants
#[derive(Debug, Clone)]
pub enum SecretSharing {
    Mirror(MirrorCodec),
    Threshold(ThresholdCodec),
}

impl SecretSharing {
    pub fn new(kind: CodecKind, threshold: usize) -> Result<Self> {
        Ok(match kind {
            CodecKind::Mirror => Self::Mirror(MirrorCodec::new(threshold)?),
            CodecKind::Threshold => Self::Threshold(ThresholdCodec::new(threshold)?),
        })
    }

    /// Reconstruction threshold K
    pub fn threshold(&self) -> usize {
        match self {
            Self::Mirror(codec) => codec.threshold(),
            Self::Threshold(codec) => codec.threshold(),
        }
    }

    pub fn kind(&self) -> CodecKind {
        match self {
            Self::Mirror(_) => CodecKind::Mirror,
            Self::Threshold(_) => CodecKind::Threshold,
        }
    }

    /// Encode `blob` into `total` shares (N); any K of them rebuild it
    pub fn encode(&self, blob: &[u8], total: usize) -> Result<Vec<Bytes>> {
        check_parameters(self.threshold(), total)?;
        let header = ShareHeader {
            set_id: *uuid::Uuid::new_v4().as_bytes(),
            index: 0,
            total: total as u8,
            threshold: self.threshold() as u8,
        };
        let bodies = match self {
            Self::Mirror(codec) => codec.encode_bodies(blob, total),
            Self::Threshold(codec) => codec.encode_bodies(blob, total)?,
        };

        bodies
            .into_iter()
            .enumerate()
            .map(|(index, body)| {
                let envelope = ShareEnvelope {
                    header: ShareHeader {
                        index: index as u8,
                        ..header
                    },
                    body,
                };
                Ok(Bytes::from(bincode::serialize(&envelope)?))
            })
            .collect()
    }

    /// Rebuild a blob from any subset of its shares
    pub fn decode<'a, I>(&self, shares: I) -> std::result::Result<Bytes, ReconstructionError>
    where
        I: IntoIterator<Item = &'a Bytes>,
    {
        let threshold = self.threshold();
        let mut parsed = Vec::new();
        for raw in shares {
            match bincode::deserialize::<ShareEnvelope>(raw) {
                Ok(envelope) if self.accepts(&envelope) => parsed.push(envelope),
                Ok(envelope) => trace!(
                    index = envelope.header.index,
                    "Dropping share produced by a different codec"
                ),
                Err(e) => trace!(error = %e, "Dropping malformed share"),
            }
        }

        if parsed.len() < threshold {
            return Err(ReconstructionError::InsufficientFragments {
                available: parsed.len(),
                required: threshold,
            });
        }

        let groups = group_shares(parsed);
        let mut viable = groups.into_iter().filter(|g| g.len() >= threshold).peekable();
        if viable.peek().is_none() {
            return Err(ReconstructionError::InconsistentFragments);
        }

        for group in viable {
            let result = match self {
                Self::Mirror(codec) => codec.decode_group(&group),
                Self::Threshold(codec) => codec.decode_group(&group),
            };
            if let Some(blob) = result {
                return Ok(blob);
            }
            debug!(shares = group.len(), "Share group failed integrity verification");
        }
        Err(ReconstructionError::IntegrityCheckFailed)
    }

    /// Encode `blob` into the payloads of `set`, one share per fragment
    pub fn encode_into(&self, blob: &[u8], set: &mut DistributionSet) -> Result<()> {
        let shares = self.encode(blob, set.len())?;
        for (fragment, share) in set.fragments_mut().iter_mut().zip(shares) {
            fragment.set_payload(share);
        }
        Ok(())
    }

    /// Decode the payloads currently present in `set`
    pub fn decode_set(&self, set: &DistributionSet) -> std::result::Result<Bytes, ReconstructionError> {
        self.decode(set.fragments().iter().filter_map(|f| f.payload()))
    }

    fn accepts(&self, envelope: &ShareEnvelope) -> bool {
        let variant_matches = matches!(
            (self, &envelope.body),
            (Self::Mirror(_), ShareBody::Mirror { .. })
                | (Self::Threshold(_), ShareBody::Threshold { .. })
        );
        variant_matches
            && envelope.header.threshold as usize == self.threshold()
            && envelope.header.index < envelope.header.total
    }
}

pub(crate) fn check_parameters(threshold: usize, total: usize) -> Result<()> {
    if threshold == 0 || threshold > total || total > 255 {
        return Err(TesseraError::Configuration(format!(
            "invalid sharing parameters: need 1 <= K ({threshold}) <= N ({total}) <= 255"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub(crate) struct ShareHeader {
    pub set_id: [u8; 16],
    pub index: u8,
    pub total: u8,
    pub threshold: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum ShareBody {
    Mirror {
        digest: crate::crypto::Digest,
        data: Vec<u8>,
    },
    Threshold {
        nonce: [u8; crate::crypto::NONCE_SIZE],
        ciphertext_len: u64,
        digest: crate::crypto::Digest,
        key_share: Vec<u8>,
        shard: Vec<u8>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ShareEnvelope {
    pub header: ShareHeader,
    pub body: ShareBody,
}

impl ShareEnvelope {
    /// Everything two shares of the same encoding must agree on
    fn group_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(64);
        key.extend_from_slice(&self.header.set_id);
        key.push(self.header.total);
        key.push(self.header.threshold);
        match &self.body {
            ShareBody::Mirror { digest, .. } => key.extend_from_slice(digest.as_bytes()),
            ShareBody::Threshold {
                nonce,
                ciphertext_len,
                digest,
                ..
            } => {
                key.extend_from_slice(nonce);
                key.extend_from_slice(&ciphertext_len.to_be_bytes());
                key.extend_from_slice(digest.as_bytes());
            }
        }
        key
    }
}

/// Partition shares into consistent groups, largest first
///
/// Within a group each share index appears once (first occurrence wins) and
/// shares are sorted by index. Ties between equally large groups break on
/// the group key so the outcome never depends on input order.
fn group_shares(shares: Vec<ShareEnvelope>) -> Vec<Vec<ShareEnvelope>> {
    let mut groups: BTreeMap<Vec<u8>, BTreeMap<u8, ShareEnvelope>> = BTreeMap::new();
    for share in shares {
        groups
            .entry(share.group_key())
            .or_default()
            .entry(share.header.index)
            .or_insert(share);
    }

    let mut ordered: Vec<Vec<ShareEnvelope>> = groups
        .into_values()
        .map(|members| members.into_values().collect())
        .collect();
    // stable sort keeps key order among equal sizes
    ordered.sort_by(|a, b| b.len().cmp(&a.len()));
    ordered
}

/// Lexicographic K-combinations of `0..n`, capped at `limit`
pub(crate) fn combinations(n: usize, k: usize, limit: usize) -> Vec<Vec<usize>> {
    let mut result = Vec::new();
    if k == 0 || k > n {
        return result;
    }
    let mut current: Vec<usize> = (0..k).collect();
    loop {
        result.push(current.clone());
        if result.len() >= limit {
            return result;
        }
        // find rightmost position that can still advance
        let mut i = k;
        while i > 0 && current[i - 1] == n - k + (i - 1) {
            i -= 1;
        }
        if i == 0 {
            return result;
        }
        current[i - 1] += 1;
        for j in i..k {
            current[j] = current[j - 1] + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::DistributionSet;

    fn codecs(threshold: usize) -> Vec<SecretSharing> {
        vec![
            SecretSharing::new(CodecKind::Mirror, threshold).unwrap(),
            SecretSharing::new(CodecKind::Threshold, threshold).unwrap(),
        ]
    }

    #[test]
    fn test_combinations() {
        let all = combinations(4, 2, usize::MAX);
        assert_eq!(
            all,
            vec![
                vec![0, 1],
                vec![0, 2],
                vec![0, 3],
                vec![1, 2],
                vec![1, 3],
                vec![2, 3]
            ]
        );
        assert_eq!(combinations(5, 3, 4).len(), 4);
        assert!(combinations(2, 3, 10).is_empty());
    }

    #[test]
    fn test_every_k_subset_decodes() {
        let blob = b"any three of four shares rebuild this".to_vec();
        for codec in codecs(3) {
            let shares = codec.encode(&blob, 4).unwrap();
            for subset in combinations(4, 3, usize::MAX) {
                let picked: Vec<&Bytes> = subset.iter().map(|&i| &shares[i]).collect();
                let decoded = codec.decode(picked).unwrap();
                assert_eq!(decoded.as_ref(), blob.as_slice(), "{:?}", codec.kind());
            }
        }
    }

    #[test]
    fn test_below_threshold_fails() {
        for codec in codecs(3) {
            let shares = codec.encode(b"secret", 4).unwrap();
            let result = codec.decode(shares.iter().take(2));
            assert_eq!(
                result,
                Err(ReconstructionError::InsufficientFragments {
                    available: 2,
                    required: 3
                })
            );
        }
    }

    #[test]
    fn test_mixed_sets_are_inconsistent() {
        for codec in codecs(3) {
            let first = codec.encode(b"first blob", 4).unwrap();
            let second = codec.encode(b"second blob", 4).unwrap();
            let mixed = vec![&first[0], &first[1], &second[2], &second[3]];
            assert_eq!(
                codec.decode(mixed),
                Err(ReconstructionError::InconsistentFragments)
            );
        }
    }

    #[test]
    fn test_garbage_shares_are_ignored() {
        for codec in codecs(2) {
            let shares = codec.encode(b"payload", 3).unwrap();
            let junk = Bytes::from_static(b"not a share");
            let input = vec![&junk, &shares[2], &shares[0]];
            assert_eq!(codec.decode(input).unwrap().as_ref(), b"payload");
        }
    }

    #[test]
    fn test_codec_variants_do_not_cross_decode() {
        let mirror = SecretSharing::new(CodecKind::Mirror, 2).unwrap();
        let threshold = SecretSharing::new(CodecKind::Threshold, 2).unwrap();
        let shares = mirror.encode(b"mirror data", 3).unwrap();
        assert!(matches!(
            threshold.decode(&shares),
            Err(ReconstructionError::InsufficientFragments { available: 0, .. })
        ));
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(SecretSharing::new(CodecKind::Threshold, 0).is_err());
        let codec = SecretSharing::new(CodecKind::Threshold, 3).unwrap();
        assert!(matches!(
            codec.encode(b"x", 2),
            Err(TesseraError::Configuration(_))
        ));
        assert!(codec.encode(b"x", 256).is_err());
    }

    #[test]
    fn test_encode_into_distribution_set() {
        let codec = SecretSharing::new(CodecKind::Threshold, 3).unwrap();
        let mut set = DistributionSet::with_random_ids(["n0", "n1", "n2", "n3"]).unwrap();
        codec.encode_into(b"directory bytes", &mut set).unwrap();
        assert_eq!(set.payload_count(), 4);

        set.fragments_mut()[1].clear_payload();
        assert_eq!(codec.decode_set(&set).unwrap().as_ref(), b"directory bytes");

        set.fragments_mut()[2].clear_payload();
        assert!(codec.decode_set(&set).is_err());
    }

    #[test]
    fn test_empty_blob() {
        for codec in codecs(2) {
            let shares = codec.encode(b"", 3).unwrap();
            assert!(codec.decode(&shares[1..]).unwrap().is_empty());
        }
    }
}
