use super::shamir::{self, KeyShare};
use super::{combinations, ShareBody, ShareEnvelope, MAX_RECONSTRUCTION_ATTEMPTS};
use crate::crypto::{decrypt, encrypt, Digest, EncryptedData, EncryptionKey, KEY_SIZE};
use crate::erasure::{ErasureConfig, ErasureEncoder};
use crate::error::{Result, TesseraError};
use bytes::Bytes;
use tracing::trace;

/// Computational K-of-N secret sharing (encrypt, erasure code, share the key)
#[derive(Debug, Clone)]
pub struct ThresholdCodec {
    threshold: usize,
}

impl ThresholdCodec {
    pub fn new(threshold: usize) -> Result<Self> {
        if threshold == 0 || threshold > 255 {
            return Err(TesseraError::Configuration(format!(
                "sharing threshold must be within 1..=255, got {threshold}"
            )));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    fn erasure(&self, total: usize) -> Result<ErasureEncoder> {
        ErasureEncoder::with_config(ErasureConfig::new(
            self.threshold,
            total - self.threshold,
        )?)
    }

    pub(super) fn encode_bodies(&self, blob: &[u8], total: usize) -> Result<Vec<ShareBody>> {
        let key = EncryptionKey::generate();
        let encrypted = encrypt(blob, &key)?;
        let digest = Digest::compute(&encrypted.ciphertext);

        let shards = self.erasure(total)?.encode(&encrypted.ciphertext)?;
        let key_shares = shamir::split(key.as_bytes(), self.threshold, total);

        Ok(shards
            .into_iter()
            .zip(key_shares)
            .map(|(shard, key_share)| ShareBody::Threshold {
                nonce: encrypted.nonce,
                ciphertext_len: encrypted.ciphertext.len() as u64,
                digest,
                key_share: key_share.y,
                shard: shard.to_vec(),
            })
            .collect())
    }

    /// Try K-subsets of a consistent group until one verifies
    pub(super) fn decode_group(&self, group: &[ShareEnvelope]) -> Option<Bytes> {
        let first = group.first()?;
        let total = first.header.total as usize;
        let (nonce, ciphertext_len, digest) = match &first.body {
            ShareBody::Threshold {
                nonce,
                ciphertext_len,
                digest,
                ..
            } => (*nonce, *ciphertext_len as usize, *digest),
            ShareBody::Mirror { .. } => return None,
        };
        if total < self.threshold {
            return None;
        }
        let erasure = self.erasure(total).ok()?;

        for subset in combinations(group.len(), self.threshold, MAX_RECONSTRUCTION_ATTEMPTS) {
            let mut slots: Vec<Option<Bytes>> = vec![None; total];
            let mut key_shares = Vec::with_capacity(self.threshold);
            for &member in &subset {
                let share = &group[member];
                if let ShareBody::Threshold {
                    key_share, shard, ..
                } = &share.body
                {
                    slots[share.header.index as usize] = Some(Bytes::copy_from_slice(shard));
                    key_shares.push(KeyShare {
                        x: share.header.index + 1,
                        y: key_share.clone(),
                    });
                }
            }

            let ciphertext = match erasure.decode(&slots, ciphertext_len) {
                Ok(ciphertext) if digest.verify(&ciphertext) => ciphertext,
                _ => {
                    trace!(?subset, "Ciphertext did not verify for share subset");
                    continue;
                }
            };

            let key_bytes = match shamir::combine(&key_shares) {
                Some(bytes) if bytes.len() == KEY_SIZE => bytes,
                _ => continue,
            };
            let mut key_array = [0u8; KEY_SIZE];
            key_array.copy_from_slice(&key_bytes);
            let key = EncryptionKey::from_bytes(key_array);

            let encrypted = EncryptedData {
                nonce,
                ciphertext: ciphertext.to_vec(),
            };
            if let Some(plaintext) = decrypt(&encrypted, &key) {
                return Some(Bytes::from(plaintext));
            }
            trace!(?subset, "Key shares did not authenticate for share subset");
        }
        None
    }
}
