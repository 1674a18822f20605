//! Reed-Solomon erasure coding
//!
//! Splits a byte string into `data_shards` equally sized shards plus
//! `parity_shards` parity shards; any `data_shards` of the total rebuild the
//! input. With zero parity shards the coder degenerates to a plain split.

use crate::error::{Result, TesseraError};
use bytes::Bytes;
use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};

/// Erasure coding configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureConfig {
    /// Number of data shards (k)
    pub data_shards: usize,
    /// Number of parity shards (n - k)
    pub parity_shards: usize,
}

impl ErasureConfig {
    /// Create a new erasure config
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        if data_shards == 0 {
            return Err(TesseraError::Configuration(
                "data_shards must be > 0".to_string(),
            ));
        }
        if data_shards + parity_shards > 255 {
            return Err(TesseraError::Configuration(format!(
                "at most 255 shards supported, got {}",
                data_shards + parity_shards
            )));
        }
        Ok(Self {
            data_shards,
            parity_shards,
        })
    }

    /// Total number of shards
    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Maximum number of lost shards that can be tolerated
    pub fn max_failures(&self) -> usize {
        self.parity_shards
    }
}

/// Reed-Solomon encoder/decoder
pub struct ErasureEncoder {
    config: ErasureConfig,
    encoder: Option<ReedSolomon>,
}

impl ErasureEncoder {
    pub fn with_config(config: ErasureConfig) -> Result<Self> {
        let encoder = if config.parity_shards == 0 {
            None
        } else {
            Some(ReedSolomon::new(config.data_shards, config.parity_shards)?)
        };
        Ok(Self { config, encoder })
    }

    pub fn config(&self) -> &ErasureConfig {
        &self.config
    }

    /// Encode data into `total_shards` shards (data first, then parity)
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Bytes>> {
        let shard_size = self.shard_size(data.len());

        // Pad data to be evenly divisible by data_shards
        let mut padded = data.to_vec();
        padded.resize(shard_size * self.config.data_shards, 0);

        let mut shards: Vec<Vec<u8>> = padded.chunks(shard_size).map(|c| c.to_vec()).collect();

        if let Some(encoder) = &self.encoder {
            for _ in 0..self.config.parity_shards {
                shards.push(vec![0u8; shard_size]);
            }
            encoder.encode(&mut shards)?;
        }

        Ok(shards.into_iter().map(Bytes::from).collect())
    }

    /// Decode shards back into the original data
    ///
    /// `shards` must have exactly `total_shards` entries; missing shards are
    /// `None`. At least `data_shards` must be present and equally sized.
    pub fn decode(&self, shards: &[Option<Bytes>], original_size: usize) -> Result<Bytes> {
        let total = self.config.total_shards();
        if shards.len() != total {
            return Err(TesseraError::ErasureCoding(format!(
                "expected {} shard slots, got {}",
                total,
                shards.len()
            )));
        }

        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.config.data_shards {
            return Err(TesseraError::ErasureCoding(format!(
                "have {} shards, need {}",
                available, self.config.data_shards
            )));
        }

        let mut slots: Vec<Option<Vec<u8>>> = shards
            .iter()
            .map(|opt| opt.as_ref().map(|s| s.to_vec()))
            .collect();

        if let Some(encoder) = &self.encoder {
            encoder.reconstruct_data(&mut slots)?;
        }

        let mut result = Vec::with_capacity(original_size);
        for slot in slots.iter().take(self.config.data_shards) {
            match slot {
                Some(shard) => result.extend_from_slice(shard),
                None => {
                    return Err(TesseraError::ErasureCoding(
                        "data shard missing after reconstruction".to_string(),
                    ))
                }
            }
        }

        if result.len() < original_size {
            return Err(TesseraError::ErasureCoding(format!(
                "reconstructed {} bytes, expected {}",
                result.len(),
                original_size
            )));
        }
        result.truncate(original_size);
        Ok(Bytes::from(result))
    }

    /// Shard size for a given input length; never zero so empty inputs still
    /// produce well-formed shards
    fn shard_size(&self, data_size: usize) -> usize {
        data_size.div_ceil(self.config.data_shards).max(1)
    }
}
