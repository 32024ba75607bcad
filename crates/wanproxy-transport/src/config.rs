//! Pipe pair configuration

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::protocol::{MAX_ASK_HASHES, MAX_FRAME_LENGTH};

/// Tunables of one [`crate::PipePair`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipePairConfig {
    /// Plaintext bytes encoded into each FRAME
    pub frame_plaintext_len: usize,
    /// Hashes per ASK message
    pub max_ask_hashes: usize,
}

impl Default for PipePairConfig {
    fn default() -> Self {
        Self {
            frame_plaintext_len: 32 * 1024,
            max_ask_hashes: MAX_ASK_HASHES,
        }
    }
}

impl PipePairConfig {
    /// Reject values the wire format cannot carry.
    ///
    /// Escaping can double a frame, so the plaintext per frame is capped at
    /// half of [`MAX_FRAME_LENGTH`].
    pub fn validate(&self) -> Result<()> {
        let max_plaintext = MAX_FRAME_LENGTH as usize / 2;
        if self.frame_plaintext_len == 0 || self.frame_plaintext_len > max_plaintext {
            return Err(TransportError::InvalidConfig {
                reason: format!(
                    "frame_plaintext_len {} outside 1..={}",
                    self.frame_plaintext_len, max_plaintext
                ),
            });
        }
        if self.max_ask_hashes == 0 || self.max_ask_hashes > MAX_ASK_HASHES {
            return Err(TransportError::InvalidConfig {
                reason: format!(
                    "max_ask_hashes {} outside 1..={}",
                    self.max_ask_hashes, MAX_ASK_HASHES
                ),
            });
        }
        Ok(())
    }
}
