//! Block cipher models used to predict intermediate values.
use serde::{Deserialize, Serialize};

use crate::Error;

/// Direction of the cipher operation observed in the traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Blocks are plaintexts, rounds are counted from the first one.
    Encrypt,
    /// Blocks are ciphertexts, rounds are counted from the last one.
    Decrypt,
}

/// Stage of a round of a byte-oriented substitution-permutation cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Start,
    AddRoundKey,
    SubBytes,
    ShiftRows,
    MixColumns,
    InvAddRoundKey,
    InvSubBytes,
    InvShiftRows,
    InvMixColumns,
}

impl Stage {
    /// Return the stage undoing this one.
    pub fn inverse(self) -> Self {
        match self {
            Stage::Start => Stage::Start,
            Stage::AddRoundKey => Stage::InvAddRoundKey,
            Stage::SubBytes => Stage::InvSubBytes,
            Stage::ShiftRows => Stage::InvShiftRows,
            Stage::MixColumns => Stage::InvMixColumns,
            Stage::InvAddRoundKey => Stage::AddRoundKey,
            Stage::InvSubBytes => Stage::SubBytes,
            Stage::InvShiftRows => Stage::ShiftRows,
            Stage::InvMixColumns => Stage::MixColumns,
        }
    }

    /// Returns `true` for the stages of the inverse cipher.
    pub fn is_inverse(self) -> bool {
        matches!(
            self,
            Stage::InvAddRoundKey | Stage::InvSubBytes | Stage::InvShiftRows | Stage::InvMixColumns
        )
    }
}

/// Cipher state recorded after a given stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundState {
    /// Round index in execution order, 0 being the initial key mixing.
    pub round: usize,
    pub stage: Stage,
    pub state: Vec<u8>,
}

/// Intermediate value targeted by an attack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub direction: Direction,
    /// Round of the substitution, starting at 1 on the side given by `direction`.
    pub round: usize,
    /// State byte position.
    pub byte: usize,
}

impl Target {
    pub fn new(direction: Direction, round: usize, byte: usize) -> Self {
        Self {
            direction,
            round,
            byte,
        }
    }

    /// Output of the first round substitution, computed from plaintexts.
    pub fn first_round(byte: usize) -> Self {
        Self::new(Direction::Encrypt, 1, byte)
    }

    /// Input of the last round substitution, computed from ciphertexts.
    pub fn last_round(byte: usize) -> Self {
        Self::new(Direction::Decrypt, 1, byte)
    }

    /// Return the same target with another byte position.
    pub fn with_byte(self, byte: usize) -> Self {
        Self { byte, ..self }
    }
}

/// A software model of a byte-oriented block cipher.
///
/// Implementations own their substitution tables as immutable statics, so a model can be
/// shared by reference across hypothesis workers.
pub trait CipherModel: Sync {
    /// Block size in bytes.
    fn block_size(&self) -> usize;

    /// Cipher key size in bytes.
    fn key_size(&self) -> usize;

    /// Number of rounds.
    fn rounds(&self) -> usize;

    /// Return every intermediate state of the encryption of `block`.
    fn encrypt_states(&self, block: &[u8], key: &[u8]) -> Result<Vec<RoundState>, Error>;

    /// Return every intermediate state of the decryption of `block`.
    fn decrypt_states(&self, block: &[u8], key: &[u8]) -> Result<Vec<RoundState>, Error>;

    /// Replay the rounds preceding `target` and return the state byte the targeted key byte is
    /// mixed with. It does not depend on the hypothesis.
    ///
    /// `known_key` is the cipher key used to replay the rounds preceding the target. It may be
    /// empty when the first round on the side of `target.direction` is attacked.
    fn target_byte(&self, block: &[u8], known_key: &[u8], target: Target) -> Result<u8, Error>;

    /// Mix a byte returned by [`CipherModel::target_byte`] with `hypothesis` and apply the
    /// targeted substitution.
    fn substitute(&self, byte: u8, hypothesis: u8, target: Target) -> u8;

    /// Compute the intermediate byte selected by `target` when the targeted key byte equals
    /// `hypothesis`.
    fn intermediate_value(
        &self,
        block: &[u8],
        known_key: &[u8],
        hypothesis: u8,
        target: Target,
    ) -> Result<u8, Error> {
        let byte = self.target_byte(block, known_key, target)?;
        Ok(self.substitute(byte, hypothesis, target))
    }

    /// Recover the cipher key from the key bytes hypothesized for every position of a round.
    ///
    /// `round_key` holds, for each byte position, the hypothesis [`CipherModel::intermediate_value`]
    /// expects for the round `round` on the side of `direction`.
    fn recover_key(
        &self,
        round_key: &[u8],
        direction: Direction,
        round: usize,
    ) -> Result<Vec<u8>, Error>;

    fn encrypt(&self, block: &[u8], key: &[u8]) -> Result<Vec<u8>, Error> {
        let mut states = self.encrypt_states(block, key)?;
        Ok(states.pop().map(|s| s.state).unwrap_or_default())
    }

    fn decrypt(&self, block: &[u8], key: &[u8]) -> Result<Vec<u8>, Error> {
        let mut states = self.decrypt_states(block, key)?;
        Ok(states.pop().map(|s| s.state).unwrap_or_default())
    }

    /// Check that a target lies within the cipher.
    fn check_target(&self, target: Target) -> Result<(), Error> {
        if target.round == 0 || target.round > self.rounds() || target.byte >= self.block_size() {
            return Err(Error::InvalidTarget {
                round: target.round,
                byte: target.byte,
            });
        }

        Ok(())
    }

    /// Check the length of a block.
    fn check_block(&self, block: &[u8]) -> Result<(), Error> {
        if block.len() != self.block_size() {
            return Err(Error::InvalidBlockLength {
                expected: self.block_size(),
                actual: block.len(),
            });
        }

        Ok(())
    }

    /// Check the length of a key. Empty keys are accepted when `optional` is set.
    fn check_key(&self, key: &[u8], optional: bool) -> Result<(), Error> {
        if key.len() != self.key_size() && !(optional && key.is_empty()) {
            return Err(Error::InvalidKeyLength {
                expected: self.key_size(),
                actual: key.len(),
            });
        }

        Ok(())
    }
}
