//! AES-128 round functions and the corresponding [`CipherModel`].
//!
//! The state is stored in the FIPS-197 column-major byte order: byte `i` of a block lies at row
//! `i % 4` and column `i / 4`.
use crate::{
    Error,
    cipher::{CipherModel, Direction, RoundState, Stage, Target},
};

pub const BLOCK_SIZE: usize = 16;
pub const KEY_SIZE: usize = 16;
pub const ROUNDS: usize = 10;

pub type State = [u8; BLOCK_SIZE];
pub type RoundKeys = [[u8; BLOCK_SIZE]; ROUNDS + 1];

#[rustfmt::skip]
static SBOX: [u8; 256] = [
    0x63, 0x7c, 0x77, 0x7b, 0xf2, 0x6b, 0x6f, 0xc5, 0x30, 0x01, 0x67, 0x2b, 0xfe, 0xd7, 0xab, 0x76,
    0xca, 0x82, 0xc9, 0x7d, 0xfa, 0x59, 0x47, 0xf0, 0xad, 0xd4, 0xa2, 0xaf, 0x9c, 0xa4, 0x72, 0xc0,
    0xb7, 0xfd, 0x93, 0x26, 0x36, 0x3f, 0xf7, 0xcc, 0x34, 0xa5, 0xe5, 0xf1, 0x71, 0xd8, 0x31, 0x15,
    0x04, 0xc7, 0x23, 0xc3, 0x18, 0x96, 0x05, 0x9a, 0x07, 0x12, 0x80, 0xe2, 0xeb, 0x27, 0xb2, 0x75,
    0x09, 0x83, 0x2c, 0x1a, 0x1b, 0x6e, 0x5a, 0xa0, 0x52, 0x3b, 0xd6, 0xb3, 0x29, 0xe3, 0x2f, 0x84,
    0x53, 0xd1, 0x00, 0xed, 0x20, 0xfc, 0xb1, 0x5b, 0x6a, 0xcb, 0xbe, 0x39, 0x4a, 0x4c, 0x58, 0xcf,
    0xd0, 0xef, 0xaa, 0xfb, 0x43, 0x4d, 0x33, 0x85, 0x45, 0xf9, 0x02, 0x7f, 0x50, 0x3c, 0x9f, 0xa8,
    0x51, 0xa3, 0x40, 0x8f, 0x92, 0x9d, 0x38, 0xf5, 0xbc, 0xb6, 0xda, 0x21, 0x10, 0xff, 0xf3, 0xd2,
    0xcd, 0x0c, 0x13, 0xec, 0x5f, 0x97, 0x44, 0x17, 0xc4, 0xa7, 0x7e, 0x3d, 0x64, 0x5d, 0x19, 0x73,
    0x60, 0x81, 0x4f, 0xdc, 0x22, 0x2a, 0x90, 0x88, 0x46, 0xee, 0xb8, 0x14, 0xde, 0x5e, 0x0b, 0xdb,
    0xe0, 0x32, 0x3a, 0x0a, 0x49, 0x06, 0x24, 0x5c, 0xc2, 0xd3, 0xac, 0x62, 0x91, 0x95, 0xe4, 0x79,
    0xe7, 0xc8, 0x37, 0x6d, 0x8d, 0xd5, 0x4e, 0xa9, 0x6c, 0x56, 0xf4, 0xea, 0x65, 0x7a, 0xae, 0x08,
    0xba, 0x78, 0x25, 0x2e, 0x1c, 0xa6, 0xb4, 0xc6, 0xe8, 0xdd, 0x74, 0x1f, 0x4b, 0xbd, 0x8b, 0x8a,
    0x70, 0x3e, 0xb5, 0x66, 0x48, 0x03, 0xf6, 0x0e, 0x61, 0x35, 0x57, 0xb9, 0x86, 0xc1, 0x1d, 0x9e,
    0xe1, 0xf8, 0x98, 0x11, 0x69, 0xd9, 0x8e, 0x94, 0x9b, 0x1e, 0x87, 0xe9, 0xce, 0x55, 0x28, 0xdf,
    0x8c, 0xa1, 0x89, 0x0d, 0xbf, 0xe6, 0x42, 0x68, 0x41, 0x99, 0x2d, 0x0f, 0xb0, 0x54, 0xbb, 0x16,
];

#[rustfmt::skip]
static INV_SBOX: [u8; 256] = [
    0x52, 0x09, 0x6a, 0xd5, 0x30, 0x36, 0xa5, 0x38, 0xbf, 0x40, 0xa3, 0x9e, 0x81, 0xf3, 0xd7, 0xfb,
    0x7c, 0xe3, 0x39, 0x82, 0x9b, 0x2f, 0xff, 0x87, 0x34, 0x8e, 0x43, 0x44, 0xc4, 0xde, 0xe9, 0xcb,
    0x54, 0x7b, 0x94, 0x32, 0xa6, 0xc2, 0x23, 0x3d, 0xee, 0x4c, 0x95, 0x0b, 0x42, 0xfa, 0xc3, 0x4e,
    0x08, 0x2e, 0xa1, 0x66, 0x28, 0xd9, 0x24, 0xb2, 0x76, 0x5b, 0xa2, 0x49, 0x6d, 0x8b, 0xd1, 0x25,
    0x72, 0xf8, 0xf6, 0x64, 0x86, 0x68, 0x98, 0x16, 0xd4, 0xa4, 0x5c, 0xcc, 0x5d, 0x65, 0xb6, 0x92,
    0x6c, 0x70, 0x48, 0x50, 0xfd, 0xed, 0xb9, 0xda, 0x5e, 0x15, 0x46, 0x57, 0xa7, 0x8d, 0x9d, 0x84,
    0x90, 0xd8, 0xab, 0x00, 0x8c, 0xbc, 0xd3, 0x0a, 0xf7, 0xe4, 0x58, 0x05, 0xb8, 0xb3, 0x45, 0x06,
    0xd0, 0x2c, 0x1e, 0x8f, 0xca, 0x3f, 0x0f, 0x02, 0xc1, 0xaf, 0xbd, 0x03, 0x01, 0x13, 0x8a, 0x6b,
    0x3a, 0x91, 0x11, 0x41, 0x4f, 0x67, 0xdc, 0xea, 0x97, 0xf2, 0xcf, 0xce, 0xf0, 0xb4, 0xe6, 0x73,
    0x96, 0xac, 0x74, 0x22, 0xe7, 0xad, 0x35, 0x85, 0xe2, 0xf9, 0x37, 0xe8, 0x1c, 0x75, 0xdf, 0x6e,
    0x47, 0xf1, 0x1a, 0x71, 0x1d, 0x29, 0xc5, 0x89, 0x6f, 0xb7, 0x62, 0x0e, 0xaa, 0x18, 0xbe, 0x1b,
    0xfc, 0x56, 0x3e, 0x4b, 0xc6, 0xd2, 0x79, 0x20, 0x9a, 0xdb, 0xc0, 0xfe, 0x78, 0xcd, 0x5a, 0xf4,
    0x1f, 0xdd, 0xa8, 0x33, 0x88, 0x07, 0xc7, 0x31, 0xb1, 0x12, 0x10, 0x59, 0x27, 0x80, 0xec, 0x5f,
    0x60, 0x51, 0x7f, 0xa9, 0x19, 0xb5, 0x4a, 0x0d, 0x2d, 0xe5, 0x7a, 0x9f, 0x93, 0xc9, 0x9c, 0xef,
    0xa0, 0xe0, 0x3b, 0x4d, 0xae, 0x2a, 0xf5, 0xb0, 0xc8, 0xeb, 0xbb, 0x3c, 0x83, 0x53, 0x99, 0x61,
    0x17, 0x2b, 0x04, 0x7e, 0xba, 0x77, 0xd6, 0x26, 0xe1, 0x69, 0x14, 0x63, 0x55, 0x21, 0x0c, 0x7d,
];

static RCON: [u8; ROUNDS] = [0x01, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x80, 0x1b, 0x36];

pub fn sbox(x: u8) -> u8 {
    SBOX[x as usize]
}

pub fn inv_sbox(x: u8) -> u8 {
    INV_SBOX[x as usize]
}

/// Multiplication by `x` in GF(2^8).
fn xtime(x: u8) -> u8 {
    (x << 1) ^ (((x >> 7) & 1) * 0x1b)
}

/// Multiplication in GF(2^8).
fn gmul(mut a: u8, mut b: u8) -> u8 {
    let mut p = 0;
    while b != 0 {
        if b & 1 == 1 {
            p ^= a;
        }
        a = xtime(a);
        b >>= 1;
    }
    p
}

fn key_schedule_core(word: [u8; 4], round: usize) -> [u8; 4] {
    [
        sbox(word[1]) ^ RCON[round - 1],
        sbox(word[2]),
        sbox(word[3]),
        sbox(word[0]),
    ]
}

/// Compute the 11 round keys of the given cipher key.
pub fn expand_key(key: &[u8; KEY_SIZE], round_keys: &mut RoundKeys) {
    round_keys[0] = *key;
    for round in 1..=ROUNDS {
        let prev = round_keys[round - 1];
        let mut next = [0u8; BLOCK_SIZE];
        let t = key_schedule_core([prev[12], prev[13], prev[14], prev[15]], round);
        for i in 0..4 {
            next[i] = prev[i] ^ t[i];
        }
        for i in 4..BLOCK_SIZE {
            next[i] = prev[i] ^ next[i - 4];
        }
        round_keys[round] = next;
    }
}

/// Recover the cipher key from the round key of index `round`.
///
/// # Panics
/// Panics if `round > ROUNDS`.
pub fn invert_key_expansion(round_key: &[u8; BLOCK_SIZE], round: usize) -> [u8; KEY_SIZE] {
    assert!(round <= ROUNDS);

    let mut key = *round_key;
    for r in (1..=round).rev() {
        let mut prev = [0u8; BLOCK_SIZE];
        for i in (4..BLOCK_SIZE).rev() {
            prev[i] = key[i] ^ key[i - 4];
        }
        let t = key_schedule_core([prev[12], prev[13], prev[14], prev[15]], r);
        for i in 0..4 {
            prev[i] = key[i] ^ t[i];
        }
        key = prev;
    }
    key
}

pub fn add_round_key(state: &mut State, round_key: &[u8; BLOCK_SIZE]) {
    for (s, k) in state.iter_mut().zip(round_key) {
        *s ^= k;
    }
}

pub fn sub_bytes(state: &mut State) {
    for s in state.iter_mut() {
        *s = sbox(*s);
    }
}

pub fn inv_sub_bytes(state: &mut State) {
    for s in state.iter_mut() {
        *s = inv_sbox(*s);
    }
}

pub fn shift_rows(state: &mut State) {
    let old = *state;
    for row in 1..4 {
        for col in 0..4 {
            state[row + 4 * col] = old[row + 4 * ((col + row) % 4)];
        }
    }
}

pub fn inv_shift_rows(state: &mut State) {
    let old = *state;
    for row in 1..4 {
        for col in 0..4 {
            state[row + 4 * ((col + row) % 4)] = old[row + 4 * col];
        }
    }
}

pub fn mix_columns(state: &mut State) {
    for col in state.chunks_exact_mut(4) {
        let [a0, a1, a2, a3] = [col[0], col[1], col[2], col[3]];
        let all = a0 ^ a1 ^ a2 ^ a3;
        col[0] = a0 ^ all ^ xtime(a0 ^ a1);
        col[1] = a1 ^ all ^ xtime(a1 ^ a2);
        col[2] = a2 ^ all ^ xtime(a2 ^ a3);
        col[3] = a3 ^ all ^ xtime(a3 ^ a0);
    }
}

pub fn inv_mix_columns(state: &mut State) {
    for col in state.chunks_exact_mut(4) {
        let [a0, a1, a2, a3] = [col[0], col[1], col[2], col[3]];
        col[0] = gmul(a0, 14) ^ gmul(a1, 11) ^ gmul(a2, 13) ^ gmul(a3, 9);
        col[1] = gmul(a0, 9) ^ gmul(a1, 14) ^ gmul(a2, 11) ^ gmul(a3, 13);
        col[2] = gmul(a0, 13) ^ gmul(a1, 9) ^ gmul(a2, 14) ^ gmul(a3, 11);
        col[3] = gmul(a0, 11) ^ gmul(a1, 13) ^ gmul(a2, 9) ^ gmul(a3, 14);
    }
}

/// Apply a single stage to the state. `round_key` is only used by the key mixing stages.
pub fn apply_stage(state: &mut State, stage: Stage, round_key: &[u8; BLOCK_SIZE]) {
    match stage {
        Stage::Start => {}
        Stage::AddRoundKey | Stage::InvAddRoundKey => add_round_key(state, round_key),
        Stage::SubBytes => sub_bytes(state),
        Stage::ShiftRows => shift_rows(state),
        Stage::MixColumns => mix_columns(state),
        Stage::InvSubBytes => inv_sub_bytes(state),
        Stage::InvShiftRows => inv_shift_rows(state),
        Stage::InvMixColumns => inv_mix_columns(state),
    }
}

/// Stages of an encryption round.
fn encryption_round(round: usize) -> &'static [Stage] {
    match round {
        0 => &[Stage::Start, Stage::AddRoundKey],
        ROUNDS => &[Stage::SubBytes, Stage::ShiftRows, Stage::AddRoundKey],
        _ => &[
            Stage::SubBytes,
            Stage::ShiftRows,
            Stage::MixColumns,
            Stage::AddRoundKey,
        ],
    }
}

/// Stages of a decryption round, in the order of the FIPS-197 inverse cipher.
fn decryption_round(round: usize) -> &'static [Stage] {
    match round {
        0 => &[Stage::Start, Stage::InvAddRoundKey],
        ROUNDS => &[Stage::InvShiftRows, Stage::InvSubBytes, Stage::InvAddRoundKey],
        _ => &[
            Stage::InvShiftRows,
            Stage::InvSubBytes,
            Stage::InvAddRoundKey,
            Stage::InvMixColumns,
        ],
    }
}

fn to_state(block: &[u8]) -> State {
    let mut state = [0u8; BLOCK_SIZE];
    state.copy_from_slice(block);
    state
}

/// AES-128 cipher model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Aes128;

impl Aes128 {
    fn round_keys(&self, key: &[u8]) -> Result<RoundKeys, Error> {
        self.check_key(key, false)?;

        let mut round_keys = [[0u8; BLOCK_SIZE]; ROUNDS + 1];
        expand_key(&to_state(key), &mut round_keys);
        Ok(round_keys)
    }

    fn run(
        &self,
        block: &[u8],
        key: &[u8],
        round_stages: fn(usize) -> &'static [Stage],
        round_key_index: fn(usize) -> usize,
    ) -> Result<Vec<RoundState>, Error> {
        self.check_block(block)?;
        let round_keys = self.round_keys(key)?;

        let mut state = to_state(block);
        let mut states = Vec::new();
        for round in 0..=ROUNDS {
            for &stage in round_stages(round) {
                apply_stage(&mut state, stage, &round_keys[round_key_index(round)]);
                states.push(RoundState {
                    round,
                    stage,
                    state: state.to_vec(),
                });
            }
        }

        Ok(states)
    }
}

impl CipherModel for Aes128 {
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn key_size(&self) -> usize {
        KEY_SIZE
    }

    fn rounds(&self) -> usize {
        ROUNDS
    }

    fn encrypt_states(&self, block: &[u8], key: &[u8]) -> Result<Vec<RoundState>, Error> {
        self.run(block, key, encryption_round, |round| round)
    }

    fn decrypt_states(&self, block: &[u8], key: &[u8]) -> Result<Vec<RoundState>, Error> {
        self.run(block, key, decryption_round, |round| ROUNDS - round)
    }

    /// For [`Direction::Encrypt`], the byte is the AddRoundKey input of round `target.round - 1`
    /// and the hypothesis a byte of that round key.
    ///
    /// For [`Direction::Decrypt`], the byte is the state byte found at `target.byte` before
    /// InvShiftRows of the `target.round`-th inverse round. On the first inverse round the
    /// hypothesis is byte `target.byte` of the last round key. On later rounds InvMixColumns sits
    /// between the key mixing and the substitution, so the byte is taken after InvMixColumns and
    /// the hypothesis is the byte of `InvMixColumns(round key)` instead.
    fn target_byte(&self, block: &[u8], known_key: &[u8], target: Target) -> Result<u8, Error> {
        self.check_target(target)?;
        self.check_block(block)?;
        self.check_key(known_key, target.round == 1)?;

        let mut state = to_state(block);
        if target.round == 1 {
            return Ok(state[target.byte]);
        }

        let round_keys = self.round_keys(known_key)?;
        match target.direction {
            Direction::Encrypt => {
                for round in 1..target.round {
                    add_round_key(&mut state, &round_keys[round - 1]);
                    sub_bytes(&mut state);
                    shift_rows(&mut state);
                    mix_columns(&mut state);
                }
            }
            Direction::Decrypt => {
                for round in 1..target.round {
                    add_round_key(&mut state, &round_keys[ROUNDS + 1 - round]);
                    if round > 1 {
                        inv_mix_columns(&mut state);
                    }
                    inv_shift_rows(&mut state);
                    inv_sub_bytes(&mut state);
                }
                inv_mix_columns(&mut state);
            }
        }

        Ok(state[target.byte])
    }

    /// SubBytes for [`Direction::Encrypt`], InvSubBytes for [`Direction::Decrypt`].
    fn substitute(&self, byte: u8, hypothesis: u8, target: Target) -> u8 {
        match target.direction {
            Direction::Encrypt => sbox(byte ^ hypothesis),
            Direction::Decrypt => inv_sbox(byte ^ hypothesis),
        }
    }

    fn recover_key(
        &self,
        round_key: &[u8],
        direction: Direction,
        round: usize,
    ) -> Result<Vec<u8>, Error> {
        self.check_target(Target::new(direction, round, 0))?;
        self.check_block(round_key)?;

        let mut round_key = to_state(round_key);
        let index = match direction {
            Direction::Encrypt => round - 1,
            Direction::Decrypt => {
                if round > 1 {
                    mix_columns(&mut round_key);
                }
                ROUNDS + 1 - round
            }
        };

        Ok(invert_key_expansion(&round_key, index).to_vec())
    }
}
