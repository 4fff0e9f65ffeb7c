/* Leakage hypotheses for AES key-byte attacks */

const SBOX: [u8; 256] = [
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

const INV_SBOX: [u8; 256] = invert(&SBOX);

/// Byte position each output byte of ShiftRows is taken from (column-major state).
const SHIFT_ROWS: [usize; 16] = [0, 5, 10, 15, 4, 9, 14, 3, 8, 13, 2, 7, 12, 1, 6, 11];

const fn invert(table: &[u8; 256]) -> [u8; 256] {
    let mut inv = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        inv[table[i] as usize] = i as u8;
        i += 1;
    }
    inv
}

pub fn sbox(value: u8) -> u8 {
    SBOX[value as usize]
}

pub fn inv_sbox(value: u8) -> u8 {
    INV_SBOX[value as usize]
}

/// Hamming weight
pub fn hw(value: usize) -> usize {
    value.count_ones() as usize
}

/// Whether a model consumes the per-trace known key block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRequirement {
    WithKnownKey,
    WithoutKnownKey,
}

/// Blocks handed to a leakage model for one trace.
///
/// Exactly one of `plaintext`/`ciphertext` is set, see
/// [`crate::config::select_inputs`]. `known_key` is only set for models that
/// declare [`KeyRequirement::WithKnownKey`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelInput<'a> {
    pub plaintext: Option<&'a [u8]>,
    pub ciphertext: Option<&'a [u8]>,
    pub known_key: Option<&'a [u8]>,
}

/// A deterministic, side-effect free leakage hypothesis.
///
/// `leakage` returns `None` when the inputs it needs are absent, which the
/// accumulator reports as a configuration error.
pub trait LeakageModel: Sync {
    fn key_requirement(&self) -> KeyRequirement {
        KeyRequirement::WithoutKnownKey
    }

    fn leakage(&self, input: &ModelInput<'_>, guess: u8, subkey: usize) -> Option<f64>;
}

impl<F> LeakageModel for F
where
    F: Fn(&ModelInput<'_>, u8, usize) -> Option<f64> + Sync,
{
    fn leakage(&self, input: &ModelInput<'_>, guess: u8, subkey: usize) -> Option<f64> {
        self(input, guess, subkey)
    }
}

/// HW(SBox(input ^ guess)), the first-round encryption model.
#[derive(Debug, Clone, Copy, Default)]
pub struct HwSboxOutput;

impl LeakageModel for HwSboxOutput {
    fn leakage(&self, input: &ModelInput<'_>, guess: u8, subkey: usize) -> Option<f64> {
        let byte = *input.plaintext?.get(subkey)?;
        Some(hw(sbox(byte ^ guess) as usize) as f64)
    }
}

/// HW(InvSBox(ciphertext ^ guess)), for last-round attacks on encryption or
/// first-round attacks on decryption.
#[derive(Debug, Clone, Copy, Default)]
pub struct HwInvSboxOutput;

impl LeakageModel for HwInvSboxOutput {
    fn leakage(&self, input: &ModelInput<'_>, guess: u8, subkey: usize) -> Option<f64> {
        let byte = *input.ciphertext?.get(subkey)?;
        Some(hw(inv_sbox(byte ^ guess) as usize) as f64)
    }
}

/// Hamming distance between the round-9 state byte and the ciphertext byte
/// that overwrites it in the last round.
#[derive(Debug, Clone, Copy, Default)]
pub struct HdLastRoundState;

impl LeakageModel for HdLastRoundState {
    fn leakage(&self, input: &ModelInput<'_>, guess: u8, subkey: usize) -> Option<f64> {
        let ciphertext = input.ciphertext?;
        let round9 = inv_sbox(*ciphertext.get(subkey)? ^ guess);
        let round10 = *ciphertext.get(*SHIFT_ROWS.get(subkey)?)?;
        Some(hw((round9 ^ round10) as usize) as f64)
    }
}

/// HW(SBox(input ^ tweak ^ guess)) where the tweak is the per-trace known key
/// byte mixed in ahead of the secret one.
#[derive(Debug, Clone, Copy, Default)]
pub struct HwTweakedSboxOutput;

impl LeakageModel for HwTweakedSboxOutput {
    fn key_requirement(&self) -> KeyRequirement {
        KeyRequirement::WithKnownKey
    }

    fn leakage(&self, input: &ModelInput<'_>, guess: u8, subkey: usize) -> Option<f64> {
        let byte = *input.plaintext?.get(subkey)?;
        let tweak = *input.known_key?.get(subkey)?;
        Some(hw(sbox(byte ^ tweak ^ guess) as usize) as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sbox_inverse() {
        for x in 0..=255u8 {
            assert_eq!(inv_sbox(sbox(x)), x);
        }
        assert_eq!(sbox(0x00), 0x63);
        assert_eq!(sbox(0x53), 0xed);
        assert_eq!(inv_sbox(0x63), 0x00);
    }

    #[test]
    fn test_hw() {
        assert_eq!(hw(0), 0);
        assert_eq!(hw(0xff), 8);
        assert_eq!(hw(0b1010_0001), 3);
    }

    #[test]
    fn test_models_need_their_slot() {
        let block = [0x10u8; 16];
        let first_round = ModelInput {
            plaintext: Some(&block),
            ..Default::default()
        };
        let last_round = ModelInput {
            ciphertext: Some(&block),
            ..Default::default()
        };
        assert_eq!(
            HwSboxOutput.leakage(&first_round, 0x43, 2),
            Some(hw(sbox(0x53) as usize) as f64)
        );
        assert_eq!(HwSboxOutput.leakage(&last_round, 0x43, 2), None);
        assert_eq!(HwSboxOutput.leakage(&first_round, 0x43, 16), None);
        assert_eq!(HwInvSboxOutput.leakage(&first_round, 0, 0), None);
        assert_eq!(
            HwInvSboxOutput.leakage(&last_round, 0x73, 0),
            Some(hw(inv_sbox(0x63) as usize) as f64)
        );
        // inv_sbox(0x10 ^ 0x73) = 0 and every ciphertext byte is 0x10
        assert_eq!(HdLastRoundState.leakage(&last_round, 0x73, 5), Some(1.0));
    }

    #[test]
    fn test_known_key_model() {
        assert_eq!(
            HwTweakedSboxOutput.key_requirement(),
            KeyRequirement::WithKnownKey
        );
        assert_eq!(HwSboxOutput.key_requirement(), KeyRequirement::WithoutKnownKey);
        let pt = [0x01u8; 16];
        let tweak = [0x02u8; 16];
        let without_key = ModelInput {
            plaintext: Some(&pt),
            ..Default::default()
        };
        assert_eq!(HwTweakedSboxOutput.leakage(&without_key, 0, 0), None);
        let with_key = ModelInput {
            known_key: Some(&tweak),
            ..without_key
        };
        assert_eq!(
            HwTweakedSboxOutput.leakage(&with_key, 0x04, 0),
            Some(hw(sbox(0x07) as usize) as f64)
        );
    }

    fn xor_model(input: &ModelInput<'_>, guess: u8, subkey: usize) -> Option<f64> {
        Some((input.plaintext?[subkey] ^ guess) as f64)
    }

    #[test]
    fn test_fn_model() {
        assert_eq!(xor_model.key_requirement(), KeyRequirement::WithoutKnownKey);
        let pt = [3u8];
        let input = ModelInput {
            plaintext: Some(&pt),
            ..Default::default()
        };
        assert_eq!(LeakageModel::leakage(&xor_model, &input, 1, 0), Some(2.0));
    }
}
