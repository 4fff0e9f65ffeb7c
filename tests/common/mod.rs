#![allow(dead_code)]

use ndarray::Array2;
use progressive_cpa::leakage::{hw, inv_sbox, sbox};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const KEY: [u8; 16] = [
    0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c,
];

/// Samples before the first leaking one
pub const OFFSET: usize = 2;
pub const NUM_SAMPLES: usize = 20;

pub struct Synthetic {
    pub traces: Array2<i16>,
    pub plaintexts: Array2<u8>,
    pub ciphertexts: Array2<u8>,
}

/// Integer-valued traces where key byte `k` leaks at sample `OFFSET + k`
/// through `leak(input_byte, k)`.
fn generate(num_traces: usize, seed: u64, leak: impl Fn(u8, usize) -> i16) -> Synthetic {
    let mut rng = StdRng::seed_from_u64(seed);
    let plaintexts = Array2::from_shape_fn((num_traces, 16), |_| rng.gen::<u8>());
    let ciphertexts = Array2::from_shape_fn((num_traces, 16), |_| rng.gen::<u8>());
    let mut traces = Array2::from_shape_fn((num_traces, NUM_SAMPLES), |_| rng.gen_range(-30i16..30));
    for i in 0..num_traces {
        for k in 0..16 {
            traces[[i, OFFSET + k]] += leak(plaintexts[[i, k]], k);
        }
    }
    Synthetic {
        traces,
        plaintexts,
        ciphertexts,
    }
}

/// First-round encryption leakage, HW of the S-box output.
pub fn sbox_leakage(num_traces: usize, seed: u64) -> Synthetic {
    generate(num_traces, seed, |pt, k| {
        6 * hw(sbox(pt ^ KEY[k]) as usize) as i16
    })
}

/// Leakage of the inverse S-box output, as a device decrypting the blocks of
/// the `plaintexts` column would show.
pub fn inv_sbox_leakage(num_traces: usize, seed: u64) -> Synthetic {
    generate(num_traces, seed, |block, k| {
        6 * hw(inv_sbox(block ^ KEY[k]) as usize) as i16
    })
}
