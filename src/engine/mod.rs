//! The playback engine: compiled cells in, sample blocks out.

pub mod catalog;
pub mod cell;
pub mod gates;
pub mod layer;
pub mod schedule;
pub mod stream;
pub mod transport;

pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Frames per render block. Every pending control change (tempo ratio,
/// layer swap) lands on a multiple of this.
pub const BLOCK_FRAMES: usize = 512;

/// Samples in one quarter note at the given tempo.
pub fn samples_per_quarter(tempo_bpm: f64, sample_rate: u32) -> f64 {
    60.0 / tempo_bpm * sample_rate as f64
}

/// Least common multiple of quarter-note lengths, computed on values scaled
/// to millionths so near-rational floats behave like the rationals they are.
pub fn rational_lcm(values: &[f64]) -> f64 {
    const SCALE: f64 = 1_000_000.0;
    let mut acc: u64 = 0;
    for &v in values {
        if v <= 0.0 {
            continue;
        }
        let scaled = (v * SCALE).round() as u64;
        if scaled == 0 {
            continue;
        }
        acc = if acc == 0 { scaled } else { lcm_u64(acc, scaled) };
    }
    acc as f64 / SCALE
}

fn gcd_u64(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a.max(1)
}

fn lcm_u64(a: u64, b: u64) -> u64 {
    a / gcd_u64(a, b) * b
}
