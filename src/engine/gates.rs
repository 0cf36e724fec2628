//! Cross-cutting gates applied at interval boundaries and per sample.
//!
//! None of these ever pause a scheduler. They only decide whether a stream
//! is allowed to make sound; timing marches on regardless, which is what
//! keeps every layer phase-locked through silence and mutes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::samples_per_quarter;
use crate::config::SilenceWindowConfig;

/// Audible/silent duty cycle. Every source carries its own copy and tracks
/// its own phase, but all copies share the same two durations, so sources
/// that start together stay in lockstep.
#[derive(Debug, Clone)]
pub struct SilenceGate {
    audible_quarters: f64,
    silent_quarters: f64,
    audible: bool,
    remaining: u64,
    carry: f64,
    tempo_bpm: f64,
    sample_rate: u32,
}

impl SilenceGate {
    pub fn new(cfg: &SilenceWindowConfig, tempo_bpm: f64, sample_rate: u32) -> Self {
        let mut gate = Self {
            audible_quarters: cfg.audible_quarters.max(0.0),
            silent_quarters: cfg.silent_quarters.max(0.0),
            audible: true,
            remaining: 0,
            carry: 0.0,
            tempo_bpm,
            sample_rate,
        };
        gate.remaining = gate.phase_samples(gate.audible_quarters);
        gate
    }

    pub fn is_audible(&self) -> bool {
        self.audible
    }

    /// Consume `n` samples of the duty cycle, toggling phases as needed.
    pub fn advance(&mut self, mut n: u64) {
        while n > 0 {
            if self.remaining == 0 {
                self.toggle();
                continue;
            }
            let take = n.min(self.remaining);
            self.remaining -= take;
            n -= take;
        }
        if self.remaining == 0 {
            self.toggle();
        }
    }

    pub fn step(&mut self) {
        self.advance(1);
    }

    /// Rescale the in-flight countdown after a tempo change.
    pub fn rescale(&mut self, ratio: f64) {
        let exact = self.remaining as f64 * ratio + self.carry;
        let n = exact.round().max(1.0);
        self.carry = exact - n;
        self.remaining = n as u64;
    }

    pub fn set_tempo(&mut self, tempo_bpm: f64) {
        self.tempo_bpm = tempo_bpm;
    }

    pub fn reset(&mut self) {
        self.audible = true;
        self.carry = 0.0;
        self.remaining = self.phase_samples(self.audible_quarters);
    }

    fn toggle(&mut self) {
        self.audible = !self.audible;
        let quarters = if self.audible {
            self.audible_quarters
        } else {
            self.silent_quarters
        };
        self.remaining = self.phase_samples(quarters);
    }

    /// Phase lengths round through the gate's own carry; minimum one sample
    /// so a degenerate phase cannot stall the toggle loop.
    fn phase_samples(&mut self, quarters: f64) -> u64 {
        let exact = quarters * samples_per_quarter(self.tempo_bpm, self.sample_rate) + self.carry;
        let n = exact.round().max(1.0);
        self.carry = exact - n;
        n as u64
    }
}

/// Per-interval Bernoulli mute with an optional linear onset ramp.
#[derive(Debug, Clone)]
pub struct MuteGate {
    rng: ChaCha8Rng,
    percent: f32,
    ramp_remaining: u64,
    ramp_total: u64,
}

impl MuteGate {
    pub fn new(percent: f32, ramp_samples: u64, seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            percent: percent.clamp(0.0, 100.0),
            ramp_remaining: ramp_samples,
            ramp_total: ramp_samples,
        }
    }

    /// Roll the dice for one interval. The effective probability climbs
    /// linearly from zero while the ramp is still counting down.
    pub fn should_mute(&mut self) -> bool {
        if self.percent <= 0.0 {
            return false;
        }
        let effective = if self.ramp_total == 0 {
            self.percent as f64
        } else {
            let progress = 1.0 - self.ramp_remaining as f64 / self.ramp_total as f64;
            self.percent as f64 * progress
        };
        self.rng.gen::<f64>() * 100.0 < effective
    }

    pub fn advance(&mut self, n: u64) {
        self.ramp_remaining = self.ramp_remaining.saturating_sub(n);
    }

    pub fn rescale(&mut self, ratio: f64) {
        self.ramp_remaining = (self.ramp_remaining as f64 * ratio).round() as u64;
        self.ramp_total = (self.ramp_total as f64 * ratio).round() as u64;
    }

    pub fn reset(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self.ramp_remaining = self.ramp_total;
    }
}

/// Shared closed-hat trigger positions for one layer.
///
/// A closed-hat trigger pushes its absolute sample position here, always,
/// even when the trigger itself is muted or inside a silence window. Open
/// streams scan the queue and cut their in-flight interval at the first
/// position falling inside it, discarding stale positions on the way.
///
/// This is an ordered queue, not a single slot: streams render a whole
/// block each in sequence, so two closed triggers can land in the queue
/// before the open stream reads. The earlier cut must survive the later
/// trigger.
#[derive(Debug, Clone, Default)]
pub struct HatLatch {
    triggers: Arc<Mutex<VecDeque<u64>>>,
}

impl HatLatch {
    /// Stale positions are discarded on read; the cap only matters for a
    /// layer that has closed hats but no open-hat stream to consume them.
    const CAPACITY: usize = 64;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, position: u64) {
        let mut triggers = lock(&self.triggers);
        if triggers.len() == Self::CAPACITY {
            triggers.pop_front();
        }
        triggers.push_back(position);
    }

    /// First recorded position inside `[interval_start, position]`, if any.
    /// Positions before `interval_start` predate the interval and are
    /// dropped.
    pub fn cut_at(&self, interval_start: u64, position: u64) -> Option<u64> {
        let mut triggers = lock(&self.triggers);
        while triggers.front().is_some_and(|&p| p < interval_start) {
            triggers.pop_front();
        }
        triggers.front().copied().filter(|&p| p <= position)
    }

    pub fn clear(&self) {
        lock(&self.triggers).clear();
    }

    #[cfg(test)]
    pub fn pending(&self) -> Vec<u64> {
        lock(&self.triggers).iter().copied().collect()
    }
}

fn lock(triggers: &Mutex<VecDeque<u64>>) -> MutexGuard<'_, VecDeque<u64>> {
    match triggers.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
