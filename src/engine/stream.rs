//! Audio stream sources.
//!
//! A [`Stream`] is one source's voice inside a layer: an idle/counting-down
//! state machine driven by pull reads. Every sample it either emits audio
//! or silence, but it always advances, so the scheduler's clock is never
//! disturbed by gates, mutes, or hi-hat cuts.

use std::sync::Arc;

use super::catalog::SampleData;
use super::gates::{HatLatch, MuteGate, SilenceGate};
use super::schedule::{IntervalScheduler, SharedCarry};

/// Phase-continuous sine oscillator.
///
/// Runs the two-term recurrence `s[n] = 2cos(w)*s[n-1] - s[n-2]` and keeps
/// a running phase so a frequency change reseeds the recurrence at the
/// current phase instead of snapping to zero. No clicks.
#[derive(Debug, Clone)]
struct ToneGen {
    omega: f64,
    coeff: f64,
    s1: f64,
    s2: f64,
    phase: f64,
    sample_rate: u32,
}

impl ToneGen {
    fn new(sample_rate: u32, freq_hz: f64) -> Self {
        let mut gen = Self {
            omega: 0.0,
            coeff: 2.0,
            s1: 0.0,
            s2: 0.0,
            phase: 0.0,
            sample_rate,
        };
        gen.set_frequency(freq_hz);
        gen
    }

    fn set_frequency(&mut self, freq_hz: f64) {
        self.omega = std::f64::consts::TAU * freq_hz / self.sample_rate as f64;
        self.coeff = 2.0 * self.omega.cos();
        self.reseed();
    }

    /// Emit `sin(phase)` and advance one sample.
    fn next(&mut self) -> f64 {
        let s = self.coeff * self.s1 - self.s2;
        self.s2 = self.s1;
        self.s1 = s;
        self.phase = (self.phase + self.omega) % std::f64::consts::TAU;
        s
    }

    /// Jump `n` samples forward without emitting, keeping phase exact.
    fn skip(&mut self, n: u64) {
        self.phase = (self.phase + self.omega * n as f64) % std::f64::consts::TAU;
        self.reseed();
    }

    fn reseed(&mut self) {
        self.s1 = (self.phase - self.omega).sin();
        self.s2 = (self.phase - 2.0 * self.omega).sin();
    }
}

/// What kind of voice a stream plays.
#[derive(Debug, Clone)]
pub enum VoiceSpec {
    Tone {
        /// Round-robin of distinct pitches, advanced one per trigger.
        pitches: Vec<f64>,
        /// Linear decay span of the gain envelope, in samples.
        decay_samples: u64,
    },
    Sample { data: Arc<SampleData> },
}

#[derive(Debug)]
enum Voice {
    Tone {
        gen: ToneGen,
        pitches: Vec<f64>,
        next_pitch: usize,
        decay_total: u64,
        decay_remaining: u64,
    },
    Sample {
        data: Arc<SampleData>,
        cursor: usize,
        audible: bool,
    },
}

/// Everything needed to stand up one stream.
pub struct StreamSpec {
    pub voice: VoiceSpec,
    pub scheduler: IntervalScheduler,
    pub silence: Option<SilenceGate>,
    pub mute: Option<MuteGate>,
    pub mute_seed: u64,
    pub latch: HatLatch,
    pub is_open_hat: bool,
    pub is_closed_hat: bool,
    /// Lead-in silence before the first trigger, fractional samples.
    pub offset_samples: f64,
    pub carry: SharedCarry,
}

#[derive(Debug)]
pub struct Stream {
    voice: Voice,
    scheduler: IntervalScheduler,
    silence: Option<SilenceGate>,
    mute: Option<MuteGate>,
    mute_seed: u64,
    latch: HatLatch,
    is_open_hat: bool,
    is_closed_hat: bool,
    /// Samples left in the current interval; 0 means pull the next one.
    remaining: u64,
    offset_initial: u64,
    offset_remaining: u64,
    /// Absolute sample position since start/reset.
    position: u64,
    interval_start: u64,
    latch_cut: bool,
    carry: SharedCarry,
    sample_rate: u32,
}

impl Stream {
    pub fn new(spec: StreamSpec, sample_rate: u32) -> Self {
        let offset_initial = {
            let mut carry = lock(&spec.carry);
            let exact = spec.offset_samples + *carry;
            let n = exact.round().max(0.0);
            *carry = exact - n;
            n as u64
        };
        let voice = match spec.voice {
            VoiceSpec::Tone {
                pitches,
                decay_samples,
            } => Voice::Tone {
                gen: ToneGen::new(sample_rate, pitches.first().copied().unwrap_or(440.0)),
                pitches,
                next_pitch: 0,
                decay_total: decay_samples,
                decay_remaining: 0,
            },
            VoiceSpec::Sample { data } => {
                let cursor = data.len();
                Voice::Sample {
                    data,
                    cursor,
                    audible: false,
                }
            }
        };
        Self {
            voice,
            scheduler: spec.scheduler,
            silence: spec.silence,
            mute: spec.mute,
            mute_seed: spec.mute_seed,
            latch: spec.latch,
            is_open_hat: spec.is_open_hat,
            is_closed_hat: spec.is_closed_hat,
            remaining: 0,
            offset_initial,
            offset_remaining: offset_initial,
            position: 0,
            interval_start: 0,
            latch_cut: false,
            carry: spec.carry,
            sample_rate,
        }
    }

    pub fn is_closed_hat(&self) -> bool {
        self.is_closed_hat
    }

    /// Mix this stream's next `out.len()` samples into the buffer.
    pub fn render_into(&mut self, out: &mut [f32]) {
        for slot in out.iter_mut() {
            *slot += self.next_sample();
        }
    }

    fn next_sample(&mut self) -> f32 {
        if self.offset_remaining > 0 {
            self.offset_remaining -= 1;
            self.consume_gates(1);
            self.position += 1;
            return 0.0;
        }
        if self.remaining == 0 {
            self.start_interval();
        }
        if self.is_open_hat
            && !self.latch_cut
            && self
                .latch
                .cut_at(self.interval_start, self.position)
                .is_some()
        {
            self.latch_cut = true;
        }

        let window_silent = self.silence.as_ref().is_some_and(|g| !g.is_audible());
        let value = match &mut self.voice {
            Voice::Tone {
                gen,
                decay_total,
                decay_remaining,
                ..
            } => {
                let raw = gen.next();
                let gain = if *decay_total == 0 {
                    1.0
                } else {
                    *decay_remaining as f64 / *decay_total as f64
                };
                *decay_remaining = decay_remaining.saturating_sub(1);
                raw * gain
            }
            Voice::Sample {
                data,
                cursor,
                audible,
            } => {
                let v = if *audible {
                    data.samples().get(*cursor).copied().unwrap_or(0.0) as f64
                } else {
                    0.0
                };
                *cursor = cursor.saturating_add(1);
                v
            }
        };

        self.consume_gates(1);
        self.position += 1;
        self.remaining -= 1;

        if window_silent || self.latch_cut {
            0.0
        } else {
            value as f32
        }
    }

    /// Fast-forward `n` samples without producing output. Interval starts,
    /// mute rolls, and latch records happen exactly as they would during
    /// audible playback, so a fast-forwarded stream is bit-identical in
    /// state to one that rendered the same span.
    pub fn advance_silent(&mut self, mut n: u64) {
        while n > 0 {
            if self.offset_remaining > 0 {
                let take = n.min(self.offset_remaining);
                self.offset_remaining -= take;
                self.consume_gates(take);
                self.position += take;
                n -= take;
                continue;
            }
            if self.remaining == 0 {
                self.start_interval();
            }
            let take = n.min(self.remaining);
            match &mut self.voice {
                Voice::Tone {
                    gen,
                    decay_remaining,
                    ..
                } => {
                    gen.skip(take);
                    *decay_remaining = decay_remaining.saturating_sub(take);
                }
                Voice::Sample { cursor, .. } => {
                    *cursor = cursor.saturating_add(take as usize);
                }
            }
            self.remaining -= take;
            self.consume_gates(take);
            self.position += take;
            n -= take;
        }
    }

    fn start_interval(&mut self) {
        self.remaining = self.scheduler.next_interval();
        self.interval_start = self.position;
        self.latch_cut = false;

        let muted = self.mute.as_mut().is_some_and(|g| g.should_mute());
        let window_audible = self.silence.as_ref().map_or(true, |g| g.is_audible());

        if self.is_closed_hat {
            // The position propagates even when this trigger is muted or
            // inside a silence window.
            self.latch.record(self.position);
        }

        match &mut self.voice {
            Voice::Tone {
                gen,
                pitches,
                next_pitch,
                decay_total,
                decay_remaining,
            } => {
                if !pitches.is_empty() {
                    let hz = pitches[*next_pitch % pitches.len()];
                    *next_pitch = (*next_pitch + 1) % pitches.len();
                    gen.set_frequency(hz);
                }
                if !muted {
                    *decay_remaining = *decay_total;
                }
            }
            Voice::Sample {
                cursor, audible, ..
            } => {
                if !muted && window_audible {
                    *cursor = 0;
                    *audible = true;
                } else {
                    *audible = false;
                }
            }
        }
    }

    fn consume_gates(&mut self, n: u64) {
        if let Some(g) = &mut self.silence {
            g.advance(n);
        }
        if let Some(g) = &mut self.mute {
            g.advance(n);
        }
    }

    /// Rescale every in-flight countdown after a tempo change. Remainders
    /// go through the layer's shared carry, same as interval rounding.
    pub fn rescale(&mut self, ratio: f64) {
        {
            let mut carry = lock(&self.carry);
            for value in [&mut self.remaining, &mut self.offset_remaining] {
                let exact = *value as f64 * ratio + *carry;
                let n = exact.round().max(0.0);
                *carry = exact - n;
                *value = n as u64;
            }
        }
        if let Some(g) = &mut self.silence {
            g.rescale(ratio);
        }
        if let Some(g) = &mut self.mute {
            g.rescale(ratio);
        }
        if let Voice::Tone {
            decay_total,
            decay_remaining,
            ..
        } = &mut self.voice
        {
            *decay_total = (*decay_total as f64 * ratio).round() as u64;
            *decay_remaining = (*decay_remaining as f64 * ratio).round() as u64;
        }
    }

    pub fn set_tempo(&mut self, tempo_bpm: f64) {
        self.scheduler.set_tempo(tempo_bpm);
        if let Some(g) = &mut self.silence {
            g.set_tempo(tempo_bpm);
        }
    }

    /// Back to the top of the pattern, envelope down, nothing in flight.
    pub fn reset(&mut self) {
        self.scheduler.reset();
        self.remaining = 0;
        self.offset_remaining = self.offset_initial;
        self.position = 0;
        self.interval_start = 0;
        self.latch_cut = false;
        if let Some(g) = &mut self.silence {
            g.reset();
        }
        if let Some(g) = &mut self.mute {
            g.reset(self.mute_seed);
        }
        match &mut self.voice {
            Voice::Tone {
                gen,
                next_pitch,
                decay_remaining,
                pitches,
                ..
            } => {
                *gen = ToneGen::new(self.sample_rate, pitches.first().copied().unwrap_or(440.0));
                *next_pitch = 0;
                *decay_remaining = 0;
            }
            Voice::Sample {
                data,
                cursor,
                audible,
            } => {
                *cursor = data.len();
                *audible = false;
            }
        }
    }

    #[cfg(test)]
    pub fn position(&self) -> u64 {
        self.position
    }
}

fn lock(carry: &SharedCarry) -> std::sync::MutexGuard<'_, f64> {
    match carry.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}
