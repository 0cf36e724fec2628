//! Per-source interval scheduling.
//!
//! An [`IntervalScheduler`] turns one source's view of a layer's cyclic
//! cell list into an endless sequence of integer sample counts. Cells the
//! source does not play are folded into the preceding audible interval, so
//! silence lengthens an interval instead of becoming a zero-length event.
//!
//! Rounding remainders accumulate in a carry shared by every scheduler of
//! the same layer, which bounds drift across a full cycle to one sample no
//! matter the tempo or cycle length.

use std::sync::{Arc, Mutex};

use super::cell::{Cell, SourceId};
use super::samples_per_quarter;
use crate::dsl::error::CompileError;

/// Fractional-sample carry shared across one layer's schedulers.
pub type SharedCarry = Arc<Mutex<f64>>;

pub fn new_carry() -> SharedCarry {
    Arc::new(Mutex::new(0.0))
}

/// Infinite, restartable producer of sample-interval lengths for one source.
/// Not indexable, only advanceable.
#[derive(Debug)]
pub struct IntervalScheduler {
    /// Aggregate durations in quarter notes, cyclic.
    intervals: Vec<f64>,
    /// Quarters of pattern before this source's first trigger.
    lead_in_quarters: f64,
    pos: usize,
    tempo_bpm: f64,
    sample_rate: u32,
    carry: SharedCarry,
}

impl IntervalScheduler {
    /// Build the scheduler for `source` over `cells`. Returns `None` when
    /// the source never occurs in the pattern.
    pub fn build(
        cells: &[Cell],
        source: SourceId,
        base_is_tone: bool,
        tempo_bpm: f64,
        sample_rate: u32,
        carry: SharedCarry,
    ) -> Option<Self> {
        let first = cells
            .iter()
            .position(|c| c.source_id(base_is_tone) == source)?;

        let mut intervals: Vec<f64> = Vec::new();
        for step in 0..cells.len() {
            let cell = &cells[(first + step) % cells.len()];
            if step == 0 || cell.source_id(base_is_tone) == source {
                intervals.push(cell.duration);
            } else {
                // Fold non-matching cells into the preceding interval.
                if let Some(last) = intervals.last_mut() {
                    *last += cell.duration;
                }
            }
        }
        let lead_in_quarters = cells[..first].iter().map(|c| c.duration).sum();

        Some(Self {
            intervals,
            lead_in_quarters,
            pos: 0,
            tempo_bpm,
            sample_rate,
            carry,
        })
    }

    /// Reject patterns whose longest interval cannot be counted in samples.
    pub fn validate(&self, tempo_bpm: f64) -> Result<(), CompileError> {
        let spq = samples_per_quarter(tempo_bpm, self.sample_rate);
        for &quarters in &self.intervals {
            if quarters * spq > u32::MAX as f64 {
                return Err(CompileError::too_slow(format!(
                    "interval of {quarters} quarter notes at {tempo_bpm} BPM \
                     exceeds the representable sample range"
                )));
            }
        }
        Ok(())
    }

    /// Pull the next interval length in samples, advancing the cycle.
    pub fn next_interval(&mut self) -> u64 {
        let quarters = self.intervals[self.pos];
        self.pos = (self.pos + 1) % self.intervals.len();

        let spq = samples_per_quarter(self.tempo_bpm, self.sample_rate);
        let mut carry = match self.carry.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        let exact = quarters * spq + *carry;
        let n = exact.round().max(1.0);
        *carry = exact - n;
        n as u64
    }

    /// Lead-in before the first trigger, in (fractional) samples at the
    /// current tempo.
    pub fn lead_in_samples(&self) -> f64 {
        self.lead_in_quarters * samples_per_quarter(self.tempo_bpm, self.sample_rate)
    }

    pub fn set_tempo(&mut self, tempo_bpm: f64) {
        self.tempo_bpm = tempo_bpm;
    }

    /// Restart the cycle from the top. The shared carry is the layer's to
    /// clear; a scheduler only owns its own position.
    pub fn reset(&mut self) {
        self.pos = 0;
    }

    pub fn cycle_quarters(&self) -> f64 {
        self.intervals.iter().sum()
    }

    #[cfg(test)]
    fn intervals(&self) -> &[f64] {
        &self.intervals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cell::SourceTag;
    use assert_approx_eq::assert_approx_eq;

    fn cell(duration: f64, tag: Option<SourceTag>) -> Cell {
        Cell::new(duration, tag)
    }

    fn file(n: u32) -> Option<SourceTag> {
        Some(SourceTag::File(n))
    }

    #[test]
    fn absent_source_builds_nothing() {
        let cells = vec![cell(1.0, None)];
        assert!(IntervalScheduler::build(
            &cells,
            SourceId::File(0),
            false,
            120.0,
            44100,
            new_carry()
        )
        .is_none());
    }

    #[test]
    fn silence_folds_into_preceding_interval() {
        // kick, other, kick -> kick intervals [2, 1]
        let cells = vec![cell(1.0, file(0)), cell(1.0, None), cell(1.0, file(0))];
        let s = IntervalScheduler::build(
            &cells,
            SourceId::File(0),
            false,
            120.0,
            44100,
            new_carry(),
        )
        .unwrap();
        assert_eq!(s.intervals(), &[2.0, 1.0]);
    }

    #[test]
    fn cells_before_first_occurrence_become_lead_in() {
        // other, other, kick -> lead-in 2 quarters, single wrapped interval 3
        let cells = vec![cell(1.0, None), cell(1.0, None), cell(1.0, file(0))];
        let s = IntervalScheduler::build(
            &cells,
            SourceId::File(0),
            false,
            120.0,
            44100,
            new_carry(),
        )
        .unwrap();
        assert_eq!(s.intervals(), &[3.0]);
        assert_approx_eq!(s.lead_in_samples(), 2.0 * 22050.0);
    }

    #[test]
    fn whole_intervals_at_even_tempo() {
        let cells = vec![cell(1.0, file(0)), cell(0.5, file(0))];
        let mut s = IntervalScheduler::build(
            &cells,
            SourceId::File(0),
            false,
            120.0,
            44100,
            new_carry(),
        )
        .unwrap();
        assert_eq!(s.next_interval(), 22050);
        assert_eq!(s.next_interval(), 11025);
        assert_eq!(s.next_interval(), 22050);
    }

    #[test]
    fn drift_stays_under_one_sample_over_many_cycles() {
        let cells = vec![
            cell(1.0 / 3.0, file(0)),
            cell(0.7, file(0)),
            cell(1.0 / 7.0, file(0)),
        ];
        let tempo = 137.0;
        let mut s =
            IntervalScheduler::build(&cells, SourceId::File(0), false, tempo, 44100, new_carry())
                .unwrap();
        let cycle_quarters = s.cycle_quarters();

        let cycles = 10_000u64;
        let mut total: u64 = 0;
        for _ in 0..cycles * 3 {
            total += s.next_interval();
        }
        let exact = cycles as f64 * cycle_quarters * samples_per_quarter(tempo, 44100);
        assert!(
            (total as f64 - exact).abs() <= 1.0,
            "drift {} samples",
            total as f64 - exact
        );
    }

    #[test]
    fn shared_carry_bounds_drift_across_sources() {
        let cells = vec![cell(1.0 / 3.0, file(0)), cell(1.0 / 3.0, file(1))];
        let carry = new_carry();
        let mut a =
            IntervalScheduler::build(&cells, SourceId::File(0), false, 120.0, 44100, carry.clone())
                .unwrap();
        let mut b =
            IntervalScheduler::build(&cells, SourceId::File(1), false, 120.0, 44100, carry.clone())
                .unwrap();

        let mut total = 0u64;
        for _ in 0..3000 {
            total += a.next_interval();
            total += b.next_interval();
        }
        // Both sources cover the same 2/3-quarter cycle; their combined
        // pull is two full passes per iteration.
        let exact = 3000.0 * 2.0 * (2.0 / 3.0) * samples_per_quarter(120.0, 44100);
        assert!((total as f64 - exact).abs() <= 1.0);
    }

    #[test]
    fn tempo_change_rescales_future_intervals() {
        let cells = vec![cell(1.0, file(0))];
        let mut s = IntervalScheduler::build(
            &cells,
            SourceId::File(0),
            false,
            120.0,
            44100,
            new_carry(),
        )
        .unwrap();
        assert_eq!(s.next_interval(), 22050);
        s.set_tempo(60.0);
        assert_eq!(s.next_interval(), 44100);
    }

    #[test]
    fn validate_rejects_unrepresentable_interval() {
        let cells = vec![cell(1.0e9, file(0))];
        let s = IntervalScheduler::build(&cells, SourceId::File(0), false, 1.0, 44100, new_carry())
            .unwrap();
        assert!(s.validate(1.0).is_err());
        let cells = vec![cell(1.0, file(0))];
        let s = IntervalScheduler::build(&cells, SourceId::File(0), false, 120.0, 44100, new_carry())
            .unwrap();
        assert!(s.validate(120.0).is_ok());
    }

    #[test]
    fn reset_restarts_cycle() {
        let cells = vec![cell(1.0, file(0)), cell(0.5, file(0))];
        let mut s = IntervalScheduler::build(
            &cells,
            SourceId::File(0),
            false,
            120.0,
            44100,
            new_carry(),
        )
        .unwrap();
        let first = s.next_interval();
        s.reset();
        assert_eq!(s.next_interval(), first);
    }
}
