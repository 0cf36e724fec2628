//! Master output stage: gain, hard mute, and a clamp ceiling.

/// Applies the master gain, then clamps to `[-ceiling, ceiling]`. Muting
/// zeroes the output here, after the transport has rendered, so playback
/// time keeps moving while the device is silent.
#[derive(Debug, Clone)]
pub struct Limiter {
    ceiling: f32,
    gain: f32,
    muted: bool,
}

impl Limiter {
    /// Ceiling should be in `(0.0, 1.0]`.
    pub fn new(ceiling: f32) -> Self {
        debug_assert!(ceiling > 0.0 && ceiling <= 1.0);
        Self {
            ceiling,
            gain: 1.0,
            muted: false,
        }
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain.clamp(0.0, 1.0);
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    #[inline]
    pub fn process(&self, sample: f32) -> f32 {
        if self.muted {
            return 0.0;
        }
        (sample * self.gain).clamp(-self.ceiling, self.ceiling)
    }

    /// Process a whole buffer in place.
    #[inline]
    pub fn process_block(&self, buffer: &mut [f32]) {
        if self.muted {
            buffer.fill(0.0);
            return;
        }
        for sample in buffer.iter_mut() {
            *sample = (*sample * self.gain).clamp(-self.ceiling, self.ceiling);
        }
    }

    pub fn ceiling(&self) -> f32 {
        self.ceiling
    }
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new(0.95)
    }
}
