//! A layer: one independently-looping rhythmic voice.
//!
//! Owns the compiled cell list, a lead-in offset, and one [`Stream`] per
//! distinct sound source in the pattern. Closed-hat streams are kept ahead
//! of the others so a closed trigger inside a block truncates open hats in
//! the same block, sample-accurately.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use super::catalog::{SourceCatalog, SourceKind};
use super::cell::{PitchKey, SourceId, SourceTag};
use super::gates::{HatLatch, MuteGate, SilenceGate};
use super::samples_per_quarter;
use super::schedule::{new_carry, IntervalScheduler, SharedCarry};
use super::stream::{Stream, StreamSpec, VoiceSpec};
use crate::config::EngineConfig;
use crate::dsl::compile::{compile, RefContext};
use crate::dsl::error::CompileError;
use crate::dsl::expr;

/// Volume, pan, and mute, shared with control threads. These survive a
/// live-edit swap: the shadow layer adopts the live layer's controls.
#[derive(Debug)]
pub struct LayerControls {
    /// f32 bit patterns; plain stores, no RMW contention.
    volume: AtomicU32,
    pan: AtomicU32,
    muted: AtomicBool,
}

impl Default for LayerControls {
    fn default() -> Self {
        Self {
            volume: AtomicU32::new(1.0f32.to_bits()),
            pan: AtomicU32::new(0.0f32.to_bits()),
            muted: AtomicBool::new(false),
        }
    }
}

impl LayerControls {
    pub fn set_volume(&self, volume: f32) {
        self.volume
            .store(volume.clamp(0.0, 2.0).to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    /// Pan in [-1, 1], constant-power law.
    pub fn set_pan(&self, pan: f32) {
        self.pan
            .store(pan.clamp(-1.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn pan(&self) -> f32 {
        f32::from_bits(self.pan.load(Ordering::Relaxed))
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Left/right gains for the current volume, pan, and mute.
    pub fn gains(&self) -> (f32, f32) {
        if self.muted() {
            return (0.0, 0.0);
        }
        let v = self.volume();
        let angle = (self.pan() + 1.0) * std::f32::consts::FRAC_PI_4;
        (v * angle.cos(), v * angle.sin())
    }
}

/// Inputs for building (or rebuilding) a layer.
pub struct LayerParams<'a> {
    pub beat_code: &'a str,
    /// Lead-in offset expression in quarter notes; empty means none.
    pub offset_code: &'a str,
    pub base: SourceKind,
    pub ctx: RefContext<'a>,
    pub catalog: &'a SourceCatalog,
    pub config: &'a EngineConfig,
    pub tempo_bpm: f64,
    pub sample_rate: u32,
}

#[derive(Debug)]
pub struct Layer {
    beat_code: String,
    offset_quarters: f64,
    total_quarters: f64,
    /// Tempo the streams' sample countdowns are currently scaled for.
    tempo_bpm: f64,
    base: SourceKind,
    streams: Vec<Stream>,
    carry: SharedCarry,
    latch: HatLatch,
    controls: Arc<LayerControls>,
}

impl Layer {
    /// Compile `beat_code` and stand up the layer's streams. A failed
    /// compile builds nothing, so the caller's previous layer (if any)
    /// stays untouched.
    pub fn build(params: &LayerParams<'_>) -> Result<Self, CompileError> {
        Self::build_with_parts(params, HatLatch::new(), Arc::new(LayerControls::default()))
    }

    /// Build a shadow for a live edit: shares the live layer's hat latch
    /// and controls so the swap changes only the pattern.
    pub fn build_shadow(params: &LayerParams<'_>, live: &Layer) -> Result<Self, CompileError> {
        Self::build_with_parts(params, live.latch.clone(), live.controls.clone())
    }

    /// Shadow construction from pre-cloned shared parts, so the caller can
    /// compile without holding whatever lock guards the live layer.
    pub(crate) fn build_with_parts(
        params: &LayerParams<'_>,
        latch: HatLatch,
        controls: Arc<LayerControls>,
    ) -> Result<Self, CompileError> {
        let base_is_tone = matches!(params.base, SourceKind::Pitch(_));
        let compiled = compile(params.beat_code, &params.ctx, params.catalog, base_is_tone)?;

        let offset_quarters = if params.offset_code.trim().is_empty() {
            0.0
        } else {
            let v = expr::parse(params.offset_code)?;
            if v < 0.0 {
                return Err(CompileError::malformed(
                    format!("offset must not be negative: '{}'", params.offset_code),
                    0,
                ));
            }
            v
        };

        let cells = &compiled.cells;
        let mut sources: Vec<SourceId> = Vec::new();
        for cell in cells {
            let id = cell.source_id(base_is_tone);
            if !sources.contains(&id) {
                sources.push(id);
            }
        }

        // Distinct pitches in first-appearance order feed the tone
        // round-robin; an untagged tone base contributes its own pitch.
        let mut pitch_keys: Vec<PitchKey> = Vec::new();
        let mut pitches: Vec<f64> = Vec::new();
        for cell in cells {
            if let Some(SourceTag::Pitch(hz)) = cell.tag {
                let key = PitchKey::from_hz(hz);
                if !pitch_keys.contains(&key) {
                    pitch_keys.push(key);
                    pitches.push(hz);
                }
            }
        }
        if pitches.is_empty() {
            if let SourceKind::Pitch(hz) = params.base {
                pitches.push(hz);
            }
        }

        let carry = new_carry();
        let spq = samples_per_quarter(params.tempo_bpm, params.sample_rate);
        let decay_samples =
            (params.config.tone_decay_quarters.max(0.0) * spq).round() as u64;
        let ramp_samples = (params.config.mute_ramp_quarters.max(0.0) * spq).round() as u64;

        let mut streams = Vec::with_capacity(sources.len());
        for (i, &id) in sources.iter().enumerate() {
            let scheduler = match IntervalScheduler::build(
                cells,
                id,
                base_is_tone,
                params.tempo_bpm,
                params.sample_rate,
                carry.clone(),
            ) {
                Some(s) => s,
                None => continue,
            };
            scheduler.validate(params.tempo_bpm)?;

            let voice = match id {
                SourceId::Tone => VoiceSpec::Tone {
                    pitches: pitches.clone(),
                    decay_samples,
                },
                SourceId::Base => match &params.base {
                    SourceKind::Pcm(data) => VoiceSpec::Sample { data: data.clone() },
                    SourceKind::Pitch(hz) => VoiceSpec::Tone {
                        pitches: vec![*hz],
                        decay_samples,
                    },
                },
                SourceId::File(idx) => match params.catalog.file(idx) {
                    Some(data) => VoiceSpec::Sample { data },
                    None => return Err(CompileError::unknown_source(&idx.to_string())),
                },
            };

            let offset_samples = offset_quarters * spq + scheduler.lead_in_samples();
            let mute_seed = params
                .config
                .seed
                .wrapping_add((i as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15));
            let mute = (params.config.mute_percent > 0.0)
                .then(|| MuteGate::new(params.config.mute_percent, ramp_samples, mute_seed));
            let silence = params
                .config
                .silence_window
                .as_ref()
                .map(|w| SilenceGate::new(w, params.tempo_bpm, params.sample_rate));

            streams.push(Stream::new(
                StreamSpec {
                    voice,
                    scheduler,
                    silence,
                    mute,
                    mute_seed,
                    latch: latch.clone(),
                    is_open_hat: params.catalog.is_open_hat(id),
                    is_closed_hat: params.catalog.is_closed_hat(id),
                    offset_samples,
                    carry: carry.clone(),
                },
                params.sample_rate,
            ));
        }
        // Closed hats first so same-block triggers reach open hats in time.
        streams.sort_by_key(|s| !s.is_closed_hat());

        Ok(Self {
            beat_code: params.beat_code.to_string(),
            offset_quarters,
            total_quarters: compiled.total_quarters,
            tempo_bpm: params.tempo_bpm,
            base: params.base.clone(),
            streams,
            carry,
            latch,
            controls,
        })
    }

    pub fn beat_code(&self) -> &str {
        &self.beat_code
    }

    pub fn total_quarters(&self) -> f64 {
        self.total_quarters
    }

    pub fn offset_quarters(&self) -> f64 {
        self.offset_quarters
    }

    pub fn tempo_bpm(&self) -> f64 {
        self.tempo_bpm
    }

    pub fn controls(&self) -> Arc<LayerControls> {
        self.controls.clone()
    }

    pub fn base(&self) -> &SourceKind {
        &self.base
    }

    pub(crate) fn latch(&self) -> HatLatch {
        self.latch.clone()
    }

    /// Mix one block into the interleaved stereo buffer. `scratch` must
    /// hold at least `stereo.len() / 2` samples.
    pub fn render_into(&mut self, stereo: &mut [f32], scratch: &mut [f32]) {
        let frames = stereo.len() / 2;
        let scratch = &mut scratch[..frames];
        scratch.fill(0.0);
        for stream in &mut self.streams {
            stream.render_into(scratch);
        }
        let (gl, gr) = self.controls.gains();
        for (i, &v) in scratch.iter().enumerate() {
            stereo[2 * i] += v * gl;
            stereo[2 * i + 1] += v * gr;
        }
    }

    /// Fast-forward every stream without producing output.
    pub fn advance_silent(&mut self, samples: u64) {
        for stream in &mut self.streams {
            stream.advance_silent(samples);
        }
    }

    pub fn rescale(&mut self, ratio: f64) {
        for stream in &mut self.streams {
            stream.rescale(ratio);
        }
    }

    pub fn set_tempo(&mut self, tempo_bpm: f64) {
        self.tempo_bpm = tempo_bpm;
        for stream in &mut self.streams {
            stream.set_tempo(tempo_bpm);
        }
    }

    /// Back to the top of the pattern with a clean slate.
    pub fn reset(&mut self) {
        if let Ok(mut c) = self.carry.lock() {
            *c = 0.0;
        }
        self.latch.clear();
        for stream in &mut self.streams {
            stream.reset();
        }
    }

    /// Swap in a shadow's compiled state, keeping this layer's identity
    /// (controls and latch are already shared by construction).
    pub fn adopt(&mut self, shadow: Layer) {
        self.beat_code = shadow.beat_code;
        self.offset_quarters = shadow.offset_quarters;
        self.total_quarters = shadow.total_quarters;
        self.tempo_bpm = shadow.tempo_bpm;
        self.base = shadow.base;
        self.streams = shadow.streams;
        self.carry = shadow.carry;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReferencePolicy;
    use crate::engine::catalog::SampleData;

    const RATE: u32 = 1000;
    const TEMPO: f64 = 600.0; // 100 samples per quarter

    fn catalog() -> SourceCatalog {
        let mut c = SourceCatalog::new(RATE);
        for _ in 0..3 {
            c.add_file(SampleData::from_mono(vec![0.5; 10], RATE));
        }
        c
    }

    fn build(code: &str, catalog: &SourceCatalog, config: &EngineConfig) -> Layer {
        let codes = vec![code.to_string()];
        Layer::build(&LayerParams {
            beat_code: code,
            offset_code: "",
            base: SourceKind::Pcm(catalog.file(0).unwrap()),
            ctx: RefContext::new(&codes, 0, ReferencePolicy::ClampToFirst),
            catalog,
            config,
            tempo_bpm: TEMPO,
            sample_rate: RATE,
        })
        .unwrap()
    }

    fn render(layer: &mut Layer, frames: usize) -> Vec<f32> {
        let mut stereo = vec![0.0; frames * 2];
        let mut scratch = vec![0.0; frames];
        layer.render_into(&mut stereo, &mut scratch);
        stereo
    }

    #[test]
    fn renders_base_source_pattern() {
        let cat = catalog();
        let mut layer = build("1,1", &cat, &EngineConfig::default());
        let out = render(&mut layer, 120);
        // 10-sample buffer at the head of each 100-sample interval.
        assert!(out[0] != 0.0);
        assert!(out[2 * 50] == 0.0);
        assert!(out[2 * 100] != 0.0);
        assert_eq!(layer.total_quarters(), 2.0);
    }

    #[test]
    fn multiple_sources_mix() {
        let cat = catalog();
        let mut layer = build("1@1,1@2", &cat, &EngineConfig::default());
        let out = render(&mut layer, 200);
        // Source 1 triggers at 0, source 2 at 100.
        assert!(out[0] != 0.0);
        assert!(out[2 * 100] != 0.0);
    }

    #[test]
    fn offset_delays_everything() {
        let cat = catalog();
        let codes = vec!["1,1".to_string()];
        let mut layer = Layer::build(&LayerParams {
            beat_code: "1,1",
            offset_code: "1/2",
            base: SourceKind::Pcm(cat.file(0).unwrap()),
            ctx: RefContext::new(&codes, 0, ReferencePolicy::ClampToFirst),
            catalog: &cat,
            config: &EngineConfig::default(),
            tempo_bpm: TEMPO,
            sample_rate: RATE,
        })
        .unwrap();
        let out = render(&mut layer, 80);
        assert!(out[..2 * 50].iter().all(|&v| v == 0.0));
        assert!(out[2 * 50] != 0.0);
    }

    #[test]
    fn negative_offset_is_rejected() {
        let cat = catalog();
        let codes = vec!["1".to_string()];
        let err = Layer::build(&LayerParams {
            beat_code: "1",
            offset_code: "-1/2",
            base: SourceKind::Pcm(cat.file(0).unwrap()),
            ctx: RefContext::new(&codes, 0, ReferencePolicy::ClampToFirst),
            catalog: &cat,
            config: &EngineConfig::default(),
            tempo_bpm: TEMPO,
            sample_rate: RATE,
        })
        .unwrap_err();
        assert!(err.message.contains("offset"));
    }

    #[test]
    fn tone_base_round_robins_tagged_pitches() {
        let cat = catalog();
        let codes = vec!["1@100hz,1@150hz".to_string()];
        let mut layer = Layer::build(&LayerParams {
            beat_code: &codes[0],
            offset_code: "",
            base: SourceKind::Pitch(100.0),
            ctx: RefContext::new(&codes, 0, ReferencePolicy::ClampToFirst),
            catalog: &cat,
            config: &EngineConfig::default(),
            tempo_bpm: TEMPO,
            sample_rate: RATE,
        })
        .unwrap();
        let out = render(&mut layer, 50);
        assert!(out.iter().any(|&v| v.abs() > 0.1));
    }

    #[test]
    fn volume_and_mute_controls() {
        let cat = catalog();
        let mut layer = build("1", &cat, &EngineConfig::default());
        let controls = layer.controls();

        controls.set_volume(0.5);
        let out = render(&mut layer, 5);
        assert!((out[0].abs() - 0.5 * 0.5 * std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-3);

        controls.set_muted(true);
        layer.reset();
        let out = render(&mut layer, 5);
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn pan_hard_left_zeroes_right() {
        let cat = catalog();
        let mut layer = build("1", &cat, &EngineConfig::default());
        layer.controls().set_pan(-1.0);
        let out = render(&mut layer, 5);
        assert!(out[0] != 0.0);
        assert!(out[1].abs() < 1e-6);
    }

    #[test]
    fn adopt_keeps_controls_and_latch() {
        let cat = catalog();
        let mut live = build("1,1", &cat, &EngineConfig::default());
        let controls = live.controls();
        controls.set_volume(0.25);

        let codes = vec!["1/2(4)".to_string()];
        let shadow = Layer::build_shadow(
            &LayerParams {
                beat_code: &codes[0],
                offset_code: "",
                base: SourceKind::Pcm(cat.file(0).unwrap()),
                ctx: RefContext::new(&codes, 0, ReferencePolicy::ClampToFirst),
                catalog: &cat,
                config: &EngineConfig::default(),
                tempo_bpm: TEMPO,
                sample_rate: RATE,
            },
            &live,
        )
        .unwrap();
        live.adopt(shadow);

        assert_eq!(live.beat_code(), "1/2(4)");
        assert_eq!(live.total_quarters(), 2.0);
        assert!((live.controls().volume() - 0.25).abs() < 1e-6);
        // New pattern triggers every 50 samples.
        let out = render(&mut live, 60);
        assert!(out[0] != 0.0 && out[2 * 50] != 0.0);
    }

    #[test]
    fn too_slow_pattern_fails_build() {
        use crate::dsl::error::ErrorKind;
        let cat = catalog();
        let codes = vec!["100000000000".to_string()];
        let err = Layer::build(&LayerParams {
            beat_code: &codes[0],
            offset_code: "",
            base: SourceKind::Pcm(cat.file(0).unwrap()),
            ctx: RefContext::new(&codes, 0, ReferencePolicy::ClampToFirst),
            catalog: &cat,
            config: &EngineConfig::default(),
            tempo_bpm: 1.0,
            sample_rate: 44100,
        })
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PatternTooSlow);
    }

    #[test]
    fn hat_interlock_across_streams() {
        // Open hat (source 1) rings for 200 samples; closed hat (source 2)
        // is an inaudible buffer, so every non-zero sample below is the
        // open hat's.
        let mut cat = SourceCatalog::new(RATE);
        cat.add_file(SampleData::from_mono(vec![0.5; 10], RATE));
        cat.add_file(SampleData::from_mono(vec![0.5; 200], RATE));
        cat.add_file(SampleData::from_mono(vec![0.0; 1], RATE));
        cat.set_hat_roles(SourceId::File(1), SourceId::File(2));

        // Open triggers at 0 (interval 200), closed at 100 with a
        // 100-sample lead-in. The in-flight open interval must cut at 100.
        let code = "1@1,1@2";
        let codes = vec![code.to_string()];
        let mut layer = Layer::build(&LayerParams {
            beat_code: code,
            offset_code: "",
            base: SourceKind::Pcm(cat.file(0).unwrap()),
            ctx: RefContext::new(&codes, 0, ReferencePolicy::ClampToFirst),
            catalog: &cat,
            config: &EngineConfig::default(),
            tempo_bpm: TEMPO,
            sample_rate: RATE,
        })
        .unwrap();

        let out = render(&mut layer, 400);
        assert!(out[2 * 50] != 0.0);
        assert!(out[2 * 99] != 0.0);
        // Cut lands on the closed trigger's exact sample.
        assert!(out[2 * 100] == 0.0);
        assert!(out[2 * 150] == 0.0);
        // Next open trigger at 200 restarts cleanly; the stale latch
        // position predates the new interval. The next closed trigger at
        // 300 cuts it again.
        assert!(out[2 * 250] != 0.0);
        assert!(out[2 * 299] != 0.0);
        assert!(out[2 * 300] == 0.0);
    }

    #[test]
    fn reset_replays_identically() {
        let cat = catalog();
        let mut layer = build("1,1/2,1/2", &cat, &EngineConfig::default());
        let first = render(&mut layer, 300);
        layer.reset();
        let second = render(&mut layer, 300);
        assert_eq!(first, second);
    }
}
