//! Transport: play state, tempo, the layer bus, and the live-mutation
//! protocol.
//!
//! The render thread calls [`Transport::render`] and nothing else blocks
//! it: pending tempo ratios and pattern edits are flag-checked at the top
//! of each block and applied in bounded work. Edit threads do the slow
//! parts (compiling, fast-forwarding) on their own time and block on the
//! turnstile, a single-slot rendezvous the render thread fills with the
//! current sample position once per block.
//!
//! Ordering rule: when a tempo ratio and an edit swap are both pending at
//! a block boundary, the tempo applies first, so the edit's fast-forward
//! distance is measured in already-rescaled sample units.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};

use super::catalog::{SourceCatalog, SourceKind};
use super::layer::{Layer, LayerControls, LayerParams};
use super::{rational_lcm, samples_per_quarter, BLOCK_FRAMES};
use crate::config::EngineConfig;
use crate::dsl::compile::{CompiledLayer, RefContext};
use crate::dsl::error::CompileError;
use crate::dsl::{compile, expr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Stopped,
    Paused,
    Playing,
}

impl PlayState {
    fn from_u8(v: u8) -> Self {
        match v {
            2 => PlayState::Playing,
            1 => PlayState::Paused,
            _ => PlayState::Stopped,
        }
    }
}

/// Completion handle for a live edit. `landed` flips once the shadow has
/// been swapped into the live layer; `superseded` once a newer edit for
/// the same layer replaced this one (latest wins).
#[derive(Debug, Default)]
struct EditState {
    landed: AtomicBool,
    superseded: AtomicBool,
}

#[derive(Debug, Clone)]
pub struct EditTicket {
    state: Arc<EditState>,
}

impl EditTicket {
    pub fn landed(&self) -> bool {
        self.state.landed.load(Ordering::Acquire)
    }

    pub fn superseded(&self) -> bool {
        self.state.superseded.load(Ordering::Acquire)
    }
}

enum EditPhase {
    /// Waiting for the render thread to publish a position.
    Awaiting(SyncSender<u64>),
    /// The edit thread is fast-forwarding the shadow.
    Forwarding,
    /// Shadow aligned to `advanced_to`; render does the final sub-block
    /// advance and swaps.
    Ready { shadow: Layer, advanced_to: u64 },
}

struct EditSlot {
    layer_index: usize,
    /// New beat code, visible to reference resolution of other edits.
    code: String,
    state: Arc<EditState>,
    phase: EditPhase,
}

struct TempoState {
    /// Most recently requested tempo.
    requested: f64,
    /// Tempo the streams are actually running at.
    current: f64,
    /// Composed old/new ratio waiting for the next block boundary.
    pending_ratio: Option<f64>,
}

struct Bus {
    layers: Vec<Layer>,
    scratch: Vec<f32>,
}

/// The playback transport. Shared by handle; every caller gets an
/// `Arc<Transport>`, there is no global instance.
pub struct Transport {
    bus: Mutex<Bus>,
    edits: Mutex<Vec<EditSlot>>,
    tempo: Mutex<TempoState>,
    state: AtomicU8,
    elapsed_samples: AtomicU64,
    elapsed_quarters: Mutex<f64>,
    catalog: SourceCatalog,
    config: EngineConfig,
    sample_rate: u32,
}

impl Transport {
    pub fn new(catalog: SourceCatalog, config: EngineConfig, tempo_bpm: f64) -> Arc<Self> {
        let sample_rate = catalog.sample_rate();
        Arc::new(Self {
            bus: Mutex::new(Bus {
                layers: Vec::new(),
                scratch: vec![0.0; BLOCK_FRAMES],
            }),
            edits: Mutex::new(Vec::new()),
            tempo: Mutex::new(TempoState {
                requested: tempo_bpm,
                current: tempo_bpm,
                pending_ratio: None,
            }),
            state: AtomicU8::new(0),
            elapsed_samples: AtomicU64::new(0),
            elapsed_quarters: Mutex::new(0.0),
            catalog,
            config,
            sample_rate,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn catalog(&self) -> &SourceCatalog {
        &self.catalog
    }

    pub fn play_state(&self) -> PlayState {
        PlayState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn play(&self) -> PlayState {
        self.state.store(2, Ordering::Release);
        PlayState::Playing
    }

    pub fn pause(&self) -> PlayState {
        if self.play_state() == PlayState::Playing {
            self.state.store(1, Ordering::Release);
        }
        self.play_state()
    }

    /// Stop playback and rewind every layer to the top of its pattern.
    pub fn stop(&self) -> PlayState {
        self.state.store(0, Ordering::Release);
        for layer in &mut lock(&self.bus).layers {
            layer.reset();
        }
        self.elapsed_samples.store(0, Ordering::Release);
        *lock(&self.elapsed_quarters) = 0.0;
        for slot in lock(&self.edits).drain(..) {
            slot.state.superseded.store(true, Ordering::Release);
        }
        PlayState::Stopped
    }

    pub fn tempo_bpm(&self) -> f64 {
        lock(&self.tempo).requested
    }

    /// Tempo the streams are actually running at; trails `tempo_bpm` by up
    /// to one block while a change is cued.
    fn running_tempo(&self) -> f64 {
        lock(&self.tempo).current
    }

    /// Cue a tempo change for the next block boundary. Back-to-back calls
    /// compose their ratios, so only one rescale happens per block.
    pub fn set_tempo(&self, bpm: f64) -> PlayState {
        if bpm > 0.0 {
            let mut t = lock(&self.tempo);
            let ratio = t.requested / bpm;
            t.pending_ratio = Some(t.pending_ratio.unwrap_or(1.0) * ratio);
            t.requested = bpm;
        }
        self.play_state()
    }

    pub fn elapsed_samples(&self) -> u64 {
        self.elapsed_samples.load(Ordering::Acquire)
    }

    pub fn elapsed_quarter_notes(&self) -> f64 {
        *lock(&self.elapsed_quarters)
    }

    /// Quarter notes after which every layer realigns with every other:
    /// the rational LCM of all layer cycle lengths.
    pub fn cycle_length_quarter_notes(&self) -> f64 {
        let bus = lock(&self.bus);
        let totals: Vec<f64> = bus.layers.iter().map(|l| l.total_quarters()).collect();
        rational_lcm(&totals)
    }

    pub fn layer_count(&self) -> usize {
        lock(&self.bus).layers.len()
    }

    pub fn layer_controls(&self, index: usize) -> Option<Arc<LayerControls>> {
        lock(&self.bus).layers.get(index).map(|l| l.controls())
    }

    pub fn layer_code(&self, index: usize) -> Option<String> {
        lock(&self.bus)
            .layers
            .get(index)
            .map(|l| l.beat_code().to_string())
    }

    /// Compile beat code as a hypothetical next layer without mutating
    /// anything. The syntax check the editor runs on every keystroke.
    pub fn compile_layer(
        &self,
        beat_code: &str,
        offset_code: &str,
    ) -> Result<CompiledLayer, CompileError> {
        if !offset_code.trim().is_empty() {
            let v = expr::parse(offset_code)?;
            if v < 0.0 {
                return Err(CompileError::malformed(
                    format!("offset must not be negative: '{offset_code}'"),
                    0,
                ));
            }
        }
        let mut codes = self.code_snapshot();
        codes.push(beat_code.to_string());
        let ctx = RefContext::new(&codes, codes.len() - 1, self.config.reference_policy);
        compile::compile(beat_code, &ctx, &self.catalog, false)
    }

    /// Add a layer to the bus. While playing, the new layer is
    /// fast-forwarded so it joins in phase instead of restarting time.
    pub fn add_layer(
        &self,
        beat_code: &str,
        offset_code: &str,
        base: SourceKind,
    ) -> Result<usize, CompileError> {
        let mut codes = self.code_snapshot();
        let index = codes.len();
        codes.push(beat_code.to_string());
        // Build at the running tempo, not the requested one: a cued change
        // rescales this layer together with the rest of the bus.
        let tempo = self.running_tempo();
        let mut layer = Layer::build(&LayerParams {
            beat_code,
            offset_code,
            base,
            ctx: RefContext::new(&codes, index, self.config.reference_policy),
            catalog: &self.catalog,
            config: &self.config,
            tempo_bpm: tempo,
            sample_rate: self.sample_rate,
        })?;
        if self.play_state() != PlayState::Stopped {
            layer.advance_silent(self.elapsed_samples());
        }
        let mut bus = lock(&self.bus);
        let index = bus.layers.len();
        bus.layers.push(layer);
        Ok(index)
    }

    pub fn remove_layer(&self, index: usize) -> bool {
        let mut bus = lock(&self.bus);
        if index >= bus.layers.len() {
            return false;
        }
        bus.layers.remove(index);
        // Later indices shifted; in-flight edits can no longer land safely.
        for slot in lock(&self.edits).drain(..) {
            slot.state.superseded.store(true, Ordering::Release);
        }
        true
    }

    /// Replace a layer's pattern, glitch-free, while audio keeps running.
    ///
    /// Compiles a shadow on the calling thread, rendezvouses with the
    /// render thread for the playback position, fast-forwards the shadow
    /// to match, and hands it over for an atomic swap at a block boundary.
    /// Blocks the caller until the shadow is handed over (not until it
    /// lands); poll the ticket for completion. A newer edit for the same
    /// layer supersedes this one.
    pub fn edit_layer_live(
        &self,
        index: usize,
        beat_code: &str,
        offset_code: &str,
    ) -> Result<EditTicket, CompileError> {
        let (latch, controls, mut codes) = {
            let bus = lock(&self.bus);
            let layer = bus
                .layers
                .get(index)
                .ok_or_else(|| CompileError::bad_reference(index + 1, bus.layers.len()))?;
            let mut codes: Vec<String> =
                bus.layers.iter().map(|l| l.beat_code().to_string()).collect();
            // References made by this compile see other layers' pending
            // shadows, not their soon-to-be-stale live code.
            for slot in lock(&self.edits).iter() {
                if !slot.state.superseded.load(Ordering::Relaxed) && slot.layer_index < codes.len()
                {
                    codes[slot.layer_index] = slot.code.clone();
                }
            }
            (layer.latch(), layer.controls(), codes)
        };
        codes[index] = beat_code.to_string();

        let mut shadow = Layer::build_with_parts(
            &LayerParams {
                beat_code,
                offset_code,
                base: self.layer_base(index),
                ctx: RefContext::new(&codes, index, self.config.reference_policy),
                catalog: &self.catalog,
                config: &self.config,
                tempo_bpm: self.running_tempo(),
                sample_rate: self.sample_rate,
            },
            latch,
            controls,
        )?;

        let state = Arc::new(EditState::default());
        let ticket = EditTicket {
            state: state.clone(),
        };

        if self.play_state() != PlayState::Playing {
            // No render thread to rendezvous with; align and swap here.
            shadow.advance_silent(self.elapsed_samples());
            let mut bus = lock(&self.bus);
            if index < bus.layers.len() {
                bus.layers[index].adopt(shadow);
                state.landed.store(true, Ordering::Release);
            }
            return Ok(ticket);
        }

        let (tx, rx) = sync_channel(1);
        {
            let mut edits = lock(&self.edits);
            edits.retain(|slot| {
                if slot.layer_index == index {
                    slot.state.superseded.store(true, Ordering::Release);
                    false
                } else {
                    true
                }
            });
            edits.push(EditSlot {
                layer_index: index,
                code: beat_code.to_string(),
                state: state.clone(),
                phase: EditPhase::Awaiting(tx),
            });
        }

        // Turnstile: the render thread publishes its position once.
        let position = match rx.recv() {
            Ok(p) => p,
            // Channel dropped: superseded or stopped before the rendezvous.
            Err(_) => return Ok(ticket),
        };
        shadow.advance_silent(position);
        let mut advanced = position;

        // Catch up to the moving elapsed counter until within one block;
        // the render thread covers the final sub-block delta at swap time.
        loop {
            if state.superseded.load(Ordering::Acquire) {
                return Ok(ticket);
            }
            let live = self.elapsed_samples();
            let delta = live.saturating_sub(advanced);
            if delta <= BLOCK_FRAMES as u64 {
                break;
            }
            shadow.advance_silent(delta);
            advanced = live;
        }

        let mut edits = lock(&self.edits);
        if let Some(slot) = edits
            .iter_mut()
            .find(|slot| Arc::ptr_eq(&slot.state, &state))
        {
            slot.phase = EditPhase::Ready {
                shadow,
                advanced_to: advanced,
            };
        }
        Ok(ticket)
    }

    /// Fill one interleaved stereo block. The only audio-thread entry
    /// point; bounded work, never blocks on a control thread.
    pub fn render(&self, out: &mut [f32]) {
        out.fill(0.0);
        if self.play_state() != PlayState::Playing {
            return;
        }
        let mut bus = lock(&self.bus);

        // 1. Pending tempo ratio, before any edit swap.
        let current_tempo = {
            let mut t = lock(&self.tempo);
            if let Some(ratio) = t.pending_ratio.take() {
                t.current = t.requested;
                for layer in &mut bus.layers {
                    layer.rescale(ratio);
                    layer.set_tempo(t.current);
                }
            }
            t.current
        };

        // 2. Edit turnstile: publish the position to waiting edit threads
        // and land any shadow that finished its catch-up.
        let elapsed = self.elapsed_samples.load(Ordering::Acquire);
        {
            let mut edits = lock(&self.edits);
            edits.retain_mut(|slot| {
                if slot.state.superseded.load(Ordering::Relaxed) {
                    return false;
                }
                match &slot.phase {
                    EditPhase::Awaiting(tx) => {
                        let sent = tx.try_send(elapsed).is_ok();
                        if sent {
                            slot.phase = EditPhase::Forwarding;
                        }
                        true
                    }
                    EditPhase::Forwarding => true,
                    EditPhase::Ready { .. } => {
                        let phase = std::mem::replace(&mut slot.phase, EditPhase::Forwarding);
                        if let EditPhase::Ready {
                            mut shadow,
                            advanced_to,
                        } = phase
                        {
                            // A tempo change may have landed while the
                            // shadow was in flight; bring it onto the
                            // current grid before the swap.
                            let built_at = shadow.tempo_bpm();
                            if built_at != current_tempo {
                                shadow.rescale(built_at / current_tempo);
                                shadow.set_tempo(current_tempo);
                            }
                            shadow.advance_silent(elapsed.saturating_sub(advanced_to));
                            if slot.layer_index < bus.layers.len() {
                                bus.layers[slot.layer_index].adopt(shadow);
                                slot.state.landed.store(true, Ordering::Release);
                            }
                        }
                        false
                    }
                }
            });
        }

        // 3. Mix.
        let frames = out.len() / 2;
        if bus.scratch.len() < frames {
            bus.scratch.resize(frames, 0.0);
        }
        let Bus { layers, scratch } = &mut *bus;
        for layer in layers.iter_mut() {
            layer.render_into(out, scratch);
        }

        self.elapsed_samples
            .fetch_add(frames as u64, Ordering::Release);
        *lock(&self.elapsed_quarters) +=
            frames as f64 / samples_per_quarter(current_tempo, self.sample_rate);
    }

    fn code_snapshot(&self) -> Vec<String> {
        lock(&self.bus)
            .layers
            .iter()
            .map(|l| l.beat_code().to_string())
            .collect()
    }

    fn layer_base(&self, index: usize) -> SourceKind {
        lock(&self.bus)
            .layers
            .get(index)
            .map(|l| l.base().clone())
            .unwrap_or(SourceKind::Pitch(440.0))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
