//! Engine configuration, loadable from YAML.
//!
//! Everything here has a sensible default so the engine runs with no config
//! file at all. The CLI loads a YAML file when given one.

use serde::Deserialize;

/// What to do when a `$N` reference points past the current layer count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReferencePolicy {
    /// Legacy behavior: silently clamp to layer 1.
    #[default]
    ClampToFirst,
    /// Fail the compile with `ReferenceOutOfRange`.
    Error,
}

/// The shared audible/silent duty cycle, in quarter notes.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SilenceWindowConfig {
    pub audible_quarters: f64,
    pub silent_quarters: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct EngineConfig {
    pub reference_policy: ReferencePolicy,
    /// Tone envelope decay span, in quarter notes.
    pub tone_decay_quarters: f64,
    /// Audible/silent duty cycle applied to every source, or none.
    pub silence_window: Option<SilenceWindowConfig>,
    /// Per-interval random mute probability, 0..=100.
    pub mute_percent: f32,
    /// Ramp over which the mute probability climbs from zero, in quarters.
    pub mute_ramp_quarters: f64,
    /// Seed for the per-stream mute RNGs.
    pub seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reference_policy: ReferencePolicy::ClampToFirst,
            tone_decay_quarters: 1.0,
            silence_window: None,
            mute_percent: 0.0,
            mute_ramp_quarters: 0.0,
            seed: 0x5eed,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn load(path: &std::path::Path) -> Result<Self, Box<dyn std::error::Error>> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_yaml(&text)?)
    }
}
