//! Cell and sound-source identity types.
//!
//! A [`Cell`] is one atomic timed event: a duration in quarter notes plus an
//! optional source tag. Cells are immutable once compiled; a recompile
//! replaces the whole list.

use self::note::parse_pitch_symbol;
use crate::dsl::error::CompileError;

/// Frequencies are keyed in millihertz so pitch identities are hashable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PitchKey(u64);

impl PitchKey {
    pub fn from_hz(hz: f64) -> Self {
        Self((hz * 1000.0).round() as u64)
    }

    pub fn hz(self) -> f64 {
        self.0 as f64 / 1000.0
    }
}

/// The parsed form of an `@tag` suffix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SourceTag {
    /// `@3` — index into the catalog's sample files.
    File(u32),
    /// `@a4`, `@c#3`, `@440hz`, `@432.5hz` — a synthesized pitch.
    Pitch(f64),
}

impl SourceTag {
    /// Parse a raw tag string. Digits alone are a file index; an `hz`
    /// suffix or a decimal point means a raw frequency; otherwise the tag
    /// must be a note symbol (`a4`, `c#3`, `eb2`).
    pub fn parse(raw: &str) -> Result<Self, CompileError> {
        if raw.is_empty() {
            return Err(CompileError::unknown_source(raw));
        }
        if raw.bytes().all(|b| b.is_ascii_digit()) {
            let idx: u32 = raw.parse().map_err(|_| CompileError::unknown_source(raw))?;
            return Ok(SourceTag::File(idx));
        }
        if let Some(stripped) = raw.strip_suffix("hz").or_else(|| raw.strip_suffix("Hz")) {
            if let Ok(hz) = stripped.parse::<f64>() {
                if hz > 0.0 {
                    return Ok(SourceTag::Pitch(hz));
                }
            }
            return Err(CompileError::unknown_source(raw));
        }
        if raw.contains('.') {
            if let Ok(hz) = raw.parse::<f64>() {
                if hz > 0.0 {
                    return Ok(SourceTag::Pitch(hz));
                }
            }
            return Err(CompileError::unknown_source(raw));
        }
        parse_pitch_symbol(raw)
            .map(SourceTag::Pitch)
            .ok_or_else(|| CompileError::unknown_source(raw))
    }
}

/// Scheduling identity of a sound source within a layer.
///
/// All pitch-tagged cells collapse onto the single [`SourceId::Tone`]
/// stream; the pitches themselves rotate through the tone's round-robin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceId {
    /// The layer's base source (whatever kind it is).
    Base,
    /// The layer's synthesized tone voice.
    Tone,
    /// A sampled file from the catalog.
    File(u32),
}

/// One atomic timed event.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    /// Duration in quarter notes. Always > 0 after compilation.
    pub duration: f64,
    pub tag: Option<SourceTag>,
    pub is_hihat_open: bool,
    pub is_hihat_closed: bool,
}

impl Cell {
    pub fn new(duration: f64, tag: Option<SourceTag>) -> Self {
        Self {
            duration,
            tag,
            is_hihat_open: false,
            is_hihat_closed: false,
        }
    }

    /// The scheduling identity this cell plays on, given whether the
    /// layer's base source is a tone.
    pub fn source_id(&self, base_is_tone: bool) -> SourceId {
        match self.tag {
            None => {
                if base_is_tone {
                    SourceId::Tone
                } else {
                    SourceId::Base
                }
            }
            Some(SourceTag::Pitch(_)) => SourceId::Tone,
            Some(SourceTag::File(idx)) => SourceId::File(idx),
        }
    }
}

/// Note-symbol parsing lives in a tiny submodule so the table stays close
/// to its single consumer.
mod note {
    /// Parse a note symbol like `a4`, `c#3`, or `eb2` into Hz.
    /// A4 = 440 Hz, standard tuning.
    pub fn parse_pitch_symbol(s: &str) -> Option<f64> {
        let chars: Vec<char> = s.chars().collect();
        if chars.is_empty() {
            return None;
        }
        let letter = chars[0].to_ascii_lowercase();
        let base_semitone = match letter {
            'c' => 0i32,
            'd' => 2,
            'e' => 4,
            'f' => 5,
            'g' => 7,
            'a' => 9,
            'b' => 11,
            _ => return None,
        };
        let mut i = 1;
        let accidental = match chars.get(i) {
            Some('#') => {
                i += 1;
                1
            }
            Some('b') if chars.len() > i + 1 => {
                i += 1;
                -1
            }
            _ => 0,
        };
        let octave_str: String = chars[i..].iter().collect();
        if octave_str.is_empty() || !octave_str.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let octave: i32 = octave_str.parse().ok()?;
        let midi = (octave + 1) * 12 + base_semitone + accidental;
        Some(440.0 * 2.0f64.powf((midi as f64 - 69.0) / 12.0))
    }
}
