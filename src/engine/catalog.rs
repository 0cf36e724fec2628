//! Sound-source catalog: maps source identities to either a synthesized
//! pitch or a PCM sample buffer.
//!
//! The catalog is the engine's only window onto the outside world's sounds.
//! It also designates which sources play the open and closed hi-hat roles;
//! the compiler marks matching cells so the interlock can find them.

use std::io::{Read, Seek};
use std::path::Path;
use std::sync::Arc;

use super::cell::{SourceId, SourceTag};

/// Errors raised while loading PCM data into the catalog.
#[derive(Debug)]
pub enum CatalogError {
    Wav(hound::Error),
    Io(std::io::Error),
    /// The decoded file contained no frames.
    EmptySample,
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::Wav(e) => write!(f, "WAV error: {e}"),
            CatalogError::Io(e) => write!(f, "I/O error: {e}"),
            CatalogError::EmptySample => write!(f, "sample file contains no frames"),
        }
    }
}

impl std::error::Error for CatalogError {}

impl From<hound::Error> for CatalogError {
    fn from(e: hound::Error) -> Self {
        CatalogError::Wav(e)
    }
}

impl From<std::io::Error> for CatalogError {
    fn from(e: std::io::Error) -> Self {
        CatalogError::Io(e)
    }
}

/// A mono PCM buffer at the engine sample rate.
#[derive(Debug, Clone)]
pub struct SampleData {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl SampleData {
    pub fn from_mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Decode a WAV stream to mono f32 at `target_rate`. Multi-channel
    /// input is averaged down; rate mismatches are fixed by linear
    /// interpolation.
    pub fn from_wav<R: Read + Seek>(reader: R, target_rate: u32) -> Result<Self, CatalogError> {
        let wav = hound::WavReader::new(reader)?;
        let spec = wav.spec();
        let channels = spec.channels as usize;
        let source_rate = spec.sample_rate;

        let raw: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Int => {
                let scale = (1u32 << (spec.bits_per_sample - 1)) as f32;
                wav.into_samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()?
            }
            hound::SampleFormat::Float => wav.into_samples::<f32>().collect::<Result<_, _>>()?,
        };
        if raw.is_empty() {
            return Err(CatalogError::EmptySample);
        }

        let mono: Vec<f32> = raw
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();

        let samples = if source_rate == target_rate {
            mono
        } else {
            resample_linear(&mono, source_rate, target_rate)
        };
        Ok(Self {
            samples,
            sample_rate: target_rate,
        })
    }

    pub fn from_wav_file(path: &Path, target_rate: u32) -> Result<Self, CatalogError> {
        let file = std::fs::File::open(path)?;
        Self::from_wav(std::io::BufReader::new(file), target_rate)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

fn resample_linear(input: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if input.len() < 2 {
        return input.to_vec();
    }
    let ratio = source_rate as f64 / target_rate as f64;
    let out_len = (input.len() as f64 / ratio).ceil() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;
        let v = if idx + 1 < input.len() {
            input[idx] * (1.0 - frac) + input[idx + 1] * frac
        } else {
            input[input.len() - 1]
        };
        out.push(v);
    }
    out
}

/// What a source identity actually produces.
#[derive(Debug, Clone)]
pub enum SourceKind {
    /// Synthesized tone at the given frequency.
    Pitch(f64),
    /// Sampled PCM playback.
    Pcm(Arc<SampleData>),
}

/// The catalog of available sound sources.
#[derive(Debug, Clone)]
pub struct SourceCatalog {
    files: Vec<Arc<SampleData>>,
    /// Substitute for an out-of-range file index, if configured.
    default_file: Option<Arc<SampleData>>,
    open_hat: Option<SourceId>,
    closed_hat: Option<SourceId>,
    sample_rate: u32,
}

impl SourceCatalog {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            files: Vec::new(),
            default_file: None,
            open_hat: None,
            closed_hat: None,
            sample_rate,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Register a PCM buffer; returns its file index.
    pub fn add_file(&mut self, data: SampleData) -> u32 {
        self.files.push(Arc::new(data));
        (self.files.len() - 1) as u32
    }

    pub fn add_wav_file(&mut self, path: &Path) -> Result<u32, CatalogError> {
        let data = SampleData::from_wav_file(path, self.sample_rate)?;
        Ok(self.add_file(data))
    }

    /// Configure the substitute used for unknown file indices. Without one,
    /// compiles referencing a missing file fail.
    pub fn set_default_file(&mut self, data: SampleData) {
        self.default_file = Some(Arc::new(data));
    }

    /// Designate the hi-hat roles.
    pub fn set_hat_roles(&mut self, open: SourceId, closed: SourceId) {
        self.open_hat = Some(open);
        self.closed_hat = Some(closed);
    }

    pub fn is_open_hat(&self, id: SourceId) -> bool {
        self.open_hat == Some(id)
    }

    pub fn is_closed_hat(&self, id: SourceId) -> bool {
        self.closed_hat == Some(id)
    }

    /// Whether a tag can be satisfied, directly or via the default.
    pub fn knows(&self, tag: &SourceTag) -> bool {
        match tag {
            SourceTag::Pitch(_) => true,
            SourceTag::File(idx) => {
                (*idx as usize) < self.files.len() || self.default_file.is_some()
            }
        }
    }

    /// PCM buffer for a file index, falling back to the default substitute.
    pub fn file(&self, idx: u32) -> Option<Arc<SampleData>> {
        self.files
            .get(idx as usize)
            .cloned()
            .or_else(|| self.default_file.clone())
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}
