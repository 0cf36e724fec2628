//! Beatloom — a beat-code compiler and sample-accurate loop engine.
//!
//! Beat code is a terse rhythm notation: comma-separated duration
//! expressions in quarter notes, with repeat groups, multiply groups,
//! cross-layer references, and per-cell sound-source tags. This crate
//! compiles it into per-source interval schedules and renders the result
//! as endlessly looping audio that can be re-tempoed and re-patterned
//! while it plays.

pub mod audio;
pub mod config;
pub mod dsl;
pub mod engine;

pub use config::{EngineConfig, ReferencePolicy, SilenceWindowConfig};
pub use dsl::{CompileError, CompiledLayer, ErrorKind};
pub use engine::catalog::{SampleData, SourceCatalog, SourceKind};
pub use engine::layer::LayerControls;
pub use engine::transport::{EditTicket, PlayState, Transport};
