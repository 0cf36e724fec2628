//! Beatloom CLI: check beat code, normalize expressions, or play layers
//! through the default audio device.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use beatloom::dsl::{self, expr, RefContext};
use beatloom::engine::cell::{SourceId, SourceTag};
use beatloom::engine::transport::Transport;
use beatloom::engine::DEFAULT_SAMPLE_RATE;
use beatloom::{audio::AudioEngine, EngineConfig, SourceCatalog, SourceKind};

#[derive(Parser)]
#[command(name = "beatloom", version, about = "Beat-code rhythm compiler and loop player")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile beat code and print the resulting cells without playing.
    Check {
        /// Beat code for each layer, in order.
        #[arg(required = true)]
        code: Vec<String>,
        /// YAML engine configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// WAV files registered as @0, @1, ... in argument order.
        #[arg(long)]
        sample: Vec<PathBuf>,
    },
    /// Normalize a duration expression to canonical form.
    Simplify { expr: String },
    /// Play layers in a loop until interrupted.
    Play {
        /// Beat code for each layer, in order.
        #[arg(required = true)]
        code: Vec<String>,
        #[arg(long, default_value_t = 120.0)]
        tempo: f64,
        /// YAML engine configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// WAV files registered as @0, @1, ... in argument order.
        #[arg(long)]
        sample: Vec<PathBuf>,
        /// Base tone frequency for untagged cells when no samples are given.
        #[arg(long, default_value_t = 440.0)]
        tone: f64,
        /// Catalog index of the open hi-hat sample.
        #[arg(long)]
        open_hat: Option<u32>,
        /// Catalog index of the closed hi-hat sample.
        #[arg(long)]
        closed_hat: Option<u32>,
        /// Stop after this many seconds instead of waiting for ctrl-c.
        #[arg(long)]
        seconds: Option<f64>,
    },
}

fn main() {
    if let Err(e) = run(Cli::parse()) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Check {
            code,
            config,
            sample,
        } => check(&code, config.as_deref(), &sample),
        Command::Simplify { expr } => {
            println!("{}", expr::simplify(&expr)?);
            Ok(())
        }
        Command::Play {
            code,
            tempo,
            config,
            sample,
            tone,
            open_hat,
            closed_hat,
            seconds,
        } => play(
            &code,
            tempo,
            config.as_deref(),
            &sample,
            tone,
            open_hat,
            closed_hat,
            seconds,
        ),
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    match path {
        Some(p) => EngineConfig::load(p),
        None => Ok(EngineConfig::default()),
    }
}

fn build_catalog(
    samples: &[PathBuf],
    open_hat: Option<u32>,
    closed_hat: Option<u32>,
) -> Result<SourceCatalog, Box<dyn std::error::Error>> {
    let mut catalog = SourceCatalog::new(DEFAULT_SAMPLE_RATE);
    for path in samples {
        let idx = catalog.add_wav_file(path)?;
        println!("loaded @{idx}: {}", path.display());
    }
    if let (Some(open), Some(closed)) = (open_hat, closed_hat) {
        catalog.set_hat_roles(SourceId::File(open), SourceId::File(closed));
    }
    Ok(catalog)
}

fn check(
    codes: &[String],
    config: Option<&Path>,
    samples: &[PathBuf],
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config)?;
    let catalog = build_catalog(samples, None, None)?;
    let base_is_tone = samples.is_empty();

    for (i, code) in codes.iter().enumerate() {
        let ctx = RefContext::new(codes, i, config.reference_policy);
        let compiled = dsl::compile(code, &ctx, &catalog, base_is_tone)?;
        println!(
            "layer {}: {} cells, {} quarter notes per cycle",
            i + 1,
            compiled.cells.len(),
            compiled.total_quarters
        );
        for cell in &compiled.cells {
            let tag = match &cell.tag {
                Some(SourceTag::File(n)) => format!(" @{n}"),
                Some(SourceTag::Pitch(hz)) => format!(" @{hz}hz"),
                None => String::new(),
            };
            println!("  {}{}", cell.duration, tag);
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn play(
    codes: &[String],
    tempo: f64,
    config: Option<&Path>,
    samples: &[PathBuf],
    tone: f64,
    open_hat: Option<u32>,
    closed_hat: Option<u32>,
    seconds: Option<f64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config)?;
    let catalog = build_catalog(samples, open_hat, closed_hat)?;

    let base = match catalog.file(0) {
        Some(data) if !samples.is_empty() => SourceKind::Pcm(data),
        _ => SourceKind::Pitch(tone),
    };

    let transport = Transport::new(catalog, config, tempo);
    for code in codes {
        transport.add_layer(code, "", base.clone())?;
    }

    let engine = AudioEngine::new(transport.clone())?;
    println!(
        "beatloom v{} — {} layer(s) at {} BPM, {} Hz, {} ch",
        env!("CARGO_PKG_VERSION"),
        transport.layer_count(),
        tempo,
        engine.sample_rate(),
        engine.channels()
    );
    println!(
        "cycle realigns every {} quarter notes",
        transport.cycle_length_quarter_notes()
    );

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))?;
    }

    transport.play();
    let started = Instant::now();
    while running.load(Ordering::SeqCst) {
        if let Some(limit) = seconds {
            if started.elapsed().as_secs_f64() >= limit {
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    println!(
        "stopping after {:.1} quarter notes",
        transport.elapsed_quarter_notes()
    );
    transport.stop();
    Ok(())
}
