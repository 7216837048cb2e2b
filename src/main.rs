use std::io::Write as _;
use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand};
use mixprint::config::Config;
use mixprint::cue;
use mixprint::Engine;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "mixprint", version, about = "Identify tracks within a continuous DJ mix")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print index statistics.
    Stats,
    /// Index the library: fingerprint and feature-summarize every unindexed track.
    Index {
        #[arg(long)]
        mode: Option<String>,
        #[arg(long)]
        limit: Option<i64>,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        verbose: bool,
    },
    /// Identify a single file against the indexed library.
    Identify {
        file: PathBuf,
        #[arg(long = "top-n", default_value_t = 5)]
        top_n: usize,
        #[arg(long = "min-matches")]
        min_matches: Option<usize>,
    },
    /// Analyze a full mix and print a cue sheet.
    Analyze {
        file: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        segment: Option<f32>,
        #[arg(long)]
        overlap: Option<f32>,
        #[arg(long = "min-matches")]
        min_matches: Option<usize>,
        #[arg(long = "min-confidence")]
        min_confidence: Option<f32>,
    },
    /// Wipe all fingerprints and index statuses.
    Clear {
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;

    match cli.command {
        Command::Stats => {
            let engine = Engine::connect(config).await?;
            print_stats(&engine).await
        }
        Command::Index { mode, limit, workers, verbose } => {
            if let Some(w) = workers {
                config.indexing.workers = w;
            }
            let engine = Engine::connect(config).await?;
            run_index(&engine, mode.as_deref(), limit, verbose).await
        }
        Command::Identify { file, top_n, min_matches } => {
            if let Some(m) = min_matches {
                config.matching.min_matches = m;
            }
            let engine = Engine::connect(config).await?;
            run_identify(&engine, &file, top_n).await
        }
        Command::Analyze { file, output, segment, overlap, min_matches, min_confidence } => {
            if let Some(s) = segment {
                config.mix.segment_s = s;
            }
            if let Some(o) = overlap {
                config.mix.overlap_s = o;
            }
            if let Some(m) = min_matches {
                config.matching.min_matches = m;
            }
            if let Some(c) = min_confidence {
                config.matching.min_confidence = c;
            }
            let engine = Engine::connect(config).await?;
            run_analyze(&engine, &file, output.as_deref()).await
        }
        Command::Clear { force } => {
            let engine = Engine::connect(config).await?;
            run_clear(&engine, force).await
        }
    }
}

async fn print_stats(engine: &Engine) -> anyhow::Result<()> {
    let stats = engine.stats().await?;
    println!("tracks:        {} total, {} indexed, {} unindexed", stats.total_tracks, stats.indexed_tracks, stats.unindexed_tracks);
    println!("fingerprints:  {} total, {:.1} avg/track", stats.total_fingerprints, stats.avg_fingerprints_per_track);
    if let Some(last) = stats.last_indexed_at {
        println!("last indexed:  {}", last.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    Ok(())
}

async fn run_index(engine: &Engine, mode: Option<&str>, limit: Option<i64>, verbose: bool) -> anyhow::Result<()> {
    let started = Instant::now();
    let report = engine
        .index(mode, limit, |completed, total| {
            let elapsed = started.elapsed().as_secs_f64();
            let eta = if completed > 0 {
                elapsed / completed as f64 * (total - completed) as f64
            } else {
                0.0
            };
            if verbose {
                println!("indexed {completed}/{total} (elapsed {elapsed:.0}s, eta {eta:.0}s)");
            } else {
                print!("\rindexed {completed}/{total} (eta {eta:.0}s)");
                let _ = std::io::stdout().flush();
            }
        })
        .await?;

    if !verbose {
        println!();
    }
    println!(
        "done: {} indexed, {} skipped (empty audio), {} failed in {:.1}s",
        report.indexed,
        report.skipped,
        report.failed,
        started.elapsed().as_secs_f64()
    );
    for (track_id, reason) in &report.failures {
        error!(track_id, reason, "failed to index track");
    }
    Ok(())
}

async fn run_identify(engine: &Engine, file: &std::path::Path, top_n: usize) -> anyhow::Result<()> {
    let matches = engine.identify_track(file).await?;
    if matches.is_empty() {
        println!("No matches found.");
        return Ok(());
    }
    for (i, m) in matches.iter().take(top_n).enumerate() {
        println!(
            "{}. {} (confidence {:.0}%, offset {:.1}s, {} matches)",
            i + 1,
            m.display_name(),
            m.confidence * 100.0,
            m.track_start_ms as f64 / 1000.0,
            m.match_count
        );
    }
    Ok(())
}

async fn run_analyze(engine: &Engine, file: &std::path::Path, output: Option<&std::path::Path>) -> anyhow::Result<()> {
    info!(file = %file.display(), "analyzing mix");
    let (_, cues) = engine.analyze_mix(file).await?;
    let sheet = cue::format_cue_sheet(&cues);
    println!("{sheet}");
    if let Some(path) = output {
        std::fs::write(path, &sheet)?;
    }
    Ok(())
}

async fn run_clear(engine: &Engine, force: bool) -> anyhow::Result<()> {
    if !force {
        print!("This will delete all fingerprints and index statuses. Continue? [y/N] ");
        std::io::stdout().flush().ok();
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if !answer.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }
    engine.clear().await?;
    println!("Cleared all fingerprints and index statuses.");
    Ok(())
}
