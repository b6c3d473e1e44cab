//! Scan preprocessing pipeline mixing thread and process workers
//!
//! Pipeline:
//! 1. Source: scan ids, each requested several times
//! 2. Load (thread): fake a scan as a vector of samples
//! 3. Denoise (3 worker processes): smooth the samples
//! 4. Tile (thread): cut each scan into fixed-size tiles
//! 5. Batch: group 8 tiles and stack them into (ids, tiles)
//!
//! The binary re-executes itself for the process-backed stage.
//! Set PREPROCESS_CONFIG to a JSON `PipelineConfig` to tune polling,
//! e.g. `{"poll_interval_ms": 5}`.
//!
//! Usage: RUST_LOG=debug cargo run --example preprocess --release

use staged_pipeline::process::{self, serve_one2one};
use staged_pipeline::{
    combine_batches, pack_args, Many2One, One2Many, One2One, Pipeline, PipelineConfig, Source,
    WorkerCommand,
};
use std::process::ExitCode;
use std::time::Instant;
use tracing::info;

const SAMPLES: usize = 64;
const TILE: usize = 16;

fn load(id: u32) -> (u32, Vec<f32>) {
    let samples = (0..SAMPLES)
        .map(|i| ((id as usize * 7 + i * 13) % 31) as f32)
        .collect();
    (id, samples)
}

fn denoise(id: u32, samples: Vec<f32>) -> (u32, Vec<f32>) {
    let smoothed = samples
        .windows(3)
        .map(|w| (w[0] + w[1] + w[2]) / 3.0)
        .collect();
    (id, smoothed)
}

fn tiles(id: u32, samples: Vec<f32>) -> Vec<(u32, Vec<f32>)> {
    samples
        .chunks(TILE)
        .filter(|chunk| chunk.len() == TILE)
        .map(|chunk| (id, chunk.to_vec()))
        .collect()
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::var("PREPROCESS_CONFIG") {
        Ok(json) => PipelineConfig::from_json(&json)?,
        Err(_) => PipelineConfig::default(),
    };
    let scan_ids: Vec<u32> = (0..25).cycle().take(250).collect();
    let started = Instant::now();

    let mut running = Pipeline::new(Source::new(scan_ids).named("scans").buffer_size(10))
        .then(One2One::new(load).named("load").workers(2))
        .then(
            One2One::process(WorkerCommand::current_exe()?)
                .named("denoise")
                .workers(3)
                .buffer_size(100),
        )
        .then(One2Many::new(pack_args(tiles)).named("tile").buffer_size(50))
        .then(
            Many2One::with_combine(8, combine_batches::<(u32, Vec<f32>)>)
                .named("batch")
                .buffer_size(3),
        )
        .with_config(config)
        .enter()?;

    for stage in running.stages() {
        info!(%stage, "stage ready");
    }

    let mut batches = 0;
    let mut tiles_seen = 0;
    for batch in running.by_ref() {
        let (ids, tiles) = batch?;
        batches += 1;
        tiles_seen += tiles.len();
        if batches % 50 == 0 {
            info!(batches, first_id = ids[0], "progress");
        }
    }

    println!("{batches} batches, {tiles_seen} tiles in {:?}", started.elapsed());
    println!("{}", running.metrics_summary());
    running.exit()?;
    Ok(())
}

fn main() -> ExitCode {
    // Worker processes serve the denoise stage over stdin/stdout
    if process::worker_stage().is_some() {
        return match serve_one2one(|(id, samples): (u32, Vec<f32>)| Ok(denoise(id, samples))) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("denoise worker failed: {err}");
                ExitCode::FAILURE
            }
        };
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("preprocess failed: {err}");
            ExitCode::FAILURE
        }
    }
}
