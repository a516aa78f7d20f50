use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use maskrelay_contracts::events::EventWriter;
use maskrelay_contracts::items::{ItemReport, ItemState};
use maskrelay_contracts::runs::summary::write_summary;
use maskrelay_engine::config::{
    RequestOptions, ServerConfig, TransportKind, DEFAULT_STREAMING_URL, DEFAULT_UNARY_MODE,
};
use maskrelay_engine::driver::{new_run_id, BatchDriver};
use maskrelay_engine::inputs::{collect_images, work_items};
use maskrelay_engine::probe::{probe_prompts, save_probe_result, DEFAULT_PROBE_CONFIDENCE};
use maskrelay_engine::store::ResultStore;
use maskrelay_engine::transport::ServerConnector;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "maskrelay",
    version,
    about = "Batch client for a remote segmentation server"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Segment every image in a directory, resuming where a previous run stopped.
    Segment(SegmentArgs),
    /// Try several prompts against one image and keep the first that yields a mask.
    Probe(ProbeArgs),
}

#[derive(Debug, Parser)]
struct SegmentArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    output: PathBuf,
    /// Text prompt; required for ws:// servers.
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long, default_value = DEFAULT_STREAMING_URL)]
    url: String,
    /// Mode field sent to http:// servers.
    #[arg(long, default_value = DEFAULT_UNARY_MODE)]
    mode: String,
    #[arg(long)]
    confidence: Option<f64>,
    /// Defaults to `<output>/events.jsonl`.
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ProbeArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long = "prompt", required = true)]
    prompts: Vec<String>,
    #[arg(long, default_value = DEFAULT_STREAMING_URL)]
    url: String,
    #[arg(long, default_value_t = DEFAULT_PROBE_CONFIDENCE)]
    confidence: f64,
    #[arg(long, default_value = DEFAULT_SWEEP_ARCHIVE)]
    output: PathBuf,
    /// Source image with the mask tinted green.
    #[arg(long, default_value = DEFAULT_SWEEP_OVERLAY)]
    overlay: PathBuf,
}

const INTERRUPTED_EXIT_CODE: i32 = 130;
const DEFAULT_SWEEP_ARCHIVE: &str = "masks.npz";
const DEFAULT_SWEEP_OVERLAY: &str = "final_debug.png";

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("maskrelay error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("MASKRELAY_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Segment(args) => {
            let stop = Arc::new(AtomicBool::new(false));
            let handler_flag = stop.clone();
            ctrlc::set_handler(move || {
                handler_flag.store(true, Ordering::SeqCst);
            })
            .context("failed to install Ctrl-C handler")?;
            run_segment(args, stop)
        }
        Command::Probe(args) => run_probe(args),
    }
}

fn run_segment(args: SegmentArgs, stop: Arc<AtomicBool>) -> Result<i32> {
    let options = RequestOptions {
        confidence: args.confidence,
        mode: args.mode.clone(),
    };
    let config = ServerConfig::parse(&args.url, options)?;
    let prompt = args
        .prompt
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let prompt = match (config.kind, prompt) {
        (TransportKind::Streaming, None) => bail!("--prompt is required for {}", config.url),
        (_, prompt) => prompt.unwrap_or_default().to_string(),
    };

    let images = collect_images(&args.input)?;
    if images.is_empty() {
        println!("No images found in {}", args.input.display());
        return Ok(0);
    }
    let items = work_items(&images, &prompt)?;

    let store = ResultStore::create(&args.output)?;
    let mut state = store.scan()?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.output.join("events.jsonl"));
    let summary_path = summary_path_for(&events_path);
    let events = EventWriter::new(&events_path, new_run_id());

    let connector = ServerConnector::new(config.clone()).with_stop_flag(stop.clone());
    let driver = BatchDriver::new(&connector, &store, config.request.clone(), events)
        .with_stop_flag(stop);
    let outcome = driver.run(&items, &mut state, &mut print_progress)?;
    write_summary(&summary_path, &outcome.summary)?;

    let summary = &outcome.summary;
    println!(
        "Done: {} stored, {} skipped, {} failed of {} ({})",
        summary.stored,
        summary.skipped,
        summary.failed.len(),
        summary.total,
        summary_path.display()
    );
    if let Some(err) = outcome.abort {
        bail!("{err} (rerun to resume; {} item(s) not processed)", summary.unvisited());
    }
    if summary.interrupted {
        println!("Interrupted; rerun the same command to resume.");
        return Ok(INTERRUPTED_EXIT_CODE);
    }
    Ok(0)
}

fn summary_path_for(events_path: &Path) -> PathBuf {
    events_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(|parent| parent.join("summary.json"))
        .unwrap_or_else(|| PathBuf::from("summary.json"))
}

fn print_progress(report: &ItemReport) {
    println!("{}", progress_line(report));
}

fn progress_line(report: &ItemReport) -> String {
    let mut line = format!(
        "[{}/{}] {}: {}",
        report.index, report.total, report.identity, report.state
    );
    if report.state == ItemState::Failed {
        if let Some(detail) = report.detail.as_deref() {
            line.push_str(&format!(" ({detail})"));
        }
    }
    line
}

fn run_probe(args: ProbeArgs) -> Result<i32> {
    if !args.input.is_file() {
        bail!("input image does not exist: {}", args.input.display());
    }
    let options = RequestOptions {
        confidence: Some(args.confidence),
        ..RequestOptions::default()
    };
    let config = ServerConfig::parse(&args.url, options)?;
    let connector = ServerConnector::new(config.clone());
    let outcome = probe_prompts(&connector, &args.input, &args.prompts, &config.request)?;

    for attempt in &outcome.attempts {
        match attempt.failure.as_deref() {
            None => println!("{}: mask found", attempt.prompt),
            Some(reason) => println!("{}: {reason}", attempt.prompt),
        }
    }
    let Some((prompt, mask)) = outcome.matched.as_ref() else {
        println!("No prompt produced a mask.");
        return Ok(0);
    };
    save_probe_result(&args.input, mask, &args.output, &args.overlay)?;
    println!("Best prompt: {prompt}");
    println!("Mask saved to {}", args.output.display());
    println!("Overlay saved to {}", args.overlay.display());
    Ok(0)
}
