use std::io;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{mpsc, Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossterm::{
    event::{DisableMouseCapture, EnableMouseCapture},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};

use cadence_core::loader::{self, PresetEntry};
use cadence_core::platform::{create_platform, hotkey};
use cadence_core::sim::{self, SimOptions};
use cadence_core::{logger, validate_preset, Catalogue, Engine, PresetDoc, Settings};

#[derive(Parser)]
#[command(name = "cadence", version, about = "Pixel-gated skill rotation runner")]
struct Cli {
    /// Use the stub platform (no real screen capture or key input)
    #[arg(long)]
    stub: bool,

    /// Directory holding *.json and *.lua presets
    #[arg(long, default_value = "presets")]
    presets: PathBuf,

    #[arg(long, default_value = "catalogue.json")]
    catalogue: PathBuf,

    #[arg(long, default_value = "settings.json")]
    settings: PathBuf,

    #[arg(long, default_value = "logs")]
    logs: PathBuf,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Interactive terminal UI (default)
    Run,
    /// Check a preset against the catalogue and print every finding
    Validate { preset: String },
    /// Dry-run a preset on a virtual clock
    Simulate {
        preset: String,
        #[arg(long)]
        max_ms: Option<u64>,
        #[arg(long)]
        max_nodes: Option<usize>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Grab the capture regions a preset needs and write them as PNGs
    #[cfg(feature = "debug-capture")]
    DumpCapture {
        preset: String,
        #[arg(long, default_value = "logs/capture")]
        out: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    logger::init(&cli.logs).context("failed to initialise logging")?;

    let settings = Settings::load(&cli.settings);
    let catalogue = loader::load_catalogue(&cli.catalogue)
        .with_context(|| format!("failed to load catalogue {}", cli.catalogue.display()))?;
    let catalogue = Arc::new(catalogue);
    let presets = loader::load_presets(&cli.presets);
    tracing::info!("loaded {} preset(s) from {}", presets.len(), cli.presets.display());

    match cli.command.unwrap_or(Cmd::Run) {
        Cmd::Run => run_tui(cli.stub, catalogue, presets, settings, cli.settings),
        Cmd::Validate { preset } => {
            let doc = find_preset(&presets, &preset)?;
            let report = validate_preset(doc, &catalogue);
            for d in report.diagnostics.iter() {
                println!("{}", d);
            }
            if !report.is_ok() {
                bail!("{}: {} error(s)", preset, report.diagnostics.errors().count());
            }
            let probes = report.probes.point_ids.len() + report.probes.skill_pixel_ids.len();
            println!("{}: ok ({} pixel probe(s))", preset, probes);
            Ok(())
        }
        Cmd::Simulate { preset, max_ms, max_nodes, json } => {
            let doc = find_preset(&presets, &preset)?;
            let mut opts = SimOptions::from(&settings);
            if let Some(ms) = max_ms {
                opts.max_ms = ms;
            }
            if let Some(n) = max_nodes {
                opts.max_nodes = n;
            }
            simulate(doc, &catalogue, opts, json)
        }
        #[cfg(feature = "debug-capture")]
        Cmd::DumpCapture { preset, out } => {
            let doc = find_preset(&presets, &preset)?;
            dump_capture(cli.stub, doc, catalogue, &settings, &out)
        }
    }
}

/// Match by file name first, then by preset id.
fn find_preset<'a>(presets: &'a [PresetEntry], key: &str) -> Result<&'a PresetDoc> {
    let entry = presets
        .iter()
        .find(|p| p.name == key)
        .or_else(|| presets.iter().find(|p| p.id() == Some(key)))
        .with_context(|| format!("no preset named {}", key))?;
    entry
        .doc
        .as_ref()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .with_context(|| format!("preset {} failed to load", entry.name))
}

fn simulate(doc: &PresetDoc, catalogue: &Catalogue, opts: SimOptions, json: bool) -> Result<()> {
    let report = validate_preset(doc, catalogue);
    let Some(preset) = report.preset else {
        for d in report.diagnostics.errors() {
            eprintln!("{}", d);
        }
        bail!("{} did not pass validation", doc.id);
    };
    let result = sim::simulate(&preset, catalogue, opts)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    for ev in &result.events {
        println!("{}", ev);
    }
    println!("end: {:?} at {}ms", result.end, result.final_ms);
    for (skill, agg) in &result.metrics {
        println!("  {:<16} success {:>4}  attempts {:>4}", skill, agg.success, agg.attempt_started);
    }
    let unreached = sim::unreached_skills(&preset, &result);
    if !unreached.is_empty() {
        println!("never reached: {}", unreached.join(", "));
    }
    Ok(())
}

#[cfg(feature = "debug-capture")]
fn dump_capture(stub: bool, doc: &PresetDoc, catalogue: Arc<Catalogue>, settings: &Settings, out: &std::path::Path) -> Result<()> {
    use cadence_core::capture::debug::dump_snapshot;
    use cadence_core::capture::manager::CaptureManager;

    let report = validate_preset(doc, &catalogue);
    let Some(preset) = report.preset else { bail!("{} did not pass validation", doc.id) };
    let platform = create_platform(stub, &settings.input);
    let capture = CaptureManager::new(platform.screen(), Arc::clone(&catalogue), settings.capture.clone());
    capture.update_probes(&preset.probes(&catalogue, preset.entry_mode));
    let snap = capture.snapshot().map_err(|u| anyhow::anyhow!("{}: {}", u.code, u.detail))?;
    for path in dump_snapshot(&snap, out)? {
        println!("{}", path.display());
    }
    Ok(())
}

fn run_tui(
    stub: bool,
    catalogue: Arc<Catalogue>,
    presets: Vec<PresetEntry>,
    settings: Settings,
    settings_path: PathBuf,
) -> Result<()> {
    let platform = create_platform(stub, &settings.input);
    tracing::info!("platform: {}", platform.name());
    let engine = Arc::new(Engine::from_platform(catalogue, platform.as_ref(), settings.clone()));

    // Wire logger to TUI
    let (log_tx, log_rx) = mpsc::channel::<String>();
    logger::set_tui_sender(log_tx);

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = cadence_tui::App::new(Arc::clone(&engine), presets, log_rx, settings, settings_path);

    let hotkey_flag = Arc::new(AtomicBool::new(false));
    hotkey::start_hotkey_listener(Arc::clone(&hotkey_flag));

    let result = cadence_tui::event::run(&mut terminal, &mut app, hotkey_flag);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;

    if engine.is_running() {
        let _ = engine.stop("exit");
    }
    result
}
