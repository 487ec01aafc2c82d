//! Validate and dry-run every preset on disk.
//!
//! ```text
//! CADENCE_PRESETS=presets CADENCE_CATALOGUE=catalogue.json cargo run -p cadence-test --bin sim-check
//! ```
//!
//! One trial per preset file. A trial fails when the preset does not load,
//! has validation errors, never casts anything, or runs out of work.

use std::path::PathBuf;
use std::sync::Arc;

use cadence_core::loader::{self, PresetEntry};
use cadence_core::sim::{self, SimEnd, SimOptions, SimOutcome};
use cadence_core::{validate_preset, Catalogue};
use libtest_mimic::{Arguments, Failed, Trial};

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var_os(key).map(PathBuf::from).unwrap_or_else(|| PathBuf::from(default))
}

fn check(entry: &PresetEntry, catalogue: &Catalogue) -> Result<(), Failed> {
    let doc = entry.doc.as_ref().map_err(|e| e.to_string())?;
    let report = validate_preset(doc, catalogue);
    let Some(preset) = report.preset else {
        let errors: Vec<String> = report.diagnostics.errors().map(|d| d.to_string()).collect();
        return Err(errors.join("\n").into());
    };

    let opts = SimOptions { max_ms: 120_000, ..SimOptions::default() };
    let result = sim::simulate(&preset, catalogue, opts).map_err(|e| e.to_string())?;

    if result.count(SimOutcome::Cast) == 0 {
        return Err(format!("{} never cast a skill", preset.id).into());
    }
    if result.end == SimEnd::Idle {
        return Err(format!("{} ran out of work at {}ms", preset.id, result.final_ms).into());
    }
    let unreached = sim::unreached_skills(&preset, &result);
    if !unreached.is_empty() {
        eprintln!("{}: never reached {}", entry.name, unreached.join(", "));
    }
    Ok(())
}

fn main() {
    let args = Arguments::from_args();

    let presets_dir = env_path("CADENCE_PRESETS", "presets");
    let catalogue_path = env_path("CADENCE_CATALOGUE", "catalogue.json");
    let catalogue = match loader::load_catalogue(&catalogue_path) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    let trials = loader::load_presets(&presets_dir)
        .into_iter()
        .map(|entry| {
            let catalogue = Arc::clone(&catalogue);
            Trial::test(entry.name.clone(), move || check(&entry, &catalogue))
        })
        .collect();

    libtest_mimic::run(&args, trials).exit();
}
