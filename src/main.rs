mod config;
mod intersect;
mod io;
mod optimizer;
mod pipeline;
mod reconcile;
mod solver;
mod store;

#[cfg(test)]
mod tests;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

const VERSION: &str = "1.3.0";
const SCHEMA_VERSION: &str = "1.0.0";
const CSTNSystems_PROGRAM_ID: &str = "CSTNSystems-CHIMERA";

#[derive(Parser, Debug)]
#[command(name = "chimera")]
#[command(author = "CSTNSystems")]
#[command(version)]
#[command(about = "CSTNSystems/CHIMERA - Gradient-descent shape optimisation orchestrator for external CFD solvers")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Run root directory holding basefiles/ and working/
    #[arg(short, long, global = true, default_value = ".")]
    root: String,

    /// Output path (file or directory)
    #[arg(short, long, global = true)]
    out: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run (or resume) the shape optimisation loop
    Run {
        /// Ignore any resumable history and advance past the last complete
        /// iteration instead of warm-starting from it
        #[arg(long)]
        fresh: bool,
        /// Generate JSON manifest and summary
        #[arg(long)]
        json: bool,
    },
    /// Compile completed iterations into a convergence history
    Results {
        /// Generate JSON outputs
        #[arg(long)]
        json: bool,
    },
    /// Validate a configuration file
    Validate,
    /// Print version information
    Version,
}

// ============================================================================
// JSON Output Structures (result bundles)
// ============================================================================

#[derive(Serialize)]
struct Manifest {
    schema_version: String,
    solver_version: String,
    CSTNSystems_program_id: String,
    timestamp_utc: String,
    git_commit: Option<String>,
    git_dirty: bool,
    platform: String,
    rust_version: String,
    config_hash: String,
    config_snapshot: config::Root,
}

#[derive(Serialize)]
struct RunSummary {
    termination: String,
    converged: bool,
    iterations_complete: usize,
    final_objective: Option<f64>,
    final_step_size: Option<f64>,
    wall_time_s: f64,
}

#[derive(Serialize)]
struct RunBundle {
    manifest: Manifest,
    summary: RunSummary,
}

#[derive(Serialize)]
struct HistoryEntry {
    iteration: u32,
    objective: f64,
    penalty: f64,
    step_size: f64,
    parameters: HashMap<String, f64>,
}

#[derive(Serialize)]
struct ResultsBundle {
    manifest: Manifest,
    history: Vec<HistoryEntry>,
}

// ============================================================================
// Helper Functions
// ============================================================================

fn compute_hash(data: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn get_timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let secs_per_day = 86400u64;
    let days_since_epoch = now / secs_per_day;
    let secs_today = now % secs_per_day;
    let hours = secs_today / 3600;
    let mins = (secs_today % 3600) / 60;
    let secs = secs_today % 60;

    let mut year = 1970u64;
    let mut remaining_days = days_since_epoch;
    loop {
        let days_in_year = if year % 4 == 0 && (year % 100 != 0 || year % 400 == 0) { 366 } else { 365 };
        if remaining_days < days_in_year {
            break;
        }
        remaining_days -= days_in_year;
        year += 1;
    }
    let month_days = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let mut month = 1u64;
    for &days in &month_days {
        let d = if month == 2 && year % 4 == 0 && (year % 100 != 0 || year % 400 == 0) { 29 } else { days };
        if remaining_days < d {
            break;
        }
        remaining_days -= d;
        month += 1;
    }
    let day = remaining_days + 1;

    format!("{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z", year, month, day, hours, mins, secs)
}

fn create_manifest(cfg: &config::Root, cfg_text: &str) -> Manifest {
    Manifest {
        schema_version: SCHEMA_VERSION.to_string(),
        solver_version: VERSION.to_string(),
        CSTNSystems_program_id: CSTNSystems_PROGRAM_ID.to_string(),
        timestamp_utc: get_timestamp(),
        git_commit: None,
        git_dirty: false,
        platform: std::env::consts::OS.to_string(),
        rust_version: "stable".to_string(),
        config_hash: compute_hash(cfg_text),
        config_snapshot: cfg.clone(),
    }
}

fn load_config(path: &str) -> Result<(config::Root, String)> {
    let cfg_text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path))?;
    let cfg: config::Root = toml::from_str(&cfg_text)
        .with_context(|| format!("failed to parse config: {}", path))?;
    cfg.validate()?;
    Ok((cfg, cfg_text))
}

// ============================================================================
// Run Modes
// ============================================================================

fn run_optimise(
    cfg: &config::Root,
    cfg_text: &str,
    root: &Path,
    out_path: &str,
    resume: bool,
    json_output: bool,
) -> Result<()> {
    // Required immutable setup state; refusing to start beats failing five
    // hours into a solver run.
    let base_dir = root.join(&cfg.paths.base_dir);
    if !base_dir.is_dir() {
        bail!("solver base file directory does not exist: {}", base_dir.display());
    }

    let store = store::IterationStore::open(root, &cfg.paths.working_dir)?;
    let cancel = AtomicBool::new(false);
    let mut pipe = pipeline::CfdPipeline::new(
        cfg,
        root,
        Box::new(pipeline::DragReduction),
        &cancel,
    );
    let driver = optimizer::GradientDescent::new(
        &cfg.optimizer,
        &store,
        &cfg.paths.sim_dir_name,
        &cancel,
    );

    let names = cfg.param_names();
    let x0 = cfg.initial_point();

    let start = Instant::now();
    let termination = driver.run(&mut pipe, &names, &x0, resume)?;
    let wall_time_s = start.elapsed().as_secs_f64();

    let completed = store.load_completed()?;
    let last = completed.last();
    eprintln!("[chimera] total run time: {:.2} s", wall_time_s);

    if json_output {
        let json_path = out_path.to_string();
        if let Some(parent) = Path::new(&json_path).parent() {
            fs::create_dir_all(parent)?;
        }
        let bundle = RunBundle {
            manifest: create_manifest(cfg, cfg_text),
            summary: RunSummary {
                termination: termination.to_string(),
                converged: matches!(termination, optimizer::Termination::Converged { .. }),
                iterations_complete: completed.len(),
                final_objective: last.and_then(|(_, r)| r.get("objective").copied()),
                final_step_size: last.and_then(|(_, r)| r.get("step_size").copied()),
                wall_time_s,
            },
        };
        let json = serde_json::to_string_pretty(&bundle)?;
        fs::write(&json_path, json)?;
        eprintln!("[chimera] JSON bundle: {}", json_path);
    }

    Ok(())
}

fn run_results(
    cfg: &config::Root,
    cfg_text: &str,
    root: &Path,
    out_path: &str,
    json_output: bool,
) -> Result<()> {
    let store = store::IterationStore::open(root, &cfg.paths.working_dir)?;
    let completed = store.load_completed()?;
    if completed.is_empty() {
        bail!("no completed iterations under {}", store.working_dir().display());
    }

    if let Some(parent) = Path::new(out_path).parent() {
        fs::create_dir_all(parent)?;
    }
    let names = cfg.param_names();
    let mut w = io::HistoryWriter::create(Path::new(out_path), &names)?;
    w.write_header()?;
    for (ordinal, record) in &completed {
        w.write_row(*ordinal, record)?;
    }
    w.flush()?;

    eprintln!("[chimera] {} completed iterations", completed.len());
    eprintln!("  {:>9} {:>14} {:>12}", "iteration", "objective", "step");
    eprintln!("  {}", "-".repeat(38));
    for (ordinal, record) in &completed {
        eprintln!(
            "  {:>9} {:>14.6e} {:>12.4e}",
            ordinal,
            record.get("objective").copied().unwrap_or(f64::NAN),
            record.get("step_size").copied().unwrap_or(f64::NAN),
        );
    }
    eprintln!("[chimera] history written to: {}", out_path);

    if json_output {
        let json_path = out_path.replace(".csv", ".json");
        let history = completed
            .iter()
            .map(|(ordinal, record)| {
                let parameters = names
                    .iter()
                    .filter_map(|n| record.get(n).map(|v| (n.clone(), *v)))
                    .collect();
                HistoryEntry {
                    iteration: *ordinal,
                    objective: record.get("objective").copied().unwrap_or(f64::NAN),
                    penalty: record.get("penalty").copied().unwrap_or(0.0),
                    step_size: record.get("step_size").copied().unwrap_or(f64::NAN),
                    parameters,
                }
            })
            .collect();
        let bundle = ResultsBundle {
            manifest: create_manifest(cfg, cfg_text),
            history,
        };
        let json = serde_json::to_string_pretty(&bundle)?;
        fs::write(&json_path, json)?;
        eprintln!("[chimera] JSON history: {}", json_path);
    }

    Ok(())
}

fn validate_config(cfg_path: &str) -> Result<()> {
    let (cfg, _) = load_config(cfg_path)?;

    eprintln!("[chimera] config valid: {}", cfg_path);
    eprintln!("  program: {} v{}", cfg.CSTNSystems.program, cfg.CSTNSystems.version);
    eprintln!(
        "  optimizer: max_iterations={}, tolerance={:.0e}, initial_step={}",
        cfg.optimizer.max_iterations, cfg.optimizer.tolerance, cfg.optimizer.initial_step
    );
    eprintln!(
        "  intersection: max_attempts={}, jitter_denom={}, shift_span={}",
        cfg.intersection.max_attempts, cfg.intersection.jitter_denom, cfg.intersection.shift_span
    );
    eprintln!(
        "  matching: target={}, tol=[{:.0e}, {:.0e}]",
        cfg.matching.target_fraction,
        cfg.matching.initial_tolerance,
        cfg.matching.max_tolerance
    );
    eprintln!(
        "  solver: poll={}s, max_restarts={}, adapt_cycles={}, {} fatal signatures",
        cfg.solver.poll_secs,
        cfg.solver.max_restarts,
        cfg.solver.n_adapt_cycles,
        cfg.solver.errors.len()
    );
    eprintln!("  parameters:");
    for p in &cfg.parameters {
        eprintln!("    {:<20} {:>14.6e}", p.name, p.value);
    }

    Ok(())
}

fn print_version() {
    eprintln!("CHIMERA - CSTNSystems Shape Optimisation Orchestrator");
    eprintln!();
    eprintln!("  CSTNSystems Program ID:  {}", CSTNSystems_PROGRAM_ID);
    eprintln!("  Orchestrator Version:    {}", VERSION);
    eprintln!("  Schema Version:          {}", SCHEMA_VERSION);
    eprintln!("  Platform:                {}", std::env::consts::OS);
    eprintln!("  Architecture:            {}", std::env::consts::ARCH);
    eprintln!();
    eprintln!("Pipeline stages:");
    eprintln!("  - prepare: attach to the resumable iteration history");
    eprintln!("  - sensitivity study: external parametric geometry generator");
    eprintln!("  - intersect: perturbation ladder over the boolean toolchain");
    eprintln!("  - simulate: supervised external CFD solver run");
    eprintln!("  - reduce: loads + reconciled sensitivities -> objective/Jacobian");
    eprintln!("  - step: Barzilai-Borwein steepest descent update");
    eprintln!();
    eprintln!("Recovery model:");
    eprintln!("  - iteration directories are re-entrant at every stage");
    eprintln!("  - solver restarts bounded per iteration, never silent");
    eprintln!("  - completion markers written last; resume attaches to the");
    eprintln!("    first incomplete ordinal");
    eprintln!();
    eprintln!("CSTNSystems - Computational Systems for Numerical Engineering");
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<()> {
    let args = Args::parse();
    let root = PathBuf::from(&args.root);

    match args.command {
        Commands::Version => {
            print_version();
            Ok(())
        }
        Commands::Validate => {
            let cfg_path = args.config.context("--config required for validate")?;
            validate_config(&cfg_path)
        }
        Commands::Run { fresh, json } => {
            let cfg_path = args.config.context("--config required")?;
            let out_path = args.out.unwrap_or_else(|| "results/run_summary.json".to_string());

            let (cfg, cfg_text) = load_config(&cfg_path)?;
            eprintln!(
                "[chimera] {} v{} - {}",
                cfg.CSTNSystems.program, cfg.CSTNSystems.version, cfg.CSTNSystems.module
            );
            run_optimise(&cfg, &cfg_text, &root, &out_path, !fresh, json)
        }
        Commands::Results { json } => {
            let cfg_path = args.config.context("--config required")?;
            let out_path = args.out.unwrap_or_else(|| "results/history.csv".to_string());

            let (cfg, cfg_text) = load_config(&cfg_path)?;
            eprintln!(
                "[chimera] {} v{} - {}",
                cfg.CSTNSystems.program, cfg.CSTNSystems.version, cfg.CSTNSystems.module
            );
            run_results(&cfg, &cfg_text, &root, &out_path, json)
        }
    }
}
