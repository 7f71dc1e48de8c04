use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Root {
    pub CSTNSystems: CSTNSystems,
    #[serde(default)]
    pub paths: Paths,
    pub freestream: Freestream,
    #[serde(default)]
    pub optimizer: Optimizer,
    #[serde(default)]
    pub intersection: Intersection,
    #[serde(default)]
    pub matching: Matching,
    #[serde(default)]
    pub solver: Solver,
    pub generator: Generator,
    pub sensitivity: Sensitivity,
    #[serde(rename = "parameter")]
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CSTNSystems {
    pub program: String,
    pub module: String,
    pub version: String,
}

/// One design parameter. The order of [[parameter]] tables fixes the ordering
/// of the design-point vector and the Jacobian everywhere downstream.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Parameter {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Paths {
    /// Immutable solver setup files; a missing directory is fatal.
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    #[serde(default = "default_sim_dir")]
    pub sim_dir_name: String,
}

fn default_base_dir() -> String { "basefiles".to_string() }
fn default_working_dir() -> String { "working".to_string() }
fn default_sim_dir() -> String { "simulation".to_string() }

impl Default for Paths {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            working_dir: default_working_dir(),
            sim_dir_name: default_sim_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Freestream {
    pub rho: f64,
    pub velocity: f64,
    pub sound_speed: f64,
    pub ref_area: f64,
    /// Angle of attack, degrees. Rotates body-frame force sensitivities
    /// into the wind frame.
    #[serde(default)]
    pub aoa_deg: f64,
}

impl Freestream {
    pub fn dynamic_pressure(&self) -> f64 {
        0.5 * self.rho * self.velocity * self.velocity
    }

    pub fn aoa_rad(&self) -> f64 {
        self.aoa_deg.to_radians()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Optimizer {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Relative objective change below which the search terminates.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Step size for the first iteration, before a secant pair exists.
    #[serde(default = "default_initial_step")]
    pub initial_step: f64,
    /// Upper clamp on the Barzilai-Borwein step. None = unclamped.
    pub max_step: Option<f64>,
    /// Loads-report key minimised by the built-in reduction.
    #[serde(default = "default_objective_key")]
    pub objective_key: String,
}

fn default_max_iterations() -> u32 { 10 }
fn default_tolerance() -> f64 { 1e-3 }
fn default_initial_step() -> f64 { 0.05 }
fn default_objective_key() -> String { "C_D-entire".to_string() }

impl Default for Optimizer {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            tolerance: default_tolerance(),
            initial_step: default_initial_step(),
            max_step: None,
            objective_key: default_objective_key(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Intersection {
    /// Bound on the rigid-transform retry ladder.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Jitter offsets are drawn from [0, 1/jitter_denom) per axis.
    #[serde(default = "default_jitter_denom")]
    pub jitter_denom: f64,
    /// Rigid translation components drawn from [0, shift_span).
    #[serde(default = "default_shift_span")]
    pub shift_span: f64,
    /// Rigid rotation angles drawn from [0, rotation_span_deg) degrees.
    #[serde(default = "default_rotation_span")]
    pub rotation_span_deg: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_max_attempts() -> u32 { 6 }
fn default_jitter_denom() -> f64 { 1000.0 }
fn default_shift_span() -> f64 { 10.0 }
fn default_rotation_span() -> f64 { 10.0 }
fn default_seed() -> u64 { 42 }

impl Default for Intersection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            jitter_denom: default_jitter_denom(),
            shift_span: default_shift_span(),
            rotation_span_deg: default_rotation_span(),
            seed: default_seed(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Matching {
    /// Minimum accepted fraction of mesh vertices bound to a sensitivity row.
    #[serde(default = "default_target_fraction")]
    pub target_fraction: f64,
    #[serde(default = "default_initial_tolerance")]
    pub initial_tolerance: f64,
    #[serde(default = "default_max_tolerance")]
    pub max_tolerance: f64,
}

fn default_target_fraction() -> f64 { 0.9 }
fn default_initial_tolerance() -> f64 { 1e-5 }
fn default_max_tolerance() -> f64 { 0.1 }

impl Default for Matching {
    fn default() -> Self {
        Self {
            target_fraction: default_target_fraction(),
            initial_tolerance: default_initial_tolerance(),
            max_tolerance: default_max_tolerance(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Solver {
    /// Fresh-run launch command, issued in the simulation directory.
    #[serde(default = "default_run_cmd")]
    pub run: String,
    #[serde(default = "default_log_name")]
    pub log: String,
    #[serde(default = "default_loads_file")]
    pub loads_file: String,
    #[serde(default = "default_done_file")]
    pub done_file: String,
    /// Refinement cycles the solver is configured for. Names the sentinel
    /// directory of a fresh run (adaptNN/FLOW). Explicit here so no stage
    /// ever re-derives it from script files.
    #[serde(default = "default_adapt_cycles")]
    pub n_adapt_cycles: u32,
    #[serde(default = "default_poll_secs")]
    pub poll_secs: f64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Fatal log signatures, matched verbatim against the log tail.
    #[serde(default = "default_error_signatures")]
    pub errors: Vec<String>,
    /// Setup files staged from base_dir into fresh simulation directories.
    #[serde(default = "default_input_files")]
    pub input_files: Vec<String>,
    /// Mesh preparation command for fresh runs. Empty string disables it.
    #[serde(default = "default_mesh_setup")]
    pub mesh_setup: String,
    /// File whose presence marks mesh setup as already done.
    #[serde(default = "default_mesh_setup_output")]
    pub mesh_setup_output: String,
    #[serde(default)]
    pub warmstart: Warmstart,
}

fn default_run_cmd() -> String { "./aero.csh restart".to_string() }
fn default_log_name() -> String { "solver.log".to_string() }
fn default_loads_file() -> String { "loadsCC.dat".to_string() }
fn default_done_file() -> String { "DONE".to_string() }
fn default_adapt_cycles() -> u32 { 3 }
fn default_poll_secs() -> f64 { 5.0 }
fn default_max_restarts() -> u32 { 3 }
fn default_mesh_setup() -> String { "autoInputs -r 2".to_string() }
fn default_mesh_setup_output() -> String { "input.c3d".to_string() }

fn default_error_signatures() -> Vec<String> {
    [
        "==> ADAPT failed",
        "Check cart3d.out in AD_A_J for more clues",
        "==> adjointErrorEst_quad failed again, status = 1",
        "ERROR: CUBES failed",
        "ERROR: ADAPT failed with status = 1",
        "ERROR",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_input_files() -> Vec<String> {
    vec!["input.cntl".to_string(), "aero.csh".to_string()]
}

impl Default for Solver {
    fn default() -> Self {
        Self {
            run: default_run_cmd(),
            log: default_log_name(),
            loads_file: default_loads_file(),
            done_file: default_done_file(),
            n_adapt_cycles: default_adapt_cycles(),
            poll_secs: default_poll_secs(),
            max_restarts: default_max_restarts(),
            errors: default_error_signatures(),
            input_files: default_input_files(),
            mesh_setup: default_mesh_setup(),
            mesh_setup_output: default_mesh_setup_output(),
            warmstart: Warmstart::default(),
        }
    }
}

impl Solver {
    pub fn poll(&self) -> Duration {
        Duration::from_secs_f64(self.poll_secs)
    }

    /// Sentinel directory of a fresh multi-refinement run.
    pub fn adapt_dir(&self) -> String {
        format!("adapt{:02}", self.n_adapt_cycles)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Warmstart {
    /// Configuration files copied from the prior simulation directory.
    #[serde(default = "default_warm_copy")]
    pub copy_files: Vec<String>,
    /// Large mesh-metadata files referenced by symlink, not copied.
    /// Linked as ref<basename> in the new simulation directory.
    #[serde(default = "default_warm_links")]
    pub link_files: Vec<String>,
    /// Directory (relative to the prior simulation dir) holding checkpoints.
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: String,
    /// Checkpoint filename prefix; the newest match is carried over.
    #[serde(default = "default_checkpoint_prefix")]
    pub checkpoint_prefix: String,
    /// Remeshing commands re-run before every warm-started (re)launch.
    #[serde(default = "default_remesh")]
    pub remesh: Vec<String>,
    /// Checkpoint remap command. {checkpoint} expands to the carried file.
    #[serde(default = "default_remap")]
    pub remap: String,
    /// Warm-start launch command.
    #[serde(default = "default_warm_run")]
    pub run: String,
}

fn default_warm_copy() -> Vec<String> {
    ["input.cntl", "input.c3d", "Config.xml"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_warm_links() -> Vec<String> {
    ["BEST/Mesh.c3d.Info", "BEST/Mesh.mg.c3d"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_checkpoint_dir() -> String { "BEST/FLOW".to_string() }
fn default_checkpoint_prefix() -> String { "check".to_string() }

fn default_remesh() -> Vec<String> {
    vec!["cubes -remesh".to_string(), "mgPrep".to_string()]
}

fn default_remap() -> String {
    "mesh2mesh -v -m1 refMesh.mg.c3d -m2 Mesh.mg.c3d -q1 {checkpoint} -q2 Restart.file"
        .to_string()
}

fn default_warm_run() -> String { "flowCart -restart".to_string() }

impl Default for Warmstart {
    fn default() -> Self {
        Self {
            copy_files: default_warm_copy(),
            link_files: default_warm_links(),
            checkpoint_dir: default_checkpoint_dir(),
            checkpoint_prefix: default_checkpoint_prefix(),
            remesh: default_remesh(),
            remap: default_remap(),
            run: default_warm_run(),
        }
    }
}

/// External geometry generator: run in the iteration directory, consumes
/// parameters.csv, produces *.patch.csv surfaces and per-component
/// sensitivity tables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Generator {
    pub command: String,
    /// Finite-difference perturbation handed to the generator.
    #[serde(default = "default_perturbation")]
    pub perturbation: f64,
    /// Intersection toolchain: component merge command ({files} expands to
    /// the patch file list), boolean intersect command, and result file.
    #[serde(default = "default_merge_cmd")]
    pub merge: String,
    #[serde(default = "default_intersect_cmd")]
    pub intersect: String,
    #[serde(default = "default_result_file")]
    pub result_file: String,
}

fn default_perturbation() -> f64 { 2.0 }
fn default_merge_cmd() -> String { "comp2tri -makeGMPtags {files} -config".to_string() }
fn default_intersect_cmd() -> String { "intersect".to_string() }
fn default_result_file() -> String { "Components.i.tri.csv".to_string() }

/// External flow-sensitivity solver: run in the iteration directory,
/// consumes the consolidated sensitivity table and the solver solution,
/// produces F_sensitivities.csv.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Sensitivity {
    pub command: String,
}

impl Root {
    pub fn param_names(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.name.clone()).collect()
    }

    pub fn initial_point(&self) -> Vec<f64> {
        self.parameters.iter().map(|p| p.value).collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.CSTNSystems.program != "CSTNSystems" {
            bail!("CSTNSystems.program must be CSTNSystems");
        }
        if self.parameters.is_empty() {
            bail!("at least one [[parameter]] table is required");
        }
        for (i, p) in self.parameters.iter().enumerate() {
            if p.name.is_empty() {
                bail!("parameter {} has an empty name", i);
            }
            if self.parameters[..i].iter().any(|q| q.name == p.name) {
                bail!("duplicate parameter name: {}", p.name);
            }
        }

        if self.freestream.rho <= 0.0 {
            bail!("freestream.rho must be positive");
        }
        if self.freestream.velocity <= 0.0 {
            bail!("freestream.velocity must be positive");
        }
        if self.freestream.sound_speed <= 0.0 {
            bail!("freestream.sound_speed must be positive");
        }
        if self.freestream.ref_area <= 0.0 {
            bail!("freestream.ref_area must be positive");
        }
        if !(-90.0..=90.0).contains(&self.freestream.aoa_deg) {
            bail!("freestream.aoa_deg must be in [-90, 90]");
        }

        if self.optimizer.max_iterations == 0 || self.optimizer.max_iterations > 10_000 {
            bail!("optimizer.max_iterations must be in [1, 10000]");
        }
        if self.optimizer.tolerance <= 0.0 {
            bail!("optimizer.tolerance must be positive");
        }
        if self.optimizer.initial_step <= 0.0 {
            bail!("optimizer.initial_step must be positive");
        }
        if let Some(ms) = self.optimizer.max_step {
            if ms <= 0.0 {
                bail!("optimizer.max_step must be positive");
            }
        }
        if self.optimizer.objective_key.is_empty() {
            bail!("optimizer.objective_key must not be empty");
        }

        if self.intersection.max_attempts == 0 || self.intersection.max_attempts > 100 {
            bail!("intersection.max_attempts must be in [1, 100]");
        }
        if self.intersection.jitter_denom <= 0.0 {
            bail!("intersection.jitter_denom must be positive");
        }
        if self.intersection.shift_span <= 0.0 {
            bail!("intersection.shift_span must be positive");
        }
        if self.intersection.rotation_span_deg <= 0.0
            || self.intersection.rotation_span_deg > 180.0
        {
            bail!("intersection.rotation_span_deg must be in (0, 180]");
        }

        if self.matching.target_fraction <= 0.0 || self.matching.target_fraction > 1.0 {
            bail!("matching.target_fraction must be in (0, 1]");
        }
        if self.matching.initial_tolerance <= 0.0 {
            bail!("matching.initial_tolerance must be positive");
        }
        if self.matching.max_tolerance < self.matching.initial_tolerance {
            bail!("matching.max_tolerance must be >= matching.initial_tolerance");
        }

        if self.solver.run.is_empty() {
            bail!("solver.run must not be empty");
        }
        if self.solver.poll_secs <= 0.0 {
            bail!("solver.poll_secs must be positive");
        }
        if self.solver.max_restarts > 100 {
            bail!("solver.max_restarts must be in [0, 100]");
        }
        if self.solver.n_adapt_cycles > 99 {
            bail!("solver.n_adapt_cycles must be in [0, 99]");
        }
        if self.solver.errors.is_empty() {
            bail!("solver.errors must list at least one fatal signature");
        }
        if self.solver.warmstart.run.is_empty() {
            bail!("solver.warmstart.run must not be empty");
        }

        if self.generator.command.is_empty() {
            bail!("generator.command must not be empty");
        }
        if self.generator.perturbation <= 0.0 {
            bail!("generator.perturbation must be positive");
        }
        if self.generator.result_file.is_empty() {
            bail!("generator.result_file must not be empty");
        }
        if self.sensitivity.command.is_empty() {
            bail!("sensitivity.command must not be empty");
        }

        Ok(())
    }
}
