//! Production pipeline: wires the geometry generator, intersection engine,
//! solver supervisor, sensitivity reconciler, and reduction callback into
//! the stage contract the optimizer drives.

use crate::config;
use crate::intersect::{CommandKernel, IntersectionEngine, MeshPatch, Vec3};
use crate::io;
use crate::optimizer::{IterationContext, Pipeline};
use crate::reconcile::{self, SensitivityTable};
use crate::solver::{self, SolverSupervisor};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

pub const SENSITIVITY_SUFFIX: &str = "_sensitivity.csv";
pub const CONSOLIDATED_FILE: &str = "all_components_sensitivity.csv";
pub const FORCE_SENS_FILE: &str = "F_sensitivities.csv";
pub const GENERATOR_LOG: &str = "generator.log";
pub const PATCH_SUFFIX: &str = ".patch.csv";

/// Objective/Jacobian reduction over the solver loads and the
/// non-dimensional force sensitivities.
pub struct ReductionInputs<'r> {
    pub names: &'r [String],
    pub loads: &'r HashMap<String, f64>,
    /// Per-parameter body-frame force-coefficient sensitivities.
    pub coef_sens: &'r [(String, Vec3)],
    pub objective_key: &'r str,
    pub aoa_rad: f64,
}

pub trait Reduction {
    fn reduce(&self, inputs: &ReductionInputs) -> Result<(f64, Vec<f64>)>;
}

/// Minimise a drag coefficient from the loads report. The Jacobian rotates
/// body-frame force sensitivities into the wind frame at the configured
/// angle of attack.
pub struct DragReduction;

impl Reduction for DragReduction {
    fn reduce(&self, inputs: &ReductionInputs) -> Result<(f64, Vec<f64>)> {
        let objective = *inputs
            .loads
            .get(inputs.objective_key)
            .with_context(|| {
                format!("loads report has no entry for {}", inputs.objective_key)
            })?;

        let (sin_a, cos_a) = inputs.aoa_rad.sin_cos();
        let jacobian = inputs
            .names
            .iter()
            .map(|name| {
                inputs
                    .coef_sens
                    .iter()
                    .find(|(p, _)| p == name)
                    .map(|(_, df)| df[1] * sin_a + df[0] * cos_a)
                    .with_context(|| format!("no force sensitivity for parameter {}", name))
            })
            .collect::<Result<Vec<f64>>>()?;

        Ok((objective, jacobian))
    }
}

pub struct CfdPipeline<'a> {
    cfg: &'a config::Root,
    base_dir: PathBuf,
    engine: IntersectionEngine,
    reduction: Box<dyn Reduction>,
    cancel: &'a AtomicBool,
}

impl<'a> CfdPipeline<'a> {
    pub fn new(
        cfg: &'a config::Root,
        root: &Path,
        reduction: Box<dyn Reduction>,
        cancel: &'a AtomicBool,
    ) -> Self {
        Self {
            cfg,
            base_dir: root.join(&cfg.paths.base_dir),
            engine: IntersectionEngine::new(&cfg.intersection),
            reduction,
            cancel,
        }
    }

    fn component_tables(&self, iter_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut tables = Vec::new();
        for entry in fs::read_dir(iter_dir)
            .with_context(|| format!("failed to read {}", iter_dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(SENSITIVITY_SUFFIX) && name != CONSOLIDATED_FILE {
                tables.push(entry.path());
            }
        }
        tables.sort();
        Ok(tables)
    }

    fn load_patches(&self, iter_dir: &Path) -> Result<Vec<MeshPatch>> {
        let mut patches = Vec::new();
        let mut entries: Vec<_> = fs::read_dir(iter_dir)
            .with_context(|| format!("failed to read {}", iter_dir.display()))?
            .collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(component) = name.strip_suffix(PATCH_SUFFIX) {
                patches.push(io::read_patch(&entry.path(), component)?);
            }
        }
        Ok(patches)
    }

    fn reconcile(&self, ctx: &IterationContext) -> Result<()> {
        let result_path = ctx.sim_dir.join(&self.cfg.generator.result_file);
        let mesh = io::read_patch(&result_path, "intersected")
            .with_context(|| "intersected mesh is missing; cannot reconcile sensitivities")?;

        let mut tables = Vec::new();
        for path in self.component_tables(&ctx.iter_dir)? {
            tables.push(SensitivityTable::read(&path)?);
        }

        let m = &self.cfg.matching;
        let consolidated = reconcile::combine(
            &mesh.points,
            &tables,
            m.target_fraction,
            m.initial_tolerance,
            m.max_tolerance,
        )?;
        eprintln!(
            "[chimera] sensitivity data combined ({:.2}% match at tolerance {:.1e})",
            100.0 * consolidated.match_fraction,
            consolidated.tolerance
        );
        consolidated.write(&ctx.iter_dir.join(CONSOLIDATED_FILE))?;
        Ok(())
    }

    /// Run the external flow-sensitivity solver, refreshing the consolidated
    /// table and retrying once if it rejects stale matching data.
    fn force_sensitivities(&self, ctx: &IterationContext) -> Result<Vec<(String, Vec3)>> {
        let path = ctx.iter_dir.join(FORCE_SENS_FILE);
        if !path.exists() {
            let log = ctx.iter_dir.join(GENERATOR_LOG);
            eprintln!("[chimera] evaluating force sensitivities");
            let ok = solver::run_logged(&ctx.iter_dir, &self.cfg.sensitivity.command, &log)?;
            if !ok || !path.exists() {
                // Stale consolidated data (vertex reordering from a re-run
                // intersection) is the known failure mode: rebuild and retry.
                let consolidated = ctx.iter_dir.join(CONSOLIDATED_FILE);
                if consolidated.exists() {
                    fs::remove_file(&consolidated)?;
                }
                self.reconcile(ctx)?;
                let ok = solver::run_logged(&ctx.iter_dir, &self.cfg.sensitivity.command, &log)?;
                if !ok || !path.exists() {
                    bail!(
                        "flow-sensitivity command failed to produce {}",
                        path.display()
                    );
                }
            }
        } else {
            eprintln!("[chimera] force sensitivities loaded from file");
        }

        let q_ref = self.cfg.freestream.dynamic_pressure() * self.cfg.freestream.ref_area;
        let rows = io::read_force_sensitivities(&path)?
            .into_iter()
            .map(|(p, df)| (p, [df[0] / q_ref, df[1] / q_ref, df[2] / q_ref]))
            .collect();
        Ok(rows)
    }
}

impl Pipeline for CfdPipeline<'_> {
    fn sensitivity_study(&mut self, ctx: &IterationContext) -> Result<()> {
        let params_path = ctx.iter_dir.join(crate::store::PARAMETERS_FILE);
        if !params_path.exists() {
            let rows: Vec<(String, f64)> = ctx
                .names
                .iter()
                .cloned()
                .zip(ctx.x.iter().copied())
                .collect();
            io::write_kv_table(&params_path, &rows)?;
        }

        if !self.component_tables(&ctx.iter_dir)?.is_empty() {
            eprintln!("[chimera] sensitivity study already run");
            return Ok(());
        }

        eprintln!("[chimera] running sensitivity study");
        let cmd = self
            .cfg
            .generator
            .command
            .replace("{perturbation}", &self.cfg.generator.perturbation.to_string());
        let log = ctx.iter_dir.join(GENERATOR_LOG);
        if !solver::run_logged(&ctx.iter_dir, &cmd, &log)? {
            bail!("geometry generator command failed: {}", cmd);
        }

        if self.load_patches(&ctx.iter_dir)?.is_empty() {
            bail!("geometry generator produced no *{} surfaces", PATCH_SUFFIX);
        }
        if self.component_tables(&ctx.iter_dir)?.is_empty() {
            bail!("geometry generator produced no *{} tables", SENSITIVITY_SUFFIX);
        }
        Ok(())
    }

    fn intersect(&mut self, ctx: &IterationContext) -> Result<bool> {
        fs::create_dir_all(&ctx.sim_dir)
            .with_context(|| format!("failed to create {}", ctx.sim_dir.display()))?;
        let patches = self.load_patches(&ctx.iter_dir)?;
        if patches.is_empty() {
            bail!("no surface patches found in {}", ctx.iter_dir.display());
        }

        let mut kernel = CommandKernel::new(&self.cfg.generator, &self.cfg.solver.log);
        let log = ctx.sim_dir.join(&self.cfg.solver.log);
        match self
            .engine
            .intersect(&ctx.sim_dir, &patches, &mut kernel, &log)?
        {
            Some(mesh) => {
                // Persist in the restored (original) frame; the kernel's
                // on-disk result may still be in the transformed frame.
                io::write_patch(&ctx.sim_dir.join(&self.cfg.generator.result_file), &mesh)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn simulate(&mut self, ctx: &IterationContext) -> Result<bool> {
        let prior_sim_dir = if ctx.ordinal > 0 {
            ctx.iter_dir
                .parent()
                .map(|w| w.join(format!("{:04}", ctx.ordinal - 1)).join(
                    ctx.sim_dir
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                ))
        } else {
            None
        };

        // A fully staged fresh setup wins over the warm-start request; the
        // two launch modes cannot share a directory.
        let staged_fresh = self
            .cfg
            .solver
            .input_files
            .iter()
            .all(|f| ctx.sim_dir.join(f).exists());
        let warmstart = ctx.warmstart && !staged_fresh;

        let supervisor = SolverSupervisor::new(&self.cfg.solver, self.cancel);
        supervisor.run(
            &self.base_dir,
            &ctx.sim_dir,
            prior_sim_dir.as_deref(),
            warmstart,
        )
    }

    fn reduce(&mut self, ctx: &IterationContext) -> Result<(f64, Vec<f64>)> {
        if !ctx.iter_dir.join(CONSOLIDATED_FILE).exists() {
            self.reconcile(ctx)?;
        }

        let coef_sens = self.force_sensitivities(ctx)?;

        let supervisor = SolverSupervisor::new(&self.cfg.solver, self.cancel);
        let loads_path = supervisor.loads_path(&ctx.sim_dir);
        let loads = io::parse_loads(&loads_path, io::LoadsFilter::default())?;

        self.reduction.reduce(&ReductionInputs {
            names: &ctx.names,
            loads: &loads,
            coef_sens: &coef_sens,
            objective_key: &self.cfg.optimizer.objective_key,
            aoa_rad: self.cfg.freestream.aoa_rad(),
        })
    }
}
