//! Steepest-descent driver over the iteration pipeline.
//!
//! The step size is the Barzilai-Borwein single-secant estimate
//!   gamma = ||(x_i - x_{i-1}) .* (g_i - g_{i-1})|| / ||g_i - g_{i-1}||^2
//! clamped to a configured maximum. This is a heuristic secant
//! approximation, not a quasi-Newton method; no curvature matrix is kept.
//!
//! References:
//! - Barzilai, J., Borwein, J. "Two-Point Step Size Gradient Methods" (1988)

use crate::config;
use crate::store::{IterationOutcome, IterationStore};
use anyhow::{bail, Context, Result};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Pipeline stages of one iteration, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Preparing,
    RunningSensitivityStudy,
    Intersecting,
    Simulating,
    Reducing,
    Stepping,
    Terminated,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Preparing => "preparing",
            Stage::RunningSensitivityStudy => "running sensitivity study",
            Stage::Intersecting => "intersecting",
            Stage::Simulating => "simulating",
            Stage::Reducing => "reducing",
            Stage::Stepping => "stepping",
            Stage::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Everything a stage needs, threaded explicitly: stages never rely on an
/// ambient working directory.
#[derive(Debug, Clone)]
pub struct IterationContext {
    pub ordinal: u32,
    pub iter_dir: PathBuf,
    pub sim_dir: PathBuf,
    pub names: Vec<String>,
    pub x: Vec<f64>,
    pub warmstart: bool,
}

/// The four externally-effectful stages of an iteration. The production
/// implementation shells out to the geometry, intersection, and flow-solver
/// toolchains; tests substitute synthetic stages.
pub trait Pipeline {
    fn sensitivity_study(&mut self, ctx: &IterationContext) -> Result<()>;

    /// Ok(false): perturbation ladder exhausted (terminal for the run).
    fn intersect(&mut self, ctx: &IterationContext) -> Result<bool>;

    /// Ok(false): solver restart bound exhausted (terminal for the run).
    fn simulate(&mut self, ctx: &IterationContext) -> Result<bool>;

    /// Objective value and Jacobian, ordered like `ctx.names`.
    fn reduce(&mut self, ctx: &IterationContext) -> Result<(f64, Vec<f64>)>;

    /// Constraint-violation penalty added to the objective. Extension point;
    /// the default applies no penalty.
    fn compute_penalty(&self, _x: &[f64]) -> f64 {
        0.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    /// Relative objective change dropped below tolerance.
    Converged { change: f64, iterations: u32 },
    /// Iteration cap reached before convergence.
    IterationCap { iterations: u32 },
    /// Zero-norm Jacobian: no descent direction exists.
    ZeroJacobian { ordinal: u32 },
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Converged { change, iterations } => {
                write!(f, "converged after {} iterations (change {:.3e})", iterations, change)
            }
            Termination::IterationCap { iterations } => {
                write!(f, "iteration cap reached after {} iterations", iterations)
            }
            Termination::ZeroJacobian { ordinal } => {
                write!(f, "zero-norm Jacobian at iteration {}", ordinal)
            }
        }
    }
}

/// Barzilai-Borwein step estimate from one secant pair. NaN (zero gradient
/// difference) signals "no information": the caller keeps its current step.
pub fn bb_step(x: &[f64], x_prev: &[f64], jac: &[f64], jac_prev: &[f64]) -> f64 {
    let mut num = 0.0;
    let mut den = 0.0;
    for i in 0..x.len() {
        let dx = x[i] - x_prev[i];
        let dg = jac[i] - jac_prev[i];
        num += (dx * dg) * (dx * dg);
        den += dg * dg;
    }
    num.sqrt() / den
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|c| c * c).sum::<f64>().sqrt()
}

pub struct GradientDescent<'a> {
    cfg: &'a config::Optimizer,
    store: &'a IterationStore,
    sim_dir_name: String,
    cancel: &'a AtomicBool,
}

impl<'a> GradientDescent<'a> {
    pub fn new(
        cfg: &'a config::Optimizer,
        store: &'a IterationStore,
        sim_dir_name: &str,
        cancel: &'a AtomicBool,
    ) -> Self {
        Self { cfg, store, sim_dir_name: sim_dir_name.to_string(), cancel }
    }

    fn terminate(&self, termination: Termination) -> Termination {
        eprintln!("[chimera] {}: {}", Stage::Terminated, termination);
        termination
    }

    /// Run the optimisation loop until a terminal condition. Stage failures
    /// become errors carrying the iteration ordinal and stage; nothing past
    /// the failed iteration is marked complete.
    pub fn run(
        &self,
        pipeline: &mut dyn Pipeline,
        names: &[String],
        x0: &[f64],
        resume: bool,
    ) -> Result<Termination> {
        let mut x = x0.to_vec();
        let mut gamma = self.cfg.initial_step;
        let max_step = self.cfg.max_step.unwrap_or(f64::INFINITY);
        let mut obj_prev: Option<f64> = None;
        let mut first = true;

        loop {
            if self.cancel.load(Ordering::Relaxed) {
                bail!("optimisation cancelled");
            }

            // -- preparing ---------------------------------------------------
            let stage = Stage::Preparing;
            let rp = self
                .store
                .resolve_iteration(resume && first, names)
                .with_context(|| format!("stage {} failed", stage))?;
            let ordinal = rp.ordinal;

            if ordinal + 1 > self.cfg.max_iterations {
                return Ok(self.terminate(Termination::IterationCap { iterations: ordinal }));
            }

            let title = format!("Iteration {}", ordinal);
            eprintln!("{:=>43}", "");
            eprintln!("{:^43}", title);
            eprintln!("{:=>43}", "");
            let started = Instant::now();

            // A snapshot left by an interrupted run supersedes the in-memory
            // point, so crash recovery re-enters with the same design.
            if let Some(snap) = self.store.load_parameters(ordinal, names)? {
                x = snap;
            }

            let ctx = IterationContext {
                ordinal,
                iter_dir: rp.iter_dir.clone(),
                sim_dir: rp.iter_dir.join(&self.sim_dir_name),
                names: names.to_vec(),
                x: x.clone(),
                warmstart: resume && first && rp.x_prev.is_some(),
            };

            // -- sensitivity study -------------------------------------------
            let stage = Stage::RunningSensitivityStudy;
            pipeline
                .sensitivity_study(&ctx)
                .with_context(|| format!("iteration {}: stage {} failed", ordinal, stage))?;

            // -- intersecting ------------------------------------------------
            let stage = Stage::Intersecting;
            let ok = pipeline
                .intersect(&ctx)
                .with_context(|| format!("iteration {}: stage {} failed", ordinal, stage))?;
            if !ok {
                bail!(
                    "iteration {}: stage {}: component intersection failed after all perturbation attempts",
                    ordinal,
                    stage
                );
            }

            // -- simulating --------------------------------------------------
            let stage = Stage::Simulating;
            let ok = pipeline
                .simulate(&ctx)
                .with_context(|| format!("iteration {}: stage {} failed", ordinal, stage))?;
            if !ok {
                bail!(
                    "iteration {}: stage {}: solver restart bound exhausted",
                    ordinal,
                    stage
                );
            }

            // -- reducing ----------------------------------------------------
            let stage = Stage::Reducing;
            let (objective, jacobian) = pipeline
                .reduce(&ctx)
                .with_context(|| format!("iteration {}: stage {} failed", ordinal, stage))?;
            if jacobian.len() != names.len() {
                bail!(
                    "iteration {}: stage {}: Jacobian has {} entries for {} parameters",
                    ordinal,
                    stage,
                    jacobian.len(),
                    names.len()
                );
            }
            let penalty = pipeline.compute_penalty(&x);

            // -- stepping ----------------------------------------------------
            let stage = Stage::Stepping;
            self.store
                .record_completion(
                    ordinal,
                    &IterationOutcome {
                        objective,
                        penalty,
                        step_size: gamma,
                        names: names.to_vec(),
                        x: x.clone(),
                        jacobian: jacobian.clone(),
                    },
                )
                .with_context(|| format!("iteration {}: stage {} failed", ordinal, stage))?;

            if norm(&jacobian) == 0.0 {
                eprintln!("[chimera] zero-norm Jacobian, cannot continue descent");
                return Ok(self.terminate(Termination::ZeroJacobian { ordinal }));
            }

            if let (Some(x_prev), Some(jac_prev)) = (&rp.x_prev, &rp.jac_prev) {
                let estimate = bb_step(&x, x_prev, &jacobian, jac_prev);
                if !estimate.is_nan() {
                    gamma = estimate;
                }
            }
            gamma = gamma.min(max_step);

            for (xi, gi) in x.iter_mut().zip(&jacobian) {
                *xi -= gamma * gi;
            }

            let change = obj_prev.map(|prev| ((objective + penalty - prev) / prev).abs());

            eprintln!("[chimera] iteration {} complete in {:.2} s", ordinal, started.elapsed().as_secs_f64());
            eprintln!("  objective: {:.6e}", objective + penalty);
            eprintln!("  step size: {:.6e}", gamma);
            eprintln!("  next design point:");
            for (name, value) in names.iter().zip(&x) {
                eprintln!("    {:<20} {:>14.6e}", name, value);
            }

            if let Some(change) = change {
                if change <= self.cfg.tolerance {
                    return Ok(self.terminate(Termination::Converged { change, iterations: ordinal + 1 }));
                }
            }

            obj_prev = Some(objective + penalty);
            first = false;
        }
    }
}
