//! Comprehensive test suite for CHIMERA
//!
//! Includes:
//! - Unit tests for the store, intersection ladder, reconciler, and driver
//! - Property tests for the resume and tolerance-escalation invariants
//! - End-to-end runs over synthetic pipelines and a scripted fake solver

use crate::config;
use crate::intersect::{IntersectKernel, IntersectionEngine, MeshPatch, Vec3};
use crate::io;
use crate::optimizer::{bb_step, GradientDescent, IterationContext, Pipeline, Termination};
use crate::pipeline::{DragReduction, Reduction, ReductionInputs};
use crate::reconcile::{self, SensRecord, SensitivityTable};
use crate::solver::{wait_for, SolverSupervisor, WaitOutcome};
use crate::store::{IterationOutcome, IterationStore, COMPLETION_MARKER, PARAMETERS_FILE};
use anyhow::Result;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tempfile::tempdir;

fn names() -> Vec<String> {
    vec!["wingspan".to_string(), "sweep".to_string()]
}

fn outcome(objective: f64, step_size: f64) -> IterationOutcome {
    IterationOutcome {
        objective,
        penalty: 0.0,
        step_size,
        names: names(),
        x: vec![1.0, 2.0],
        jacobian: vec![0.1, 0.2],
    }
}

// =============================================================================
// IterationStore
// =============================================================================

#[test]
fn test_store_first_iteration() {
    let dir = tempdir().unwrap();
    let store = IterationStore::open(dir.path(), "working").unwrap();

    let rp = store.resolve_iteration(false, &names()).unwrap();
    assert_eq!(rp.ordinal, 0);
    assert!(rp.x_prev.is_none());
    assert!(rp.jac_prev.is_none());
    assert!(rp.iter_dir.is_dir());
}

#[test]
fn test_store_advance_and_reenter() {
    let dir = tempdir().unwrap();
    let store = IterationStore::open(dir.path(), "working").unwrap();

    store.resolve_iteration(false, &names()).unwrap();
    store.record_completion(0, &outcome(10.0, 0.05)).unwrap();

    // Complete latest + resume: re-enter the same ordinal.
    let rp = store.resolve_iteration(true, &names()).unwrap();
    assert_eq!(rp.ordinal, 0);

    // Complete latest, no resume: advance, picking up the prior snapshots.
    let rp = store.resolve_iteration(false, &names()).unwrap();
    assert_eq!(rp.ordinal, 1);
    assert_eq!(rp.x_prev.as_deref(), Some(&[1.0, 2.0][..]));
    assert_eq!(rp.jac_prev.as_deref(), Some(&[0.1, 0.2][..]));
}

#[test]
fn test_store_crash_resume_reenters_incomplete() {
    let dir = tempdir().unwrap();
    let store = IterationStore::open(dir.path(), "working").unwrap();

    store.resolve_iteration(false, &names()).unwrap();
    store.record_completion(0, &outcome(10.0, 0.05)).unwrap();
    store.resolve_iteration(false, &names()).unwrap(); // creates 0001, no marker

    // Latest has no completion marker: re-enter it regardless of resume.
    let rp = store.resolve_iteration(false, &names()).unwrap();
    assert_eq!(rp.ordinal, 1);
    let rp = store.resolve_iteration(true, &names()).unwrap();
    assert_eq!(rp.ordinal, 1);
}

#[test]
fn test_store_rejects_ordinal_gaps() {
    let dir = tempdir().unwrap();
    let store = IterationStore::open(dir.path(), "working").unwrap();
    fs::create_dir_all(store.iter_dir(0)).unwrap();
    fs::create_dir_all(store.iter_dir(2)).unwrap();

    let err = store.scan().unwrap_err().to_string();
    assert!(err.contains("not contiguous"), "unexpected error: {}", err);
}

#[test]
fn test_store_completion_record_is_whole() {
    let dir = tempdir().unwrap();
    let store = IterationStore::open(dir.path(), "working").unwrap();
    let rp = store.resolve_iteration(false, &names()).unwrap();

    assert!(!store.is_complete(0));
    store.record_completion(0, &outcome(12.5, 0.07)).unwrap();
    assert!(store.is_complete(0));

    // All outcome fields present and no temp droppings.
    let obj = io::read_objective(&rp.iter_dir.join("objective.txt")).unwrap();
    assert!((obj - 12.5).abs() < 1e-12);
    let jac = io::read_kv_table(&rp.iter_dir.join("jacobian.csv")).unwrap();
    assert_eq!(jac.len(), 2);
    for entry in fs::read_dir(&rp.iter_dir).unwrap() {
        let name = entry.unwrap().file_name().to_string_lossy().into_owned();
        assert!(!name.ends_with(".tmp"), "leftover temp file: {}", name);
    }

    let completed = store.load_completed().unwrap();
    assert_eq!(completed.len(), 1);
    let record = &completed[0].1;
    assert!((record["objective"] - 12.5).abs() < 1e-12);
    assert!((record["step_size"] - 0.07).abs() < 1e-12);
    assert!((record["wingspan"] - 1.0).abs() < 1e-12);
}

// =============================================================================
// MeshIntersectionEngine
// =============================================================================

fn square_patches() -> Vec<MeshPatch> {
    vec![
        MeshPatch {
            name: "fuselage".to_string(),
            points: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        },
        MeshPatch {
            name: "wing".to_string(),
            points: vec![[0.5, 0.5, 0.5], [1.5, 0.5, 0.5]],
        },
    ]
}

fn merged(patches: &[MeshPatch]) -> MeshPatch {
    MeshPatch {
        name: "intersected".to_string(),
        points: patches.iter().flat_map(|p| p.points.iter().copied()).collect(),
    }
}

/// Kernel that fails until the Nth attempt, then returns the merged input.
struct ScriptedKernel {
    calls: u32,
    succeed_on: u32,
    preexisting: Option<MeshPatch>,
}

impl ScriptedKernel {
    fn new(succeed_on: u32) -> Self {
        Self { calls: 0, succeed_on, preexisting: None }
    }
}

impl IntersectKernel for ScriptedKernel {
    fn existing(&self, _sim_dir: &Path) -> Result<Option<MeshPatch>> {
        Ok(self.preexisting.clone())
    }

    fn attempt(&mut self, _sim_dir: &Path, patches: &[MeshPatch]) -> Result<Option<MeshPatch>> {
        self.calls += 1;
        if self.calls == self.succeed_on {
            Ok(Some(merged(patches)))
        } else {
            Ok(None)
        }
    }
}

fn engine(max_attempts: u32) -> IntersectionEngine {
    let cfg = config::Intersection { max_attempts, ..Default::default() };
    IntersectionEngine::new(&cfg)
}

#[test]
fn test_intersect_clean_patches_succeed_unmodified() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("solver.log");
    let patches = square_patches();
    let mut kernel = ScriptedKernel::new(1);

    let mesh = engine(6)
        .intersect(dir.path(), &patches, &mut kernel, &log)
        .unwrap()
        .expect("clean patches must intersect");

    assert_eq!(kernel.calls, 1);
    assert_eq!(mesh.points, merged(&patches).points, "first attempt is unperturbed");
}

#[test]
fn test_intersect_short_circuits_on_existing_result() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("solver.log");
    let patches = square_patches();
    let mut kernel = ScriptedKernel::new(1);
    kernel.preexisting = Some(merged(&patches));

    let mesh = engine(6)
        .intersect(dir.path(), &patches, &mut kernel, &log)
        .unwrap()
        .unwrap();
    assert_eq!(kernel.calls, 0, "no attempt against a present result");
    assert_eq!(mesh.points.len(), 5);
}

#[test]
fn test_intersect_jitter_stays_in_band() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("solver.log");
    let patches = square_patches();
    let mut kernel = ScriptedKernel::new(2);

    let mesh = engine(6)
        .intersect(dir.path(), &patches, &mut kernel, &log)
        .unwrap()
        .expect("jitter level must resolve");

    assert_eq!(kernel.calls, 2);
    let original = merged(&patches);
    let mut total_offset = 0.0;
    for (p, q) in mesh.points.iter().zip(&original.points) {
        for i in 0..3 {
            let d = p[i] - q[i];
            assert!((0.0..1e-3).contains(&d), "jitter out of band: {}", d);
            total_offset += d;
        }
    }
    assert!(total_offset > 0.0, "jitter applied some offset");
}

#[test]
fn test_intersect_rigid_transform_restores_frame() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("solver.log");
    let patches = square_patches();
    // Fails unmodified and jittered; succeeds on the first rigid attempt,
    // which applies no extra jitter, so restoration must be exact.
    let mut kernel = ScriptedKernel::new(3);

    let mesh = engine(6)
        .intersect(dir.path(), &patches, &mut kernel, &log)
        .unwrap()
        .expect("rigid level must resolve");

    assert_eq!(kernel.calls, 3);
    let original = merged(&patches);
    for (p, q) in mesh.points.iter().zip(&original.points) {
        for i in 0..3 {
            assert!(
                (p[i] - q[i]).abs() < 1e-9,
                "inverse transform drifted: {} vs {}",
                p[i],
                q[i]
            );
        }
    }
}

#[test]
fn test_intersect_exhaustion_returns_failure() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("solver.log");
    let patches = square_patches();
    let mut kernel = ScriptedKernel::new(u32::MAX);

    let result = engine(4).intersect(dir.path(), &patches, &mut kernel, &log).unwrap();
    assert!(result.is_none(), "exhaustion reports failure, not panic");
    // Unmodified + jittered + bounded rigid attempts, nothing further.
    assert_eq!(kernel.calls, 2 + 4);
}

// =============================================================================
// SensitivityReconciler
// =============================================================================

fn table_at(offset: f64, points: &[Vec3]) -> SensitivityTable {
    SensitivityTable {
        component: "wing".to_string(),
        params: names(),
        records: points
            .iter()
            .map(|p| SensRecord {
                pos: [p[0] + offset, p[1], p[2]],
                derivs: vec![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            })
            .collect(),
    }
}

#[test]
fn test_reconcile_escalates_to_matching_tolerance() {
    let points: Vec<Vec3> = vec![[0.0, 0.0, 0.0], [1.0, 1.0, 1.0], [2.0, 0.5, 0.25]];
    let tables = vec![table_at(0.005, &points)];

    let combined = reconcile::combine(&points, &tables, 0.9, 1e-5, 0.1).unwrap();
    assert!((combined.tolerance - 1e-2).abs() < 1e-15, "accepted at the 1e-2 rung");
    assert!((combined.match_fraction - 1.0).abs() < 1e-15);
    assert_eq!(combined.derivs.len(), points.len());
    assert_eq!(combined.derivs[0][0], [1.0, 0.0, 0.0]);
}

#[test]
fn test_reconcile_match_fraction_monotone_in_tolerance() {
    let points: Vec<Vec3> = vec![[0.0; 3], [1.0, 0.0, 0.0], [2.0, 0.0, 0.0]];
    // Rows at staggered distances so each rung binds more points.
    let table = SensitivityTable {
        component: "wing".to_string(),
        params: names(),
        records: vec![
            SensRecord { pos: [0.00005, 0.0, 0.0], derivs: vec![[0.0; 3]; 2] },
            SensRecord { pos: [1.005, 0.0, 0.0], derivs: vec![[0.0; 3]; 2] },
            SensRecord { pos: [2.05, 0.0, 0.0], derivs: vec![[0.0; 3]; 2] },
        ],
    };

    let mut previous = 0.0;
    let mut tolerance = 1e-5;
    let mut rungs = 0;
    while tolerance <= 0.1 {
        let (matched, _) = reconcile::match_at(&points, &[table.clone()], tolerance);
        let fraction = matched as f64 / points.len() as f64;
        assert!(fraction >= previous, "fraction regressed at tolerance {}", tolerance);
        previous = fraction;
        tolerance *= 10.0;
        rungs += 1;
    }
    assert!((previous - 1.0).abs() < 1e-15);
    // ceil(log10(max/init)) + 1 attempts covers the whole ladder.
    assert_eq!(rungs, 5);
}

#[test]
fn test_reconcile_tolerance_exhaustion_is_fatal() {
    let points: Vec<Vec3> = vec![[0.0; 3]];
    let tables = vec![table_at(5.0, &points)];

    let err = reconcile::combine(&points, &tables, 0.9, 1e-5, 0.1)
        .unwrap_err()
        .to_string();
    assert!(err.contains("cannot combine sensitivity data"), "got: {}", err);
}

#[test]
fn test_sensitivity_table_roundtrip() {
    let dir = tempdir().unwrap();
    let points: Vec<Vec3> = vec![[0.0, 1.0, 2.0], [3.0, 4.0, 5.0]];
    let combined =
        reconcile::combine(&points, &[table_at(0.0, &points)], 1.0, 1e-5, 0.1).unwrap();

    let path = dir.path().join("all_components_sensitivity.csv");
    combined.write(&path).unwrap();

    let back = SensitivityTable::read(&path).unwrap();
    assert_eq!(back.params, names());
    assert_eq!(back.records.len(), 2);
    assert_eq!(back.records[1].derivs[1], [0.0, 1.0, 0.0]);
}

// =============================================================================
// GradientOptimizer
// =============================================================================

#[test]
fn test_bb_step_closed_form() {
    let x_prev = [1.0, 2.0];
    let x = [1.1, 2.2];
    let g_prev = [0.5, 0.5];
    let g = [0.4, 0.3];

    let gamma = bb_step(&x, &x_prev, &g, &g_prev);
    let expected = 0.0017f64.sqrt() / 0.05;
    assert!((gamma - expected).abs() < 1e-12, "gamma {} vs {}", gamma, expected);
}

#[test]
fn test_bb_step_degenerate_pair_is_nan() {
    let x_prev = [1.0, 2.0];
    let x = [1.1, 2.2];
    let g = [0.4, 0.3];
    assert!(bb_step(&x, &x_prev, &g, &g).is_nan());
}

struct StubPipeline {
    objectives: Vec<f64>,
    jacobian: Vec<f64>,
    simulate_ok: bool,
    seen_ordinals: Vec<u32>,
    seen_points: Vec<Vec<f64>>,
}

impl StubPipeline {
    fn new(objectives: &[f64], jacobian: &[f64]) -> Self {
        Self {
            objectives: objectives.to_vec(),
            jacobian: jacobian.to_vec(),
            simulate_ok: true,
            seen_ordinals: Vec::new(),
            seen_points: Vec::new(),
        }
    }
}

impl Pipeline for StubPipeline {
    fn sensitivity_study(&mut self, ctx: &IterationContext) -> Result<()> {
        self.seen_ordinals.push(ctx.ordinal);
        self.seen_points.push(ctx.x.clone());
        Ok(())
    }

    fn intersect(&mut self, _ctx: &IterationContext) -> Result<bool> {
        Ok(true)
    }

    fn simulate(&mut self, _ctx: &IterationContext) -> Result<bool> {
        Ok(self.simulate_ok)
    }

    fn reduce(&mut self, ctx: &IterationContext) -> Result<(f64, Vec<f64>)> {
        Ok((self.objectives[ctx.ordinal as usize], self.jacobian.clone()))
    }
}

fn optimizer_config(max_iterations: u32) -> config::Optimizer {
    config::Optimizer { max_iterations, ..Default::default() }
}

#[test]
fn test_optimizer_converges_at_iteration_two() {
    let dir = tempdir().unwrap();
    let store = IterationStore::open(dir.path(), "working").unwrap();
    let cancel = AtomicBool::new(false);
    let cfg = optimizer_config(3);
    let driver = GradientDescent::new(&cfg, &store, "simulation", &cancel);
    let mut pipe = StubPipeline::new(&[10.0, 10.0, 9.99], &[1.0, 1.0]);

    let termination = driver.run(&mut pipe, &names(), &[1.0, 2.0], false).unwrap();
    match termination {
        Termination::Converged { iterations, change } => {
            assert_eq!(iterations, 2);
            assert!(change <= 1e-3);
        }
        other => panic!("expected convergence, got {:?}", other),
    }
    assert!(store.is_complete(0));
    assert!(store.is_complete(1));
    assert!(!store.iter_dir(2).exists(), "converged before starting iteration 2");
}

#[test]
fn test_optimizer_hits_iteration_cap() {
    let dir = tempdir().unwrap();
    let store = IterationStore::open(dir.path(), "working").unwrap();
    let cancel = AtomicBool::new(false);
    let cfg = optimizer_config(2);
    let driver = GradientDescent::new(&cfg, &store, "simulation", &cancel);
    let mut pipe = StubPipeline::new(&[10.0, 8.0, 6.0], &[1.0, 1.0]);

    let termination = driver.run(&mut pipe, &names(), &[1.0, 2.0], false).unwrap();
    assert_eq!(termination, Termination::IterationCap { iterations: 2 });
    assert_eq!(pipe.seen_ordinals, vec![0, 1]);
}

#[test]
fn test_optimizer_bails_on_zero_jacobian() {
    let dir = tempdir().unwrap();
    let store = IterationStore::open(dir.path(), "working").unwrap();
    let cancel = AtomicBool::new(false);
    let cfg = optimizer_config(5);
    let driver = GradientDescent::new(&cfg, &store, "simulation", &cancel);
    let mut pipe = StubPipeline::new(&[10.0], &[0.0, 0.0]);

    let termination = driver.run(&mut pipe, &names(), &[1.0, 2.0], false).unwrap();
    assert_eq!(termination, Termination::ZeroJacobian { ordinal: 0 });
    // The iteration itself completed; the bailout is about the next step.
    assert!(store.is_complete(0));
}

#[test]
fn test_optimizer_degenerate_secant_keeps_step_size() {
    let dir = tempdir().unwrap();
    let store = IterationStore::open(dir.path(), "working").unwrap();
    let cancel = AtomicBool::new(false);
    let cfg = optimizer_config(3);
    let driver = GradientDescent::new(&cfg, &store, "simulation", &cancel);
    // Constant Jacobian: every secant pair has dg = 0 and a NaN BB estimate.
    let mut pipe = StubPipeline::new(&[10.0, 5.0, 5.0], &[1.0, 1.0]);

    let termination = driver.run(&mut pipe, &names(), &[1.0, 2.0], false).unwrap();
    assert!(matches!(termination, Termination::Converged { .. }));
    for (_, record) in store.load_completed().unwrap() {
        assert!(
            (record["step_size"] - 0.05).abs() < 1e-15,
            "step size must stay at the previous value, got {}",
            record["step_size"]
        );
        assert!(record["wingspan"].is_finite());
    }
}

#[test]
fn test_optimizer_stage_failure_leaves_iteration_incomplete() {
    let dir = tempdir().unwrap();
    let store = IterationStore::open(dir.path(), "working").unwrap();
    let cancel = AtomicBool::new(false);
    let cfg = optimizer_config(5);
    let driver = GradientDescent::new(&cfg, &store, "simulation", &cancel);
    let mut pipe = StubPipeline::new(&[10.0], &[1.0, 1.0]);
    pipe.simulate_ok = false;

    let err = driver
        .run(&mut pipe, &names(), &[1.0, 2.0], false)
        .unwrap_err()
        .to_string();
    assert!(err.contains("iteration 0"), "got: {}", err);
    assert!(err.contains("solver restart bound exhausted"), "got: {}", err);
    assert!(!store.is_complete(0));
}

#[test]
fn test_optimizer_resumes_incomplete_ordinal() {
    let dir = tempdir().unwrap();
    let store = IterationStore::open(dir.path(), "working").unwrap();
    let cancel = AtomicBool::new(false);
    let cfg = optimizer_config(3);
    let driver = GradientDescent::new(&cfg, &store, "simulation", &cancel);

    let mut failing = StubPipeline::new(&[10.0], &[1.0, 1.0]);
    failing.simulate_ok = false;
    driver.run(&mut failing, &names(), &[1.0, 2.0], false).unwrap_err();
    assert!(store.iter_dir(0).exists());
    assert!(!store.is_complete(0));

    // A fresh process attaches to the same incomplete ordinal.
    let mut healthy = StubPipeline::new(&[10.0, 10.0], &[1.0, 1.0]);
    driver.run(&mut healthy, &names(), &[1.0, 2.0], false).unwrap();
    assert_eq!(healthy.seen_ordinals[0], 0);
}

#[test]
fn test_optimizer_crash_resume_prefers_snapshot() {
    let dir = tempdir().unwrap();
    let store = IterationStore::open(dir.path(), "working").unwrap();
    let cancel = AtomicBool::new(false);
    let cfg = optimizer_config(3);
    let driver = GradientDescent::new(&cfg, &store, "simulation", &cancel);

    // Simulate an interrupted iteration that had already snapshotted its
    // design point.
    fs::create_dir_all(store.iter_dir(0)).unwrap();
    io::write_kv_table(
        &store.iter_dir(0).join(PARAMETERS_FILE),
        &[("wingspan".to_string(), 5.0), ("sweep".to_string(), 6.0)],
    )
    .unwrap();

    let mut pipe = StubPipeline::new(&[10.0, 10.0], &[1.0, 1.0]);
    driver.run(&mut pipe, &names(), &[1.0, 2.0], false).unwrap();
    assert_eq!(pipe.seen_points[0], vec![5.0, 6.0]);
}

// =============================================================================
// SolverSupervisor
// =============================================================================

fn quick_solver(run: &str) -> config::Solver {
    config::Solver {
        run: run.to_string(),
        poll_secs: 0.02,
        max_restarts: 2,
        n_adapt_cycles: 0,
        input_files: Vec::new(),
        mesh_setup: String::new(),
        ..Default::default()
    }
}

#[test]
fn test_wait_for_outcomes() {
    let cancel = AtomicBool::new(false);

    let mut polls = 0;
    let outcome = wait_for(Duration::from_millis(1), None, &cancel, || {
        polls += 1;
        if polls >= 3 { Some(polls) } else { None }
    });
    assert_eq!(outcome, WaitOutcome::Ready(3));

    let outcome: WaitOutcome<()> =
        wait_for(Duration::from_millis(1), Some(Duration::from_millis(10)), &cancel, || None);
    assert_eq!(outcome, WaitOutcome::TimedOut);

    cancel.store(true, Ordering::Relaxed);
    let outcome: WaitOutcome<()> = wait_for(Duration::from_millis(1), None, &cancel, || None);
    assert_eq!(outcome, WaitOutcome::Cancelled);
}

#[test]
fn test_supervisor_success_and_idempotent_reentry() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("basefiles");
    let sim = dir.path().join("sim");
    fs::create_dir_all(&base).unwrap();
    let cfg = quick_solver("mkdir -p adapt00/FLOW && touch adapt00/FLOW/DONE");
    let cancel = AtomicBool::new(false);
    let supervisor = SolverSupervisor::new(&cfg, &cancel);

    assert!(supervisor.run(&base, &sim, None, false).unwrap());
    assert!(sim.join("adapt00/FLOW/DONE").exists());

    // Sentinel already present: complete without relaunching.
    assert!(supervisor.run(&base, &sim, None, false).unwrap());
}

#[test]
fn test_supervisor_restart_exhaustion() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("basefiles");
    let sim = dir.path().join("sim");
    fs::create_dir_all(&base).unwrap();
    // Every launch reports a known fatal signature and never produces the
    // sentinel, so the restart bound must trip.
    let cfg = quick_solver("echo 'ERROR: CUBES failed'");
    let cancel = AtomicBool::new(false);
    let supervisor = SolverSupervisor::new(&cfg, &cancel);

    let ok = supervisor.run(&base, &sim, None, false).unwrap();
    assert!(!ok, "restart exhaustion must report failure");

    let log = fs::read_to_string(sim.join("solver.log")).unwrap();
    assert_eq!(log.matches("SHAPEOPT RESTART").count(), 2, "one marker per restart");
}

#[test]
fn test_supervisor_cancellation_unwinds() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("basefiles");
    let sim = dir.path().join("sim");
    fs::create_dir_all(&base).unwrap();
    let cfg = quick_solver("sleep 5");
    let cancel = AtomicBool::new(true);
    let supervisor = SolverSupervisor::new(&cfg, &cancel);

    let err = supervisor.run(&base, &sim, None, false).unwrap_err().to_string();
    assert!(err.contains("cancelled"), "got: {}", err);
}

#[test]
fn test_supervisor_warmstart_wiring() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("basefiles");
    let prior = dir.path().join("0000").join("simulation");
    let sim = dir.path().join("0001").join("simulation");
    fs::create_dir_all(&base).unwrap();
    fs::create_dir_all(prior.join("BEST/FLOW")).unwrap();
    for f in ["input.cntl", "input.c3d", "Config.xml"] {
        fs::write(prior.join(f), f).unwrap();
    }
    fs::write(prior.join("BEST/Mesh.c3d.Info"), "info").unwrap();
    fs::write(prior.join("BEST/Mesh.mg.c3d"), "mesh").unwrap();
    fs::write(prior.join("BEST/FLOW/check.00100"), "ckpt").unwrap();

    let mut cfg = quick_solver("true");
    cfg.warmstart.remesh = Vec::new();
    cfg.warmstart.remap = String::new();
    cfg.warmstart.run = "touch loadsCC.dat".to_string();
    let cancel = AtomicBool::new(false);
    let supervisor = SolverSupervisor::new(&cfg, &cancel);

    assert!(supervisor.run(&base, &sim, Some(&prior), true).unwrap());

    for f in ["input.cntl", "input.c3d", "Config.xml", "check.00100"] {
        assert!(sim.join(f).exists(), "missing warm-start artifact {}", f);
    }
    for link in ["refMesh.c3d.Info", "refMesh.mg.c3d"] {
        let meta = fs::symlink_metadata(sim.join(link)).unwrap();
        assert!(meta.file_type().is_symlink(), "{} must be a link, not a copy", link);
    }
    assert!(sim.join("loadsCC.dat").exists(), "warm sentinel sits at the run root");
}

// =============================================================================
// End-to-end: optimizer over a scripted failing solver
// =============================================================================

/// Minimal pipeline whose simulate stage supervises a real (fake) solver
/// process; everything else is synthetic.
struct FailingSolverPipeline<'a> {
    solver_cfg: config::Solver,
    base_dir: std::path::PathBuf,
    cancel: &'a AtomicBool,
}

impl Pipeline for FailingSolverPipeline<'_> {
    fn sensitivity_study(&mut self, _ctx: &IterationContext) -> Result<()> {
        Ok(())
    }

    fn intersect(&mut self, _ctx: &IterationContext) -> Result<bool> {
        Ok(true)
    }

    fn simulate(&mut self, ctx: &IterationContext) -> Result<bool> {
        let supervisor = SolverSupervisor::new(&self.solver_cfg, self.cancel);
        supervisor.run(&self.base_dir, &ctx.sim_dir, None, false)
    }

    fn reduce(&mut self, _ctx: &IterationContext) -> Result<(f64, Vec<f64>)> {
        Ok((1.0, vec![1.0, 1.0]))
    }
}

#[test]
fn test_end_to_end_solver_exhaustion_aborts_run() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("basefiles");
    fs::create_dir_all(&base).unwrap();
    let store = IterationStore::open(dir.path(), "working").unwrap();
    let cancel = AtomicBool::new(false);
    let cfg = optimizer_config(5);
    let driver = GradientDescent::new(&cfg, &store, "simulation", &cancel);

    let mut pipe = FailingSolverPipeline {
        solver_cfg: quick_solver("echo 'ERROR: ADAPT failed with status = 1'"),
        base_dir: base,
        cancel: &cancel,
    };

    let err = driver
        .run(&mut pipe, &names(), &[1.0, 2.0], false)
        .unwrap_err()
        .to_string();
    assert!(err.contains("iteration 0"), "got: {}", err);
    assert!(err.contains("solver restart bound exhausted"), "got: {}", err);
    assert!(!store.is_complete(0), "aborted iteration must stay incomplete");
}

// =============================================================================
// Loads report and reduction
// =============================================================================

#[test]
fn test_parse_loads_families() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("loadsCC.dat");
    fs::write(
        &path,
        "# forces and moments\n\
         entire  Axial force coefficient (C_A): 0.123\n\
         entire  Drag  coefficient   (C_D):   0.456\n\
         wing    Pitching moment coefficient (C_m): -0.01\n\
         stray line without a separator\n",
    )
    .unwrap();

    let loads = io::parse_loads(&path, io::LoadsFilter::default()).unwrap();
    assert_eq!(loads.len(), 3);
    assert!((loads["C_A-entire"] - 0.123).abs() < 1e-12);
    assert!((loads["C_D-entire"] - 0.456).abs() < 1e-12);
    assert!((loads["C_m-wing"] + 0.01).abs() < 1e-12);

    let wind_only = io::parse_loads(
        &path,
        io::LoadsFilter { body: false, wind: true, moments: false },
    )
    .unwrap();
    assert_eq!(wind_only.len(), 1);
    assert!(wind_only.contains_key("C_D-entire"));
}

#[test]
fn test_drag_reduction_rotates_to_wind_frame() {
    let mut loads = HashMap::new();
    loads.insert("C_D-entire".to_string(), 0.5);
    let coef_sens = vec![
        ("wingspan".to_string(), [1.0, 2.0, 3.0]),
        ("sweep".to_string(), [4.0, 5.0, 6.0]),
    ];

    let inputs = ReductionInputs {
        names: &names(),
        loads: &loads,
        coef_sens: &coef_sens,
        objective_key: "C_D-entire",
        aoa_rad: 0.0,
    };
    let (obj, jac) = DragReduction.reduce(&inputs).unwrap();
    assert!((obj - 0.5).abs() < 1e-12);
    assert!((jac[0] - 1.0).abs() < 1e-12);
    assert!((jac[1] - 4.0).abs() < 1e-12);

    let inputs = ReductionInputs { aoa_rad: std::f64::consts::FRAC_PI_2, ..inputs };
    let (_, jac) = DragReduction.reduce(&inputs).unwrap();
    assert!((jac[0] - 2.0).abs() < 1e-9);
    assert!((jac[1] - 5.0).abs() < 1e-9);
}

#[test]
fn test_drag_reduction_missing_parameter_errors() {
    let mut loads = HashMap::new();
    loads.insert("C_D-entire".to_string(), 0.5);
    let coef_sens = vec![("wingspan".to_string(), [1.0, 2.0, 3.0])];

    let inputs = ReductionInputs {
        names: &names(),
        loads: &loads,
        coef_sens: &coef_sens,
        objective_key: "C_D-entire",
        aoa_rad: 0.0,
    };
    let err = DragReduction.reduce(&inputs).unwrap_err().to_string();
    assert!(err.contains("sweep"), "got: {}", err);
}

// =============================================================================
// Configuration
// =============================================================================

fn minimal_toml() -> &'static str {
    r#"
[CSTNSystems]
program = "CSTNSystems"
module = "shape-optimisation"
version = "1.3"

[freestream]
rho = 0.0265
velocity = 2790.0
sound_speed = 299.5
ref_area = 1.0

[generator]
command = "hypergen study --parameters parameters.csv"

[sensitivity]
command = "flowgrad --combined all_components_sensitivity.csv"

[[parameter]]
name = "wingspan"
value = 1.0

[[parameter]]
name = "sweep"
value = 2.0
"#
}

#[test]
fn test_config_defaults() {
    let cfg: config::Root = toml::from_str(minimal_toml()).unwrap();
    cfg.validate().unwrap();

    assert_eq!(cfg.paths.working_dir, "working");
    assert_eq!(cfg.optimizer.max_iterations, 10);
    assert!((cfg.optimizer.tolerance - 1e-3).abs() < 1e-15);
    assert_eq!(cfg.intersection.max_attempts, 6);
    assert_eq!(cfg.solver.max_restarts, 3);
    assert_eq!(cfg.solver.adapt_dir(), "adapt03");
    assert!(cfg.solver.errors.iter().any(|e| e == "ERROR: CUBES failed"));
    assert_eq!(cfg.param_names(), names());
    assert_eq!(cfg.initial_point(), vec![1.0, 2.0]);
}

#[test]
fn test_config_rejects_invalid() {
    let mut cfg: config::Root = toml::from_str(minimal_toml()).unwrap();
    cfg.parameters[1].name = "wingspan".to_string();
    assert!(cfg.validate().unwrap_err().to_string().contains("duplicate"));

    let mut cfg: config::Root = toml::from_str(minimal_toml()).unwrap();
    cfg.optimizer.tolerance = 0.0;
    assert!(cfg.validate().is_err());

    let mut cfg: config::Root = toml::from_str(minimal_toml()).unwrap();
    cfg.matching.max_tolerance = 1e-9;
    assert!(cfg.validate().is_err());

    let mut cfg: config::Root = toml::from_str(minimal_toml()).unwrap();
    cfg.solver.errors.clear();
    assert!(cfg.validate().is_err());
}

// =============================================================================
// Tabular I/O
// =============================================================================

#[test]
fn test_kv_table_roundtrip_and_ordering() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("parameters.csv");
    let rows = vec![("sweep".to_string(), 2.0), ("wingspan".to_string(), 1.0)];
    io::write_kv_table(&path, &rows).unwrap();

    let back = io::read_kv_table(&path).unwrap();
    assert_eq!(back, rows);

    // ordered_values reorders by the requested names.
    let values = io::ordered_values(&back, &names()).unwrap();
    assert_eq!(values, vec![1.0, 2.0]);

    let missing = vec!["wingspan".to_string(), "chord".to_string()];
    let err = io::ordered_values(&back, &missing).unwrap_err().to_string();
    assert!(err.contains("chord"), "got: {}", err);
}

#[test]
fn test_objective_file_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("objective.txt");
    io::write_objective(&path, 1.59e-2).unwrap();
    let obj = io::read_objective(&path).unwrap();
    assert!((obj - 1.59e-2).abs() < 1e-15);
}

#[test]
fn test_log_tail_of_missing_file_is_empty() {
    let dir = tempdir().unwrap();
    let tail = io::read_log_tail(&dir.path().join("absent.log"), 4096).unwrap();
    assert!(tail.is_empty());
}

#[test]
fn test_completion_marker_last_write_wins() {
    // A reader polling the marker must never see snapshots without it being
    // the final artifact: delete the marker and the record reads incomplete.
    let dir = tempdir().unwrap();
    let store = IterationStore::open(dir.path(), "working").unwrap();
    store.resolve_iteration(false, &names()).unwrap();
    store.record_completion(0, &outcome(3.0, 0.01)).unwrap();

    fs::remove_file(store.iter_dir(0).join(COMPLETION_MARKER)).unwrap();
    assert!(!store.is_complete(0));
    assert!(store.load_completed().unwrap().is_empty());
}
