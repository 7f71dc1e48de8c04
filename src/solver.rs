//! External flow-solver supervision: asynchronous launch, sentinel polling,
//! log-signature failure classification, bounded restarts, and warm-start
//! file wiring from the prior iteration.

use crate::config;
use crate::io;
use anyhow::{bail, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const LOG_TAIL_BYTES: u64 = 4096;

// ============================================================================
// Cancellable wait-for-condition primitive
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Ready(T),
    TimedOut,
    Cancelled,
}

/// Poll `probe` on a fixed interval until it yields a value, the optional
/// deadline passes, or the cancel flag is raised. The probe runs once before
/// the first sleep, so an already-satisfied condition never waits.
pub fn wait_for<T, F>(
    poll: Duration,
    max_wait: Option<Duration>,
    cancel: &AtomicBool,
    mut probe: F,
) -> WaitOutcome<T>
where
    F: FnMut() -> Option<T>,
{
    let start = Instant::now();
    loop {
        if cancel.load(Ordering::Relaxed) {
            return WaitOutcome::Cancelled;
        }
        if let Some(value) = probe() {
            return WaitOutcome::Ready(value);
        }
        if let Some(limit) = max_wait {
            if start.elapsed() >= limit {
                return WaitOutcome::TimedOut;
            }
        }
        std::thread::sleep(poll);
    }
}

// ============================================================================
// Logged process helpers
// ============================================================================

fn open_log(log: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(log)
        .with_context(|| format!("failed to open log {}", log.display()))
}

/// Run a shell command to completion in `dir`, appending its output to the
/// log. Returns whether it exited successfully; tool failures are usually a
/// retry signal here, not an error.
pub fn run_logged(dir: &Path, cmd: &str, log: &Path) -> Result<bool> {
    let out = open_log(log)?;
    let err = out.try_clone()?;
    let status = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .current_dir(dir)
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err))
        .status()
        .with_context(|| format!("failed to run: {}", cmd))?;
    Ok(status.success())
}

/// Launch a shell command in `dir` without waiting on it. The solver runs
/// detached; completion is observed through its sentinel file only.
pub fn spawn_logged(dir: &Path, cmd: &str, log: &Path) -> Result<Child> {
    let out = open_log(log)?;
    let err = out.try_clone()?;
    Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .current_dir(dir)
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err))
        .spawn()
        .with_context(|| format!("failed to launch: {}", cmd))
}

// ============================================================================
// Supervisor
// ============================================================================

enum SolverEvent {
    Done,
    Failed(String),
}

pub struct SolverSupervisor<'a> {
    cfg: &'a config::Solver,
    cancel: &'a AtomicBool,
}

impl<'a> SolverSupervisor<'a> {
    pub fn new(cfg: &'a config::Solver, cancel: &'a AtomicBool) -> Self {
        Self { cfg, cancel }
    }

    /// Completion sentinel: nested under the final refinement cycle for a
    /// fresh multi-refinement run, at the run root for a warm start.
    pub fn sentinel_path(&self, sim_dir: &Path, warmstart: bool) -> PathBuf {
        if warmstart {
            sim_dir.join(&self.cfg.loads_file)
        } else {
            sim_dir
                .join(self.cfg.adapt_dir())
                .join("FLOW")
                .join(&self.cfg.done_file)
        }
    }

    /// Directory holding the solution outputs (loads report) for a finished
    /// run, fresh or warm-started.
    pub fn loads_path(&self, sim_dir: &Path) -> PathBuf {
        let adapted = sim_dir
            .join(self.cfg.adapt_dir())
            .join("FLOW")
            .join(&self.cfg.loads_file);
        if adapted.exists() {
            adapted
        } else {
            sim_dir.join(&self.cfg.loads_file)
        }
    }

    /// Supervise one solver run. Ok(false) means the restart bound was
    /// exhausted; the caller treats that as fatal for the iteration.
    pub fn run(
        &self,
        base_dir: &Path,
        sim_dir: &Path,
        prior_sim_dir: Option<&Path>,
        warmstart: bool,
    ) -> Result<bool> {
        fs::create_dir_all(sim_dir)
            .with_context(|| format!("failed to create {}", sim_dir.display()))?;
        let log = sim_dir.join(&self.cfg.log);

        let checkpoint = match (warmstart, prior_sim_dir) {
            (true, Some(prior)) => Some(self.wire_warmstart(prior, sim_dir)?),
            _ => {
                self.stage_fresh(base_dir, sim_dir, &log)?;
                None
            }
        };
        let warmstart = checkpoint.is_some();

        let sentinel = self.sentinel_path(sim_dir, warmstart);
        if sentinel.exists() {
            eprintln!("[chimera] solver sentinel located, run already complete");
            return Ok(true);
        }

        let run_cmd = if warmstart {
            self.cfg.warmstart.run.clone()
        } else {
            self.cfg.run.clone()
        };

        if warmstart {
            self.prepare_warm_launch(sim_dir, checkpoint.as_deref(), &log)?;
        }

        eprintln!(
            "[chimera] starting solver, awaiting {}",
            sentinel.display()
        );
        spawn_logged(sim_dir, &run_cmd, &log)?;

        let mut restarts: u32 = 0;
        loop {
            let outcome = wait_for(self.cfg.poll(), None, self.cancel, || {
                self.probe(&sentinel, &log)
            });
            match outcome {
                WaitOutcome::Ready(SolverEvent::Done) => return Ok(true),
                WaitOutcome::Ready(SolverEvent::Failed(signature)) => {
                    restarts += 1;
                    if restarts > self.cfg.max_restarts {
                        eprintln!(
                            "[chimera] solver failed {} times ({}); giving up",
                            restarts, signature
                        );
                        return Ok(false);
                    }
                    eprintln!(
                        "[chimera] solver failed with `{}`; restart {}/{}",
                        signature, restarts, self.cfg.max_restarts
                    );
                    // Marker line keeps the stale signature from re-tripping
                    // the classifier before the relaunched solver writes.
                    io::append_log(&log, &format!("SHAPEOPT RESTART {}", restarts))?;
                    if warmstart {
                        self.prepare_warm_launch(sim_dir, checkpoint.as_deref(), &log)?;
                    }
                    spawn_logged(sim_dir, &run_cmd, &log)?;
                }
                WaitOutcome::Cancelled => {
                    bail!("solver supervision cancelled while awaiting {}", sentinel.display())
                }
                WaitOutcome::TimedOut => {
                    bail!("solver supervision timed out awaiting {}", sentinel.display())
                }
            }
        }
    }

    fn probe(&self, sentinel: &Path, log: &Path) -> Option<SolverEvent> {
        if sentinel.exists() {
            return Some(SolverEvent::Done);
        }
        // Absence of a known signature while the sentinel is missing means
        // the solver is still running.
        self.classify(log).map(SolverEvent::Failed)
    }

    /// Match the last non-empty log line against the fatal signature list.
    fn classify(&self, log: &Path) -> Option<String> {
        let tail = io::read_log_tail(log, LOG_TAIL_BYTES).ok()?;
        let last = tail.lines().rev().find(|l| !l.trim().is_empty())?;
        self.cfg
            .errors
            .iter()
            .find(|sig| last.contains(sig.as_str()))
            .cloned()
    }

    /// Stage base input files and run mesh setup for a fresh run. Re-entrant:
    /// files already staged are left alone, and setup is skipped once its
    /// output exists.
    fn stage_fresh(&self, base_dir: &Path, sim_dir: &Path, log: &Path) -> Result<()> {
        for file in &self.cfg.input_files {
            let dst = sim_dir.join(file);
            if dst.exists() {
                continue;
            }
            let src = base_dir.join(file);
            fs::copy(&src, &dst).with_context(|| {
                format!("failed to stage {} into {}", src.display(), sim_dir.display())
            })?;
        }
        if !self.cfg.mesh_setup.is_empty()
            && !sim_dir.join(&self.cfg.mesh_setup_output).exists()
        {
            if !run_logged(sim_dir, &self.cfg.mesh_setup, log)? {
                bail!("mesh setup command failed: {}", self.cfg.mesh_setup);
            }
        }
        Ok(())
    }

    /// Copy configuration and checkpoint artifacts from the prior run and
    /// link (not copy) the large mesh-metadata files. Returns the carried
    /// checkpoint filename.
    fn wire_warmstart(&self, prior_sim_dir: &Path, sim_dir: &Path) -> Result<String> {
        let ws = &self.cfg.warmstart;

        for file in &ws.copy_files {
            let dst = sim_dir.join(file);
            if dst.exists() {
                continue;
            }
            let src = prior_sim_dir.join(file);
            fs::copy(&src, &dst).with_context(|| {
                format!("failed to copy warm-start file {}", src.display())
            })?;
        }

        for file in &ws.link_files {
            let src = prior_sim_dir.join(file);
            let name = Path::new(file)
                .file_name()
                .with_context(|| format!("bad warm-start link entry: {}", file))?;
            let dst = sim_dir.join(format!("ref{}", name.to_string_lossy()));
            if dst.exists() {
                continue;
            }
            symlink(&src, &dst).with_context(|| {
                format!("failed to link {} as {}", src.display(), dst.display())
            })?;
        }

        let checkpoint = self.carry_checkpoint(prior_sim_dir, sim_dir)?;
        Ok(checkpoint)
    }

    /// Newest checkpoint from the prior run's checkpoint directory.
    fn carry_checkpoint(&self, prior_sim_dir: &Path, sim_dir: &Path) -> Result<String> {
        let ws = &self.cfg.warmstart;
        let dir = prior_sim_dir.join(&ws.checkpoint_dir);
        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("failed to read checkpoint dir {}", dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&ws.checkpoint_prefix) {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
                newest = Some((modified, entry.path()));
            }
        }
        let (_, src) = newest.with_context(|| {
            format!(
                "no {}* checkpoint found in {}",
                ws.checkpoint_prefix,
                dir.display()
            )
        })?;
        let name = src
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dst = sim_dir.join(&name);
        if !dst.exists() {
            fs::copy(&src, &dst).with_context(|| {
                format!("failed to carry checkpoint {}", src.display())
            })?;
        }
        Ok(name)
    }

    /// Remesh and remap the restart checkpoint onto the new mesh. Run before
    /// the first warm launch and again before every warm restart.
    fn prepare_warm_launch(
        &self,
        sim_dir: &Path,
        checkpoint: Option<&str>,
        log: &Path,
    ) -> Result<()> {
        let ws = &self.cfg.warmstart;
        for cmd in &ws.remesh {
            if !run_logged(sim_dir, cmd, log)? {
                bail!("warm-start remesh command failed: {}", cmd);
            }
        }
        if let Some(ckpt) = checkpoint {
            let remap = ws.remap.replace("{checkpoint}", ckpt);
            if !remap.is_empty() && !run_logged(sim_dir, &remap, log)? {
                bail!("checkpoint remap command failed: {}", remap);
            }
        }
        Ok(())
    }
}
