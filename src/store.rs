//! Durable per-iteration state: working/<NNNN> directories, snapshot files,
//! and the completion marker that gates advancement to the next ordinal.

use crate::io;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const COMPLETION_MARKER: &str = "ITERATION_COMPLETE";
pub const PARAMETERS_FILE: &str = "parameters.csv";
pub const JACOBIAN_FILE: &str = "jacobian.csv";
pub const OBJECTIVE_FILE: &str = "objective.txt";

/// Where a (possibly resumed) run attaches to the iteration history.
#[derive(Debug)]
pub struct ResumePoint {
    pub ordinal: u32,
    pub iter_dir: PathBuf,
    /// Prior iteration's design point, when it exists. Feeds the
    /// Barzilai-Borwein step estimate.
    pub x_prev: Option<Vec<f64>>,
    pub jac_prev: Option<Vec<f64>>,
}

/// Outcome fields persisted when an iteration completes.
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    pub objective: f64,
    pub penalty: f64,
    pub step_size: f64,
    pub names: Vec<String>,
    pub x: Vec<f64>,
    pub jacobian: Vec<f64>,
}

pub struct IterationStore {
    working_dir: PathBuf,
}

impl IterationStore {
    pub fn open(root: &Path, working_dir_name: &str) -> Result<Self> {
        let working_dir = root.join(working_dir_name);
        fs::create_dir_all(&working_dir)
            .with_context(|| format!("failed to create {}", working_dir.display()))?;
        Ok(Self { working_dir })
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn iter_dir(&self, ordinal: u32) -> PathBuf {
        self.working_dir.join(format!("{:04}", ordinal))
    }

    pub fn is_complete(&self, ordinal: u32) -> bool {
        self.iter_dir(ordinal).join(COMPLETION_MARKER).exists()
    }

    /// Sorted iteration ordinals present on disk. Gaps violate the
    /// contiguity invariant and are fatal.
    pub fn scan(&self) -> Result<Vec<u32>> {
        let mut ordinals = Vec::new();
        for entry in fs::read_dir(&self.working_dir)
            .with_context(|| format!("failed to read {}", self.working_dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Ok(n) = entry.file_name().to_string_lossy().parse::<u32>() {
                ordinals.push(n);
            }
        }
        ordinals.sort_unstable();
        for (i, &n) in ordinals.iter().enumerate() {
            if n != i as u32 {
                bail!(
                    "iteration history in {} is not contiguous: expected ordinal {}, found {}",
                    self.working_dir.display(),
                    i,
                    n
                );
            }
        }
        Ok(ordinals)
    }

    /// Determine which ordinal a run should attach to.
    ///
    /// No history: ordinal 0. Latest iteration complete: re-enter it when
    /// `resume` is set, otherwise advance. Latest iteration incomplete:
    /// re-enter it regardless (crash recovery). When re-entering past
    /// ordinal 0, the previous iteration's design point and Jacobian are
    /// loaded if present.
    pub fn resolve_iteration(&self, resume: bool, names: &[String]) -> Result<ResumePoint> {
        let ordinals = self.scan()?;
        let ordinal = match ordinals.last() {
            None => 0,
            Some(&latest) => {
                if self.is_complete(latest) {
                    if resume {
                        eprintln!("[chimera] warm-starting from iteration {}", latest);
                        latest
                    } else {
                        eprintln!("[chimera] moving onto iteration {}", latest + 1);
                        latest + 1
                    }
                } else {
                    eprintln!("[chimera] resuming iteration {}", latest);
                    latest
                }
            }
        };

        let (x_prev, jac_prev) = if ordinal > 0 {
            self.load_snapshots(ordinal - 1, names)?
        } else {
            (None, None)
        };

        let iter_dir = self.iter_dir(ordinal);
        fs::create_dir_all(&iter_dir)
            .with_context(|| format!("failed to create {}", iter_dir.display()))?;

        Ok(ResumePoint { ordinal, iter_dir, x_prev, jac_prev })
    }

    fn load_snapshots(
        &self,
        ordinal: u32,
        names: &[String],
    ) -> Result<(Option<Vec<f64>>, Option<Vec<f64>>)> {
        let dir = self.iter_dir(ordinal);
        let x_path = dir.join(PARAMETERS_FILE);
        let jac_path = dir.join(JACOBIAN_FILE);
        if !x_path.exists() {
            return Ok((None, None));
        }
        let x = io::ordered_values(&io::read_kv_table(&x_path)?, names)
            .with_context(|| format!("iteration {} parameter snapshot", ordinal))?;
        let jac = if jac_path.exists() {
            Some(
                io::ordered_values(&io::read_kv_table(&jac_path)?, names)
                    .with_context(|| format!("iteration {} jacobian snapshot", ordinal))?,
            )
        } else {
            None
        };
        Ok((Some(x), jac))
    }

    /// Load the ordered design point snapshotted in an iteration directory,
    /// if one was written before a crash.
    pub fn load_parameters(&self, ordinal: u32, names: &[String]) -> Result<Option<Vec<f64>>> {
        let path = self.iter_dir(ordinal).join(PARAMETERS_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let x = io::ordered_values(&io::read_kv_table(&path)?, names)
            .with_context(|| format!("iteration {} parameter snapshot", ordinal))?;
        Ok(Some(x))
    }

    /// Persist an iteration's outcome. Every snapshot lands via temp file +
    /// rename, and the completion marker is written last, so a reader sees
    /// either no record or a fully populated complete one.
    pub fn record_completion(&self, ordinal: u32, outcome: &IterationOutcome) -> Result<()> {
        let dir = self.iter_dir(ordinal);
        if outcome.x.len() != outcome.names.len() || outcome.jacobian.len() != outcome.names.len() {
            bail!(
                "iteration {}: outcome dimensions disagree ({} names, {} values, {} gradients)",
                ordinal,
                outcome.names.len(),
                outcome.x.len(),
                outcome.jacobian.len()
            );
        }

        let pair = |v: &[f64]| -> Vec<(String, f64)> {
            outcome.names.iter().cloned().zip(v.iter().copied()).collect()
        };

        write_atomic(&dir.join(PARAMETERS_FILE), |p| io::write_kv_table(p, &pair(&outcome.x)))?;
        write_atomic(&dir.join(JACOBIAN_FILE), |p| {
            io::write_kv_table(p, &pair(&outcome.jacobian))
        })?;
        write_atomic(&dir.join(OBJECTIVE_FILE), |p| io::write_objective(p, outcome.objective))?;

        let mut summary = vec![
            ("objective".to_string(), outcome.objective),
            ("penalty".to_string(), outcome.penalty),
            ("step_size".to_string(), outcome.step_size),
        ];
        summary.extend(pair(&outcome.x));
        write_atomic(&dir.join(COMPLETION_MARKER), |p| io::write_kv_table(p, &summary))?;

        Ok(())
    }

    /// All completed iterations with their marker summaries, in order.
    pub fn load_completed(&self) -> Result<Vec<(u32, HashMap<String, f64>)>> {
        let mut out = Vec::new();
        for ordinal in self.scan()? {
            let marker = self.iter_dir(ordinal).join(COMPLETION_MARKER);
            if !marker.exists() {
                continue;
            }
            let rows = io::read_kv_table(&marker)
                .with_context(|| format!("iteration {} completion record", ordinal))?;
            out.push((ordinal, rows.into_iter().collect()));
        }
        Ok(out)
    }
}

/// Write through a sibling temp file and rename into place.
fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let tmp = path.with_extension("tmp");
    write(&tmp)?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to commit {}", path.display()))?;
    Ok(())
}
