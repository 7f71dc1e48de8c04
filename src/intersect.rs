//! Component intersection with an escalating perturbation ladder.
//!
//! Exactly-touching or overlapping surfaces are the dominant failure mode of
//! the boolean intersection toolchain; randomized perturbation breaks those
//! ties without exact-arithmetic geometry. Strategies, in order: unmodified
//! patches, per-patch jitter, then a bounded number of rigid transforms of
//! all patches together. A success under a rigid transform is mapped back to
//! the original frame by the exact inverse transform.

use crate::config;
use crate::io;
use crate::solver;
use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::Path;

pub type Vec3 = [f64; 3];

#[derive(Debug, Clone)]
pub struct MeshPatch {
    pub name: String,
    pub points: Vec<Vec3>,
}

impl MeshPatch {
    pub fn translated(&self, offset: Vec3) -> MeshPatch {
        MeshPatch {
            name: self.name.clone(),
            points: self
                .points
                .iter()
                .map(|p| [p[0] + offset[0], p[1] + offset[1], p[2] + offset[2]])
                .collect(),
        }
    }

    pub fn transformed(&self, tf: &RigidTransform) -> MeshPatch {
        MeshPatch {
            name: self.name.clone(),
            points: self.points.iter().map(|p| tf.apply(*p)).collect(),
        }
    }
}

fn rotate(p: Vec3, axis: usize, deg: f64) -> Vec3 {
    let (s, c) = deg.to_radians().sin_cos();
    match axis {
        0 => [p[0], c * p[1] - s * p[2], s * p[1] + c * p[2]],
        1 => [c * p[0] + s * p[2], p[1], -s * p[0] + c * p[2]],
        _ => [c * p[0] - s * p[1], s * p[0] + c * p[1], p[2]],
    }
}

/// Translation followed by rotations about x, then y, then z. The inverse
/// undoes the rotations in reverse order before undoing the translation, so
/// a mesh produced in the transformed frame can be restored exactly.
#[derive(Debug, Clone, Copy, Default)]
pub struct RigidTransform {
    pub shift: Vec3,
    pub rot_deg: Vec3,
}

impl RigidTransform {
    pub fn apply(&self, p: Vec3) -> Vec3 {
        let mut q = [
            p[0] + self.shift[0],
            p[1] + self.shift[1],
            p[2] + self.shift[2],
        ];
        for axis in 0..3 {
            q = rotate(q, axis, self.rot_deg[axis]);
        }
        q
    }

    pub fn invert(&self, p: Vec3) -> Vec3 {
        let mut q = p;
        for axis in (0..3).rev() {
            q = rotate(q, axis, -self.rot_deg[axis]);
        }
        [
            q[0] - self.shift[0],
            q[1] - self.shift[1],
            q[2] - self.shift[2],
        ]
    }
}

/// The boolean intersection itself is an external concern. An attempt either
/// yields the merged watertight mesh or reports a (retryable) failure.
pub trait IntersectKernel {
    /// An already-present successful result, for idempotent re-entry.
    fn existing(&self, sim_dir: &Path) -> Result<Option<MeshPatch>>;

    fn attempt(&mut self, sim_dir: &Path, patches: &[MeshPatch]) -> Result<Option<MeshPatch>>;
}

/// Process-backed kernel: stages patch files into the simulation directory,
/// runs the configured merge and intersect commands, and reads the result
/// file they leave behind. A missing result file is the failure signal; the
/// tool exit codes are not trusted.
pub struct CommandKernel {
    merge: String,
    intersect: String,
    result_file: String,
    log: String,
}

impl CommandKernel {
    pub fn new(cfg: &config::Generator, log: &str) -> Self {
        Self {
            merge: cfg.merge.clone(),
            intersect: cfg.intersect.clone(),
            result_file: cfg.result_file.clone(),
            log: log.to_string(),
        }
    }
}

impl IntersectKernel for CommandKernel {
    fn existing(&self, sim_dir: &Path) -> Result<Option<MeshPatch>> {
        let result = sim_dir.join(&self.result_file);
        if result.exists() {
            Ok(Some(io::read_patch(&result, "intersected")?))
        } else {
            Ok(None)
        }
    }

    fn attempt(&mut self, sim_dir: &Path, patches: &[MeshPatch]) -> Result<Option<MeshPatch>> {
        fs::create_dir_all(sim_dir)
            .with_context(|| format!("failed to create {}", sim_dir.display()))?;
        let log = sim_dir.join(&self.log);

        let mut files = Vec::new();
        for patch in patches {
            let fname = format!("{}.patch.csv", patch.name);
            io::write_patch(&sim_dir.join(&fname), patch)?;
            files.push(fname);
        }

        let result = sim_dir.join(&self.result_file);
        if result.exists() {
            fs::remove_file(&result)
                .with_context(|| format!("failed to remove stale {}", result.display()))?;
        }

        let merge = self.merge.replace("{files}", &files.join(" "));
        solver::run_logged(sim_dir, &merge, &log)?;
        solver::run_logged(sim_dir, &self.intersect, &log)?;

        if result.exists() {
            Ok(Some(io::read_patch(&result, "intersected")?))
        } else {
            Ok(None)
        }
    }
}

pub struct IntersectionEngine {
    cfg: config::Intersection,
    rng: StdRng,
}

impl IntersectionEngine {
    pub fn new(cfg: &config::Intersection) -> Self {
        Self {
            cfg: cfg.clone(),
            rng: StdRng::seed_from_u64(cfg.seed),
        }
    }

    fn jitter_offset(&mut self) -> Vec3 {
        let mut v = [0.0; 3];
        for c in v.iter_mut() {
            *c = self.rng.gen::<f64>() / self.cfg.jitter_denom;
        }
        v
    }

    fn jitter(&mut self, patches: &[MeshPatch]) -> Vec<MeshPatch> {
        patches
            .iter()
            .map(|p| {
                let offset = self.jitter_offset();
                p.translated(offset)
            })
            .collect()
    }

    fn random_transform(&mut self) -> RigidTransform {
        let mut tf = RigidTransform::default();
        for i in 0..3 {
            tf.shift[i] = self.rng.gen::<f64>() * self.cfg.shift_span;
            tf.rot_deg[i] = self.rng.gen::<f64>() * self.cfg.rotation_span_deg;
        }
        tf
    }

    /// Run the perturbation ladder until the kernel yields a merged mesh or
    /// the attempt bound is exhausted (Ok(None): terminal for the iteration,
    /// the caller surfaces it). The returned mesh is always in the original
    /// patch frame.
    pub fn intersect(
        &mut self,
        sim_dir: &Path,
        patches: &[MeshPatch],
        kernel: &mut dyn IntersectKernel,
        log: &Path,
    ) -> Result<Option<MeshPatch>> {
        if let Some(mesh) = kernel.existing(sim_dir)? {
            io::append_log(log, "INTERSECT: merged components already present")?;
            return Ok(Some(mesh));
        }

        io::append_log(log, "INTERSECT ATTEMPT 1: unperturbed components")?;
        if let Some(mesh) = kernel.attempt(sim_dir, patches)? {
            return Ok(Some(mesh));
        }

        io::append_log(log, "INTERSECT ATTEMPT 2: jittered components")?;
        if let Some(mesh) = kernel.existing(sim_dir)? {
            return Ok(Some(mesh));
        }
        let jittered = self.jitter(patches);
        if let Some(mesh) = kernel.attempt(sim_dir, &jittered)? {
            return Ok(Some(mesh));
        }

        for attempt in 0..self.cfg.max_attempts {
            io::append_log(
                log,
                &format!("INTERSECT ATTEMPT {}: rigid transform", attempt + 3),
            )?;
            if let Some(mesh) = kernel.existing(sim_dir)? {
                return Ok(Some(mesh));
            }

            let tf = self.random_transform();
            // Re-derive from the pristine patches every attempt so failed
            // transforms cannot accumulate.
            let mut moved: Vec<MeshPatch> =
                patches.iter().map(|p| p.transformed(&tf)).collect();
            if attempt > 0 {
                moved = self.jitter(&moved);
            }

            if let Some(mut mesh) = kernel.attempt(sim_dir, &moved)? {
                io::append_log(log, "INTERSECT: success, restoring original frame")?;
                for p in mesh.points.iter_mut() {
                    *p = tf.invert(*p);
                }
                return Ok(Some(mesh));
            }
        }

        io::append_log(log, "INTERSECT: all perturbation attempts exhausted")?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_about_z() {
        let p = rotate([1.0, 0.0, 0.0], 2, 90.0);
        assert!((p[0]).abs() < 1e-12);
        assert!((p[1] - 1.0).abs() < 1e-12);
        assert!((p[2]).abs() < 1e-12);
    }

    #[test]
    fn test_transform_roundtrip() {
        let tf = RigidTransform {
            shift: [3.2, -1.5, 0.7],
            rot_deg: [12.0, 34.0, 56.0],
        };
        let p = [0.3, -2.2, 5.1];
        let q = tf.invert(tf.apply(p));
        for i in 0..3 {
            assert!((q[i] - p[i]).abs() < 1e-12, "axis {} drifted", i);
        }
    }
}
