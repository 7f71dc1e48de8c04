//! Reconciliation of per-component sensitivity tables against the
//! intersected mesh's point cloud. Intersection reorders and merges
//! vertices, so exact binding is hopeless; matching runs under a spatial
//! tolerance that escalates geometrically (x10) until the match fraction
//! reaches the target or the tolerance cap is exceeded.

use crate::intersect::Vec3;
use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct SensRecord {
    pub pos: Vec3,
    /// Per-parameter vertex sensitivity (dx/dp, dy/dp, dz/dp).
    pub derivs: Vec<Vec3>,
}

#[derive(Debug, Clone)]
pub struct SensitivityTable {
    pub component: String,
    pub params: Vec<String>,
    pub records: Vec<SensRecord>,
}

impl SensitivityTable {
    /// Parse a component table: header `x,y,z` followed by
    /// `dxd<p>,dyd<p>,dzd<p>` triples, one parameter per triple.
    pub fn read(path: &Path) -> Result<Self> {
        let component = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let f = File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut lines = BufReader::new(f).lines();

        let header = lines
            .next()
            .with_context(|| format!("{} is empty", path.display()))??;
        let cols: Vec<&str> = header.split(',').map(|c| c.trim()).collect();
        if cols.len() < 6 || cols[..3] != ["x", "y", "z"] || (cols.len() - 3) % 3 != 0 {
            bail!("{}: malformed sensitivity header: {}", path.display(), header);
        }
        let mut params = Vec::new();
        for triple in cols[3..].chunks(3) {
            let p = triple[0]
                .strip_prefix("dxd")
                .with_context(|| format!("{}: bad column {}", path.display(), triple[0]))?;
            if triple[1] != format!("dyd{}", p) || triple[2] != format!("dzd{}", p) {
                bail!("{}: inconsistent column triple for {}", path.display(), p);
            }
            params.push(p.to_string());
        }

        let mut records = Vec::new();
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let values: Vec<f64> = line
                .split(',')
                .map(|v| v.trim().parse::<f64>())
                .collect::<Result<_, _>>()
                .with_context(|| format!("{}: bad row: {}", path.display(), line))?;
            if values.len() != 3 + params.len() * 3 {
                bail!("{}: short row: {}", path.display(), line);
            }
            let pos = [values[0], values[1], values[2]];
            let derivs = values[3..]
                .chunks(3)
                .map(|c| [c[0], c[1], c[2]])
                .collect();
            records.push(SensRecord { pos, derivs });
        }

        Ok(Self { component, params, records })
    }
}

/// One consolidated sensitivity table over the intersected mesh. Unmatched
/// vertices carry zero sensitivities and count against the match fraction.
#[derive(Debug, Clone)]
pub struct Consolidated {
    pub params: Vec<String>,
    pub points: Vec<Vec3>,
    pub derivs: Vec<Vec<Vec3>>,
    pub match_fraction: f64,
    /// Tolerance at which the accepted match was made.
    pub tolerance: f64,
}

impl Consolidated {
    pub fn write(&self, path: &Path) -> Result<()> {
        let f = File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        let mut w = BufWriter::new(f);
        write!(w, "x,y,z")?;
        for p in &self.params {
            write!(w, ",dxd{p},dyd{p},dzd{p}")?;
        }
        writeln!(w)?;
        for (point, derivs) in self.points.iter().zip(&self.derivs) {
            write!(w, "{:.12e},{:.12e},{:.12e}", point[0], point[1], point[2])?;
            for d in derivs {
                write!(w, ",{:.12e},{:.12e},{:.12e}", d[0], d[1], d[2])?;
            }
            writeln!(w)?;
        }
        w.flush()?;
        Ok(())
    }
}

fn dist2(a: Vec3, b: Vec3) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    dx * dx + dy * dy + dz * dz
}

/// One matching pass at a fixed tolerance. Returns the matched count and the
/// per-point sensitivities (zeros where unmatched).
pub fn match_at(
    points: &[Vec3],
    tables: &[SensitivityTable],
    tolerance: f64,
) -> (usize, Vec<Vec<Vec3>>) {
    let n_params = tables.first().map_or(0, |t| t.params.len());
    let tol2 = tolerance * tolerance;
    let mut matched = 0;
    let mut derivs = Vec::with_capacity(points.len());
    for &point in points {
        let hit = tables
            .iter()
            .flat_map(|t| t.records.iter())
            .find(|r| dist2(r.pos, point) <= tol2);
        match hit {
            Some(record) => {
                matched += 1;
                derivs.push(record.derivs.clone());
            }
            None => derivs.push(vec![[0.0; 3]; n_params]),
        }
    }
    (matched, derivs)
}

/// Match every mesh point to a sensitivity record, escalating the tolerance
/// x10 per pass. Failing to reach the target fraction before the tolerance
/// cap is unrecoverable: force sensitivities cannot be trusted below the
/// required coverage.
pub fn combine(
    points: &[Vec3],
    tables: &[SensitivityTable],
    target_fraction: f64,
    initial_tolerance: f64,
    max_tolerance: f64,
) -> Result<Consolidated> {
    if points.is_empty() {
        bail!("cannot combine sensitivity data: intersected mesh has no points");
    }
    if tables.is_empty() {
        bail!("cannot combine sensitivity data: no component sensitivity tables");
    }
    let params = tables[0].params.clone();
    for t in &tables[1..] {
        if t.params != params {
            bail!(
                "component {} lists different parameters than {}",
                t.component,
                tables[0].component
            );
        }
    }

    let mut tolerance = initial_tolerance;
    let mut fraction = 0.0;
    loop {
        if tolerance > max_tolerance {
            bail!(
                "cannot combine sensitivity data (match fraction {:.3}, tolerance {:.1e}, max tolerance {:.1e})",
                fraction,
                tolerance,
                max_tolerance
            );
        }

        let (matched, derivs) = match_at(points, tables, tolerance);
        fraction = matched as f64 / points.len() as f64;
        if fraction >= target_fraction {
            return Ok(Consolidated {
                params,
                points: points.to_vec(),
                derivs,
                match_fraction: fraction,
                tolerance,
            });
        }

        eprintln!(
            "[chimera] sensitivity match rate {:.2}% below target; raising tolerance to {:.1e}",
            100.0 * fraction,
            tolerance * 10.0
        );
        tolerance *= 10.0;
    }
}
