use crate::intersect::{MeshPatch, Vec3};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

// ============================================================================
// Key/value snapshot tables (parameters.csv, jacobian.csv, marker summaries)
// ============================================================================

pub fn write_kv_table(path: &Path, rows: &[(String, f64)]) -> Result<()> {
    let f = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut w = BufWriter::new(f);
    writeln!(w, "parameter,value")?;
    for (k, v) in rows {
        writeln!(w, "{},{:.12e}", k, v)?;
    }
    w.flush()?;
    Ok(())
}

pub fn read_kv_table(path: &Path) -> Result<Vec<(String, f64)>> {
    let f = File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut rows = Vec::new();
    for (i, line) in BufReader::new(f).lines().enumerate() {
        let line = line?;
        if i == 0 || line.trim().is_empty() {
            continue;
        }
        let (k, v) = line
            .split_once(',')
            .with_context(|| format!("{}: malformed row: {}", path.display(), line))?;
        let v: f64 = v
            .trim()
            .parse()
            .with_context(|| format!("{}: bad value in row: {}", path.display(), line))?;
        rows.push((k.to_string(), v));
    }
    Ok(rows)
}

/// Extract values from a key/value table in the given name order.
pub fn ordered_values(rows: &[(String, f64)], names: &[String]) -> Result<Vec<f64>> {
    names
        .iter()
        .map(|n| {
            rows.iter()
                .find(|(k, _)| k == n)
                .map(|(_, v)| *v)
                .with_context(|| format!("missing entry for parameter {}", n))
        })
        .collect()
}

pub fn write_objective(path: &Path, objective: f64) -> Result<()> {
    let mut f = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writeln!(f, "objective: {}", objective)?;
    Ok(())
}

pub fn read_objective(path: &Path) -> Result<f64> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let line = text
        .lines()
        .next()
        .with_context(|| format!("{} is empty", path.display()))?;
    let value = line
        .rsplit(':')
        .next()
        .with_context(|| format!("{}: malformed objective line", path.display()))?;
    value
        .trim()
        .parse()
        .with_context(|| format!("{}: bad objective value", path.display()))
}

// ============================================================================
// Surface patches (x,y,z vertex rows)
// ============================================================================

pub fn write_patch(path: &Path, patch: &MeshPatch) -> Result<()> {
    let f = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut w = BufWriter::new(f);
    writeln!(w, "x,y,z")?;
    for p in &patch.points {
        writeln!(w, "{:.12e},{:.12e},{:.12e}", p[0], p[1], p[2])?;
    }
    w.flush()?;
    Ok(())
}

pub fn read_patch(path: &Path, name: &str) -> Result<MeshPatch> {
    let f = File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut points = Vec::new();
    for (i, line) in BufReader::new(f).lines().enumerate() {
        let line = line?;
        if i == 0 || line.trim().is_empty() {
            continue;
        }
        let mut it = line.split(',');
        let mut p: Vec3 = [0.0; 3];
        for c in p.iter_mut() {
            *c = it
                .next()
                .with_context(|| format!("{}: short row: {}", path.display(), line))?
                .trim()
                .parse()
                .with_context(|| format!("{}: bad coordinate in: {}", path.display(), line))?;
        }
        points.push(p);
    }
    Ok(MeshPatch { name: name.to_string(), points })
}

// ============================================================================
// Solver loads report ("tag ... (C_X): value" lines)
// ============================================================================

const BODY_FRAME: [&str; 3] = ["C_A", "C_Y", "C_N"];
const WIND_FRAME: [&str; 3] = ["C_D", "C_S", "C_L"];
const MOMENTS: [&str; 4] = ["C_l", "C_m", "C_n", "C_M"];

#[derive(Debug, Clone, Copy)]
pub struct LoadsFilter {
    pub body: bool,
    pub wind: bool,
    pub moments: bool,
}

impl Default for LoadsFilter {
    fn default() -> Self {
        Self { body: true, wind: true, moments: true }
    }
}

/// Parse the solver's line-oriented coefficient report into a
/// "<family>-<tag>"-keyed table. Commented and malformed lines are skipped.
pub fn parse_loads(path: &Path, filter: LoadsFilter) -> Result<HashMap<String, f64>> {
    let f = File::open(path)
        .with_context(|| format!("failed to open loads report {}", path.display()))?;
    let mut loads = HashMap::new();
    for line in BufReader::new(f).lines() {
        let line = line?;
        if line.starts_with('#') {
            continue;
        }
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        let Some((text, number)) = collapsed.split_once(':') else {
            continue;
        };
        let Ok(value) = number.trim().parse::<f64>() else {
            continue;
        };
        let words: Vec<&str> = text.split(' ').collect();
        let (Some(tag), Some(last)) = (words.first(), words.last()) else {
            continue;
        };
        // Family code sits in parentheses at the end of the label: "(C_D)".
        let family: String = last.chars().skip(1).take(3).collect();
        let keep = (filter.body && BODY_FRAME.contains(&family.as_str()))
            || (filter.wind && WIND_FRAME.contains(&family.as_str()))
            || (filter.moments && MOMENTS.contains(&family.as_str()));
        if keep {
            loads.insert(format!("{}-{}", family, tag), value);
        }
    }
    Ok(loads)
}

/// Force sensitivities produced by the flow-sensitivity collaborator:
/// "parameter,dFx,dFy,dFz" rows.
pub fn read_force_sensitivities(path: &Path) -> Result<Vec<(String, Vec3)>> {
    let f = File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut rows = Vec::new();
    for (i, line) in BufReader::new(f).lines().enumerate() {
        let line = line?;
        if i == 0 || line.trim().is_empty() {
            continue;
        }
        let cols: Vec<&str> = line.split(',').collect();
        if cols.len() != 4 {
            bail!("{}: expected parameter,dFx,dFy,dFz, got: {}", path.display(), line);
        }
        let mut df: Vec3 = [0.0; 3];
        for (c, v) in df.iter_mut().zip(&cols[1..]) {
            *c = v
                .trim()
                .parse()
                .with_context(|| format!("{}: bad value in: {}", path.display(), line))?;
        }
        rows.push((cols[0].to_string(), df));
    }
    Ok(rows)
}

// ============================================================================
// Log helpers
// ============================================================================

pub fn append_log(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log {}", path.display()))?;
    writeln!(f, "{}", line)?;
    Ok(())
}

/// Last `max_bytes` of a log file. Returns an empty string if the file does
/// not exist yet (the solver may not have produced output).
pub fn read_log_tail(path: &Path, max_bytes: u64) -> Result<String> {
    let mut f = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to open log {}", path.display()))
        }
    };
    let len = f.metadata()?.len();
    if len > max_bytes {
        f.seek(SeekFrom::Start(len - max_bytes))?;
    }
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

// ============================================================================
// Optimisation history (results subcommand)
// ============================================================================

pub struct HistoryWriter {
    w: BufWriter<File>,
    params: Vec<String>,
}

impl HistoryWriter {
    pub fn create(path: &Path, params: &[String]) -> Result<Self> {
        let f = File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        Ok(Self { w: BufWriter::new(f), params: params.to_vec() })
    }

    pub fn write_header(&mut self) -> Result<()> {
        write!(self.w, "iteration,objective,penalty,step_size")?;
        for p in &self.params {
            write!(self.w, ",{}", p)?;
        }
        writeln!(self.w)?;
        Ok(())
    }

    pub fn write_row(&mut self, ordinal: u32, record: &HashMap<String, f64>) -> Result<()> {
        let field = |key: &str| -> Result<f64> {
            record
                .get(key)
                .copied()
                .with_context(|| format!("iteration {} record is missing {}", ordinal, key))
        };
        write!(
            self.w,
            "{},{:.6e},{:.6e},{:.6e}",
            ordinal,
            field("objective")?,
            field("penalty")?,
            field("step_size")?
        )?;
        for p in &self.params {
            write!(self.w, ",{:.6e}", field(p)?)?;
        }
        writeln!(self.w)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.w.flush()?;
        Ok(())
    }
}
