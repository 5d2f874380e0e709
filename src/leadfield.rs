//! Lead-field file I/O (C7): format detection and read/write for the four
//! on-disk lead-field formats. All binary layouts are little-endian.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use nalgebra::DMatrix;

use crate::{Error, Result};

const RIS_MAGIC: i32 = 0x1234_5678;

/// Component selection used by [`write_file`] for the `ris`/`ep`/`sef` targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteLeadFieldOptions {
    ComponentsAutomatic,
    ComponentsNorm,
    ComponentsSplit,
}

fn read_i32le(r: &mut impl Read) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_f32le(r: &mut impl Read) -> io::Result<f32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

fn read_f64le(r: &mut impl Read) -> io::Result<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

fn read_i16le(r: &mut impl Read) -> io::Result<i16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(i16::from_le_bytes(buf))
}

/// Header-browsed handle to a lead-field file: dimensions known, matrix
/// not yet loaded.
#[derive(Debug, Clone)]
pub struct LeadField {
    pub path: PathBuf,
    pub num_electrodes: usize,
    pub num_solution_points: usize,
}

fn extension_lower(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_lowercase())
}

fn count_lines(path: &Path) -> Result<usize> {
    let file = File::open(path)?;
    Ok(BufReader::new(file)
        .lines()
        .filter_map(|l| l.ok())
        .filter(|l| !l.trim().is_empty())
        .count())
}

fn tokens_per_line(path: &Path) -> Result<usize> {
    let file = File::open(path)?;
    let first = BufReader::new(file)
        .lines()
        .filter_map(|l| l.ok())
        .find(|l| !l.trim().is_empty())
        .unwrap_or_default();
    Ok(first
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
        .count())
}

impl LeadField {
    /// Browses the header of `path` and infers `(num_electrodes, num_solution_points)`
    /// without reading the matrix itself. Format is dispatched by extension.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let ext = extension_lower(&path)
            .ok_or_else(|| Error::InvalidInput(format!("no extension: {}", path.display())))?;

        let metadata = std::fs::metadata(&path)?;
        if metadata.len() == 0 {
            return Err(Error::CorruptFormat(format!("empty file: {}", path.display())));
        }

        let (num_electrodes, num_solution_points) = match ext.as_str() {
            "ris" => {
                let mut f = File::open(&path)?;
                let magic = read_i32le(&mut f)?;
                let is_inverse_scalar = read_i32le(&mut f)? != 0;
                let num_time_frames = read_i32le(&mut f)?;
                let num_solution_points = read_i32le(&mut f)?;
                if magic != RIS_MAGIC || is_inverse_scalar {
                    return Err(Error::CorruptFormat("ris magic/header mismatch".into()));
                }
                (num_time_frames as usize, num_solution_points as usize)
            }
            "lft" => {
                let mut f = File::open(&path)?;
                let _magic = read_i32le(&mut f)?;
                let dim1 = read_i32le(&mut f)? as usize;
                let dim2 = read_i32le(&mut f)? as usize;
                let source_dim = read_i32le(&mut f)?;
                if source_dim != 3 {
                    return Err(Error::CorruptFormat("lft source dimensionality != 3".into()));
                }
                (dim1, dim2)
            }
            "lf" => {
                let mut f = File::open(&path)?;
                let dim1 = read_i32le(&mut f)? as usize;
                let raw_dim2 = read_i32le(&mut f)? as usize;
                (dim1, raw_dim2 / 3)
            }
            "csv" => {
                let dim1 = count_lines(&path)?;
                let dim2 = tokens_per_line(&path)? / 3;
                if dim1 == 0 || dim2 == 0 {
                    return Err(Error::CorruptFormat("csv has no usable rows/columns".into()));
                }
                (dim1, dim2)
            }
            other => {
                return Err(Error::InvalidInput(format!("unsupported lead-field extension: {other}")));
            }
        };

        if num_electrodes == 0 || num_solution_points == 0 {
            return Err(Error::CorruptFormat("zero electrodes or solution points".into()));
        }

        Ok(Self { path, num_electrodes, num_solution_points })
    }

    /// Reads the full matrix, shape `(num_electrodes, 3 * num_solution_points)`.
    pub fn read_matrix(&self) -> Result<DMatrix<f64>> {
        let ext = extension_lower(&self.path).unwrap_or_default();
        let numel = self.num_electrodes;
        let numsolp = self.num_solution_points;
        let numsolp3 = 3 * numsolp;
        let mut k = DMatrix::<f64>::zeros(numel, numsolp3);

        match ext.as_str() {
            "ris" => {
                let mut f = File::open(&self.path)?;
                f.seek_to_after_ris_header()?;
                for el in 0..numel {
                    for sp3 in 0..numsolp3 {
                        k[(el, sp3)] = read_f32le(&mut f)? as f64;
                    }
                }
            }
            "lf" => {
                let mut f = File::open(&self.path)?;
                f.seek_past(2 * 4)?;
                for el in 0..numel {
                    for sp3 in 0..numsolp3 {
                        k[(el, sp3)] = read_f64le(&mut f)?;
                    }
                }
            }
            "lft" => {
                let mut f = File::open(&self.path)?;
                f.seek_past(4 * 4)?;
                let mut maxsp = vec![0f32; numsolp * 3];
                for v3 in 0..3 {
                    for sp in 0..numsolp {
                        maxsp[sp * 3 + v3] = read_f32le(&mut f)?;
                    }
                }
                for el in 0..numel {
                    for v3 in 0..3 {
                        for sp in 0..numsolp {
                            let i16v = read_i16le(&mut f)?;
                            let scale = maxsp[sp * 3 + v3] as f64;
                            k[(el, 3 * sp + v3)] = scale * (i16v as f64 / i16::MAX as f64);
                        }
                    }
                }
            }
            "csv" => {
                let file = File::open(&self.path)?;
                let mut values = BufReader::new(file)
                    .lines()
                    .filter_map(|l| l.ok())
                    .flat_map(|line| {
                        line.split(|c: char| c.is_whitespace() || c == ',')
                            .filter(|t| !t.is_empty())
                            .map(|t| t.parse::<f64>().unwrap_or(0.0))
                            .collect::<Vec<_>>()
                    });
                for el in 0..numel {
                    for sp3 in 0..numsolp3 {
                        k[(el, sp3)] = values.next().ok_or_else(|| {
                            Error::CorruptFormat("csv truncated before matrix was full".into())
                        })?;
                    }
                }
            }
            other => return Err(Error::InvalidInput(format!("unsupported lead-field extension: {other}"))),
        }

        Ok(k)
    }
}

trait SeekPast {
    fn seek_past(&mut self, bytes: usize) -> io::Result<()>;
    fn seek_to_after_ris_header(&mut self) -> io::Result<()>;
}

impl SeekPast for File {
    fn seek_past(&mut self, bytes: usize) -> io::Result<()> {
        let mut buf = vec![0u8; bytes];
        self.read_exact(&mut buf)
    }
    fn seek_to_after_ris_header(&mut self) -> io::Result<()> {
        // magic + is_inverse_scalar + num_time_frames + num_solution_points
        self.seek_past(4 * 4)
    }
}

/// Writes `k` (`num_electrodes` x `3*num_solution_points`) to `path`, format
/// dispatched by extension. `lf` is the only lossless binary round-trip
/// format; `ris`/`ep`/`sef` collapse to the requested component selection.
pub fn write_file(k: &DMatrix<f64>, path: impl AsRef<Path>, option: WriteLeadFieldOptions) -> Result<()> {
    let path = path.as_ref();
    let ext = extension_lower(path)
        .ok_or_else(|| Error::InvalidInput(format!("no extension: {}", path.display())))?;

    let numel = k.nrows();
    let numsolp3 = k.ncols();
    let numsolp = numsolp3 / 3;

    match ext.as_str() {
        "lf" => {
            let mut f = File::create(path)?;
            f.write_all(&(numel as i32).to_le_bytes())?;
            f.write_all(&(numsolp3 as i32).to_le_bytes())?;
            for el in 0..numel {
                for sp3 in 0..numsolp3 {
                    f.write_all(&k[(el, sp3)].to_le_bytes())?;
                }
            }
        }
        "ris" => {
            let mut f = File::create(path)?;
            f.write_all(&RIS_MAGIC.to_le_bytes())?;
            f.write_all(&0i32.to_le_bytes())?;
            match option {
                WriteLeadFieldOptions::ComponentsAutomatic => {
                    f.write_all(&(numel as i32).to_le_bytes())?;
                    f.write_all(&(numsolp as i32).to_le_bytes())?;
                    for el in 0..numel {
                        for sp3 in 0..numsolp3 {
                            f.write_all(&(k[(el, sp3)] as f32).to_le_bytes())?;
                        }
                    }
                }
                WriteLeadFieldOptions::ComponentsNorm => {
                    f.write_all(&(numel as i32).to_le_bytes())?;
                    f.write_all(&(numsolp as i32).to_le_bytes())?;
                    for el in 0..numel {
                        for sp in 0..numsolp {
                            let norm = (0..3)
                                .map(|v3| k[(el, 3 * sp + v3)].powi(2))
                                .sum::<f64>()
                                .sqrt();
                            f.write_all(&(norm as f32).to_le_bytes())?;
                        }
                    }
                }
                WriteLeadFieldOptions::ComponentsSplit => {
                    f.write_all(&(numel as i32).to_le_bytes())?;
                    f.write_all(&(numsolp3 as i32).to_le_bytes())?;
                    for el in 0..numel {
                        for sp3 in 0..numsolp3 {
                            f.write_all(&(k[(el, sp3)] as f32).to_le_bytes())?;
                        }
                    }
                }
            }
        }
        "txt" => {
            let mut f = File::create(path)?;
            for el in 0..numel {
                let row: Vec<String> = (0..numsolp3).map(|sp3| format!("{:.9}", k[(el, sp3)])).collect();
                writeln!(f, "{}", row.join(" "))?;
            }
        }
        "ep" | "sef" => {
            let mut f = File::create(path)?;
            match option {
                WriteLeadFieldOptions::ComponentsSplit => {
                    for sp3 in 0..numsolp3 {
                        let row: Vec<String> = (0..numel).map(|el| format!("{:.9}", k[(el, sp3)])).collect();
                        writeln!(f, "{}", row.join(" "))?;
                    }
                }
                _ => {
                    for sp in 0..numsolp {
                        let row: Vec<String> = (0..numel)
                            .map(|el| {
                                let norm = (0..3)
                                    .map(|v3| k[(el, 3 * sp + v3)].powi(2))
                                    .sum::<f64>()
                                    .sqrt();
                                format!("{norm:.9}")
                            })
                            .collect();
                        writeln!(f, "{}", row.join(" "))?;
                    }
                }
            }
        }
        "bin" => {
            // Raw in-memory dump: row-major f64, no header, no shape
            // recovery on read. Not recommended; kept only for parity
            // with the source format table.
            let mut f = File::create(path)?;
            for el in 0..numel {
                for sp3 in 0..numsolp3 {
                    f.write_all(&k[(el, sp3)].to_le_bytes())?;
                }
            }
        }
        other => return Err(Error::InvalidInput(format!("unsupported lead-field write target: {other}"))),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn random_matrix(numel: usize, numsolp: usize) -> DMatrix<f64> {
        let mut k = DMatrix::<f64>::zeros(numel, 3 * numsolp);
        let mut seed = 12345u64;
        for v in k.iter_mut() {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            *v = ((seed >> 33) as f64 / u32::MAX as f64) * 2.0 - 1.0;
        }
        k
    }

    #[test]
    fn lf_round_trip_is_exact() {
        let dir = std::env::temp_dir().join(format!("geonorm_lf_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("test.lf");

        let k = random_matrix(19, 50);
        write_file(&k, &path, WriteLeadFieldOptions::ComponentsAutomatic).unwrap();

        let lf = LeadField::open(&path).unwrap();
        assert_eq!(lf.num_electrodes, 19);
        assert_eq!(lf.num_solution_points, 50);

        let back = lf.read_matrix().unwrap();
        for (a, b) in k.iter().zip(back.iter()) {
            assert_eq!(a, b);
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn ris_header_rejects_wrong_magic() {
        let dir = std::env::temp_dir().join(format!("geonorm_ris_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.ris");
        let mut f = File::create(&path).unwrap();
        f.write_all(&0i32.to_le_bytes()).unwrap();
        f.write_all(&[0u8; 12]).unwrap();
        drop(f);

        assert!(LeadField::open(&path).is_err());
        std::fs::remove_file(&path).ok();
    }
}
