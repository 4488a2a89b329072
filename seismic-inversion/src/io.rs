use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::visualisation::FieldPlotter;

/// On-disk format of fields (models, gradients, preconditioners).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    /// Dense matrix-market array, ASCII.
    #[default]
    Mtx,
    /// `nx`, `nz` as u64 followed by row-major f64, little endian.
    Bin,
    /// Diverging colour image, for inspection only.
    Png,
}

impl FileFormat {
    pub fn extension(self) -> &'static str {
        match self {
            FileFormat::Mtx => "mtx",
            FileFormat::Bin => "bin",
            FileFormat::Png => "png",
        }
    }
}

/// Writes `field` to `<base>.<ext>` and returns the path.
pub fn write_field(base: &str, field: &Array2<f64>, format: FileFormat) -> Result<PathBuf> {
    let path = PathBuf::from(format!("{}.{}", base, format.extension()));
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    match format {
        FileFormat::Mtx => write_mtx(&path, field)?,
        FileFormat::Bin => write_bin(&path, field)?,
        FileFormat::Png => {
            let title = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            FieldPlotter::for_field(field, 800, 600).plot_field(field, &path, &title)?
        }
    }
    Ok(path)
}

fn write_mtx(path: &Path, field: &Array2<f64>) -> Result<()> {
    let (nx, nz) = field.dim();
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "%%MatrixMarket matrix array real general")?;
    writeln!(out, "{} {}", nx, nz)?;
    // matrix-market arrays are column major
    for k in 0..nz {
        for i in 0..nx {
            writeln!(out, "{:e}", field[[i, k]])?;
        }
    }
    out.flush()?;
    Ok(())
}

fn write_bin(path: &Path, field: &Array2<f64>) -> Result<()> {
    let (nx, nz) = field.dim();
    let mut out = BufWriter::new(File::create(path)?);
    out.write_u64::<LittleEndian>(nx as u64)?;
    out.write_u64::<LittleEndian>(nz as u64)?;
    for &v in field.iter() {
        out.write_f64::<LittleEndian>(v)?;
    }
    out.flush()?;
    Ok(())
}

/// Appends one line to a text log, creating it if needed.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::ReadBytesExt;
    use ndarray::array;
    use std::io::Cursor;

    #[test]
    fn mtx_is_column_major() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("field");
        let field = array![[1.0, 2.0], [3.0, 4.0]];
        let path = write_field(base.to_str().unwrap(), &field, FileFormat::Mtx).unwrap();
        let text = fs::read_to_string(path).unwrap();
        let values: Vec<f64> = text.lines().skip(2).map(|l| l.parse().unwrap()).collect();
        assert_eq!(values, vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn bin_has_shape_header() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("sub/field");
        let field = array![[1.0, 2.0, 3.0]];
        let path = write_field(base.to_str().unwrap(), &field, FileFormat::Bin).unwrap();
        assert!(path.ends_with("sub/field.bin"));
        let mut cursor = Cursor::new(fs::read(path).unwrap());
        assert_eq!(cursor.read_u64::<LittleEndian>().unwrap(), 1);
        assert_eq!(cursor.read_u64::<LittleEndian>().unwrap(), 3);
        assert_eq!(cursor.read_f64::<LittleEndian>().unwrap(), 1.0);
    }

    #[test]
    fn log_lines_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("steplength.log");
        append_line(&log, "1 1 0.5 10").unwrap();
        append_line(&log, "1 2 0.25 8").unwrap();
        let text = fs::read_to_string(&log).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
