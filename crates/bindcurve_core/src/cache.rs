use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("File I/O error for '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("CSV error for '{path}': {source}")]
    Csv { path: String, source: csv::Error },
    #[error("Invalid number '{value}' in '{path}'")]
    Parse { path: String, value: String },
}

/// Rows of numbers, one row per sweep point.
pub type Grid = Vec<Vec<f64>>;

/// Sweep results stored as header-less CSV files, one per key.
///
/// Entries are never invalidated and concurrent writers to the same key are
/// not coordinated.
#[derive(Debug, Clone)]
pub struct SweepCache {
    root: PathBuf,
}

impl SweepCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.path(key).is_file()
    }

    pub fn read(&self, key: &str) -> Result<Grid, CacheError> {
        read_grid(&self.path(key))
    }

    pub fn write(&self, key: &str, grid: &[Vec<f64>]) -> Result<(), CacheError> {
        write_grid(&self.path(key), grid)
    }

    /// Returns the grid stored under `key`, or computes and stores it.
    pub fn load_or_compute<E, F>(&self, key: &str, compute: F) -> Result<Grid, E>
    where
        E: From<CacheError>,
        F: FnOnce() -> Result<Grid, E>,
    {
        let path = self.path(key);
        if path.is_file() {
            debug!(path = %path.display(), "sweep cache hit");
            return Ok(read_grid(&path)?);
        }
        debug!(path = %path.display(), "sweep cache miss");
        let grid = compute()?;
        write_grid(&path, &grid)?;
        Ok(grid)
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn read_grid(path: &Path) -> Result<Grid, CacheError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| CacheError::Csv {
            path: display(path),
            source: e,
        })?;

    let mut grid = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|e| CacheError::Csv {
            path: display(path),
            source: e,
        })?;
        // The writer emits `""` for an empty row.
        if record.len() == 1 && record[0].trim().is_empty() {
            grid.push(Vec::new());
            continue;
        }
        let row = record
            .iter()
            .map(|field| {
                field.trim().parse::<f64>().map_err(|_| CacheError::Parse {
                    path: display(path),
                    value: field.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        grid.push(row);
    }
    Ok(grid)
}

fn write_grid(path: &Path, grid: &[Vec<f64>]) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CacheError::Io {
            path: display(parent),
            source: e,
        })?;
    }
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| CacheError::Csv {
            path: display(path),
            source: e,
        })?;
    for row in grid {
        writer
            .write_record(row.iter().map(|v| v.to_string()))
            .map_err(|e| CacheError::Csv {
                path: display(path),
                source: e,
            })?;
    }
    writer.flush().map_err(|e| CacheError::Io {
        path: display(path),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BindingError;
    use crate::system::{BindingSystem, Query};
    use std::cell::Cell;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn miss_computes_and_writes_then_hit_reads() {
        let dir = tempdir().expect("tempdir");
        let cache = SweepCache::new(dir.path());
        let calls = Cell::new(0);
        let grid = vec![vec![0.1, 1.0 / 3.0], vec![2.5e-12, 7.0]];

        let compute = || -> Result<Grid, CacheError> {
            calls.set(calls.get() + 1);
            Ok(grid.clone())
        };
        assert!(!cache.contains("curve.csv"));
        let first = cache.load_or_compute("curve.csv", compute).expect("first");
        assert!(cache.contains("curve.csv"));
        let second = cache
            .load_or_compute("curve.csv", || -> Result<Grid, CacheError> {
                calls.set(calls.get() + 1);
                Ok(Vec::new())
            })
            .expect("second");

        assert_eq!(calls.get(), 1);
        assert_eq!(first, grid);
        assert_eq!(second, grid);
    }

    #[test]
    fn ragged_rows_and_nested_keys() {
        let dir = tempdir().expect("tempdir");
        let cache = SweepCache::new(dir.path());
        let grid = vec![vec![1.0], vec![], vec![2.0, 3.0, 4.0]];
        cache.write("runs/a.csv", &grid).expect("write");
        assert_eq!(cache.read("runs/a.csv").expect("read"), grid);
    }

    #[test]
    fn compute_errors_are_not_cached() {
        let dir = tempdir().expect("tempdir");
        let cache = SweepCache::new(dir.path());
        let result = cache.load_or_compute("bad.csv", || -> Result<Grid, BindingError> {
            Err(BindingError::UnknownSystem("nope".into()))
        });
        assert!(matches!(result, Err(BindingError::UnknownSystem(_))));
        assert!(!cache.contains("bad.csv"));
    }

    #[test]
    fn malformed_file_reports_parse_error() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("broken.csv"), "1.0,abc\n").expect("write");
        let cache = SweepCache::new(dir.path());
        let result = cache.load_or_compute("broken.csv", || -> Result<Grid, BindingError> {
            Ok(Vec::new())
        });
        match result {
            Err(BindingError::Cache(CacheError::Parse { value, .. })) => assert_eq!(value, "abc"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn caches_a_binding_curve() {
        let dir = tempdir().expect("tempdir");
        let cache = SweepCache::new(dir.path());
        let system = BindingSystem::one_to_one();
        let query = Query::new()
            .with_sweep("p", vec![0.5, 1.0, 2.0])
            .with("l", 1.0)
            .with("kdpl", 1.0);

        let compute = || -> Result<Grid, BindingError> {
            Ok(vec![system.query(&query)?.values()])
        };
        let computed = cache.load_or_compute("one_to_one.csv", compute).expect("computed");
        let cached = cache.read("one_to_one.csv").expect("cached");
        assert_eq!(computed, cached);
        assert_eq!(cached[0].len(), 3);
    }
}
