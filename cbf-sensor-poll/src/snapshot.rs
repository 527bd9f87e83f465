//! Snapshot writer
//!
//! Publishes the two JSON documents a dashboard reads after every poll:
//! - `<prefix>.sensor_values.json`: normalized per-host signal chains
//! - `<prefix>.ordered_sensor_values.json`: non-nominal sensors per host
//!
//! Each file is replaced atomically, so a reader sees either the previous
//! document or the new one and never a partial write.

use crate::error::Result;
use crate::normalize::{NonNominalIndex, NormalizedHostSensors};
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use tempfile::Builder;
use std::path::{Path, PathBuf};
use tracing::debug;

const SENSOR_VALUES_SUFFIX: &str = "sensor_values.json";
const ORDERED_VALUES_SUFFIX: &str = "ordered_sensor_values.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPaths {
    pub sensor_values: PathBuf,
    pub ordered_sensor_values: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    paths: SnapshotPaths,
}

impl SnapshotWriter {
    /// Files named `<prefix>.sensor_values.json` and
    /// `<prefix>.ordered_sensor_values.json` inside `dir`
    pub fn new(dir: impl AsRef<Path>, prefix: &str) -> Self {
        let dir = dir.as_ref();
        Self {
            paths: SnapshotPaths {
                sensor_values: dir.join(format!("{prefix}.{SENSOR_VALUES_SUFFIX}")),
                ordered_sensor_values: dir.join(format!("{prefix}.{ORDERED_VALUES_SUFFIX}")),
            },
        }
    }

    /// Write the normalized document to `sensor_file` instead; the ordered
    /// document lands next to it.
    pub fn with_sensor_file(mut self, sensor_file: impl Into<PathBuf>) -> Self {
        let sensor_file = sensor_file.into();
        let ordered_name = match sensor_file.file_name().and_then(|n| n.to_str()) {
            Some(name) => match name.strip_suffix(SENSOR_VALUES_SUFFIX) {
                Some(stem) => format!("{stem}{ORDERED_VALUES_SUFFIX}"),
                None => format!("{name}.ordered"),
            },
            None => ORDERED_VALUES_SUFFIX.to_string(),
        };
        self.paths.ordered_sensor_values = sensor_file.with_file_name(ordered_name);
        self.paths.sensor_values = sensor_file;
        self
    }

    pub fn paths(&self) -> &SnapshotPaths {
        &self.paths
    }

    pub fn write(&self, normalized: &NormalizedHostSensors, non_nominal: &NonNominalIndex) -> Result<SnapshotPaths> {
        write_json_atomic(&self.paths.sensor_values, normalized)?;
        write_json_atomic(&self.paths.ordered_sensor_values, non_nominal)?;
        debug!(
            "Wrote {} hosts to {} and {} hosts to {}",
            normalized.len(),
            self.paths.sensor_values.display(),
            non_nominal.len(),
            self.paths.ordered_sensor_values.display()
        );
        Ok(self.paths.clone())
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    write_atomic_file(path, &bytes)
}

/// Uniquely named temp file in the target directory, fsync, rename over the
/// target. The temp file is removed if any step fails, and concurrent
/// writers of one target never share a temp file.
pub fn write_atomic_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    let mut tmp = Builder::new()
        .prefix(&format!(".{file_name}."))
        .suffix(".tmp")
        .tempfile_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    // Persist the rename itself; not every platform can open a directory
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{NonNominalSensor, SensorEntry};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn sample(rows: usize) -> NormalizedHostSensors {
        (0..rows)
            .map(|i| {
                (
                    format!("host{i:02}"),
                    vec![
                        SensorEntry::new(format!("{i:02}-020709"), "nominal"),
                        SensorEntry::new("network", "warn"),
                    ],
                )
            })
            .collect()
    }

    #[test]
    fn test_writes_both_documents() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path().join("json_dumps"), "10.103.254.6.array0");

        let mut non_nominal = NonNominalIndex::new();
        non_nominal.insert(
            "fhost00".into(),
            vec![NonNominalSensor("fhost00.network.device-status".into(), "warn".into(), "x".into())],
        );
        let paths = writer.write(&sample(2), &non_nominal).unwrap();

        assert!(paths.sensor_values.ends_with("json_dumps/10.103.254.6.array0.sensor_values.json"));
        let text = fs::read_to_string(&paths.sensor_values).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["host01"][1], serde_json::json!(["network", "warn"]));

        let ordered: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.ordered_sensor_values).unwrap()).unwrap();
        assert_eq!(
            ordered["fhost00"][0],
            serde_json::json!(["fhost00.network.device-status", "warn", "x"])
        );
    }

    #[test]
    fn test_keys_are_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path(), "inst.array0");
        let paths = writer.write(&sample(12), &NonNominalIndex::new()).unwrap();
        let text = fs::read_to_string(paths.sensor_values).unwrap();
        let positions: Vec<usize> = (0..12).map(|i| text.find(&format!("\"host{i:02}\"")).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_sensor_file_override() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path(), "unused")
            .with_sensor_file(dir.path().join("site/cbf.sensor_values.json"));
        let paths = writer.write(&sample(1), &NonNominalIndex::new()).unwrap();
        assert_eq!(paths.sensor_values, dir.path().join("site/cbf.sensor_values.json"));
        assert_eq!(paths.ordered_sensor_values, dir.path().join("site/cbf.ordered_sensor_values.json"));
        assert!(paths.ordered_sensor_values.exists());
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path(), "inst.array0");
        writer.write(&sample(3), &NonNominalIndex::new()).unwrap();
        writer.write(&sample(4), &NonNominalIndex::new()).unwrap();
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2, "unexpected files: {names:?}");
        assert!(names.iter().all(|n| !n.starts_with('.')));
    }

    #[test]
    fn test_failed_write_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("inst.sensor_values.json");
        write_atomic_file(&target, b"{\"good\": true}\n").unwrap();

        // Renaming a file over a non-empty directory fails
        let blocked = dir.path().join("blocked");
        fs::create_dir_all(blocked.join("inner")).unwrap();
        assert!(write_atomic_file(&blocked, b"{}").is_err());

        assert_eq!(fs::read_to_string(&target).unwrap(), "{\"good\": true}\n");
        assert!(blocked.join("inner").is_dir());
    }

    #[test]
    fn test_concurrent_writers_of_one_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("cbf.sensor_values.json");

        let writers: Vec<_> = (0..2)
            .map(|id| {
                let target = target.clone();
                std::thread::spawn(move || {
                    for round in 0..50 {
                        let doc = serde_json::json!({ "writer": id, "round": round });
                        write_atomic_file(&target, doc.to_string().as_bytes()).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let parsed: serde_json::Value = serde_json::from_str(&fs::read_to_string(&target).unwrap()).unwrap();
        assert_eq!(parsed["round"], 49);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_concurrent_reader_never_sees_partial_document() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path(), "inst.array0");
        let path = writer.paths().sensor_values.clone();
        writer.write(&sample(1), &NonNominalIndex::new()).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let done = done.clone();
            let path = path.clone();
            std::thread::spawn(move || {
                let mut reads = 0;
                loop {
                    let text = fs::read_to_string(&path).unwrap();
                    let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
                    assert!(parsed.is_object());
                    reads += 1;
                    if done.load(Ordering::SeqCst) {
                        return reads;
                    }
                }
            })
        };

        for rows in 1..60 {
            writer.write(&sample(rows), &NonNominalIndex::new()).unwrap();
        }
        done.store(true, Ordering::SeqCst);
        assert!(reader.join().unwrap() > 0);
    }
}
