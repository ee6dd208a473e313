//! JSON file counter store for single-host use.
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use comprobante_core::consecutive::{CounterStore, CounterStoreError, Partition};
use tracing::debug;

/// Counters kept as `{"tenant/branch/terminal/type": last}`.
///
/// Each `next` rewrites the whole file through a temporary file and a rename, so a crash leaves
/// either the old or the new counters. Concurrent processes sharing one file are not coordinated.
#[derive(Debug)]
pub struct FileCounterStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileCounterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    fn read(&self) -> Result<BTreeMap<String, u64>, CounterStoreError> {
        match fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(text) => serde_json::from_str(&text).map_err(|err| {
                CounterStoreError::Unavailable(format!(
                    "counter file {} is not valid JSON: {err}",
                    self.path.display()
                ))
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, counters: &BTreeMap<String, u64>) -> Result<(), CounterStoreError> {
        let json = serde_json::to_string_pretty(counters)
            .map_err(|err| CounterStoreError::Unavailable(err.to_string()))?;
        let tmp = temp_path(&self.path);
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

impl CounterStore for FileCounterStore {
    fn next(&self, partition: &Partition) -> Result<u64, CounterStoreError> {
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let mut counters = self.read()?;
        let counter = counters.entry(partition.to_string()).or_insert(0);
        let next = counter.checked_add(1).ok_or_else(|| {
            CounterStoreError::Unavailable(format!("counter for {partition} is exhausted"))
        })?;
        *counter = next;
        self.write(&counters)?;
        debug!(path = %self.path.display(), partition = %partition, next, "counter advanced");
        Ok(next)
    }
}
