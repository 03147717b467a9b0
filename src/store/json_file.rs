//! State store persisted as a JSON document.

use std::{
    collections::HashSet,
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{LazyLock, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{info, warn};

use super::{LockState, StateStore, StoreDocument, StoreTxn, StoreView};

/// How long a lock file without a readable pid is assumed to be mid-write.
const UNWRITTEN_LOCK_GRACE: Duration = Duration::from_secs(5);

/// Lock files held by stores of this process.
static HELD_LOCKS: LazyLock<Mutex<HashSet<PathBuf>>> = LazyLock::new(Default::default);

fn held_locks() -> MutexGuard<'static, HashSet<PathBuf>> {
    HELD_LOCKS.lock().unwrap_or_else(PoisonError::into_inner)
}

/// JSON-file state store with an advisory `<path>.lock` single-writer lock.
///
/// The lock file holds the owner's pid. A lock left behind by a process
/// that no longer exists is taken over; a live owner makes the lock
/// contended. Our own pid only counts as live when a store of this process
/// holds the lock, otherwise it was left by an earlier run that got the
/// same pid. A lock file without a pid is stale once it is older than
/// [`UNWRITTEN_LOCK_GRACE`]. The lock is released when the store is dropped.
pub struct JsonFileStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_held: bool,
    subsystem_keys: Option<Vec<(String, String)>>,
    seqno: u64,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");

        Self {
            path,
            lock_path: PathBuf::from(lock_path),
            lock_held: false,
            subsystem_keys: None,
            seqno: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn try_lock(&mut self) -> Result<LockState> {
        if self.lock_held {
            return Ok(LockState::Held);
        }

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
        {
            Ok(mut file) => {
                write!(file, "{}", std::process::id()).with_context(|| {
                    format!("Failed to write lock file {}", self.lock_path.display())
                })?;
                self.lock_held = true;
                held_locks().insert(self.lock_path.clone());
                info!("Acquired state store lock {}", self.lock_path.display());
                Ok(LockState::Held)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if self.owner_alive() {
                    return Ok(LockState::Contended);
                }
                warn!(
                    "Removing stale state store lock {}",
                    self.lock_path.display()
                );
                match fs::remove_file(&self.lock_path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(e).with_context(|| {
                            format!("Failed to remove stale lock {}", self.lock_path.display())
                        });
                    }
                }
                Ok(LockState::Pending)
            }
            Err(e) => Err(e)
                .with_context(|| format!("Failed to create lock file {}", self.lock_path.display())),
        }
    }

    fn owner_alive(&self) -> bool {
        let Ok(content) = fs::read_to_string(&self.lock_path) else {
            return false;
        };

        match content.trim().parse::<u32>() {
            Ok(pid) if pid == std::process::id() => held_locks().contains(&self.lock_path),
            Ok(pid) => Path::new("/proc").join(pid.to_string()).exists(),
            // a peer between creating the file and writing its pid
            Err(_) => self.lock_age().is_some_and(|age| age < UNWRITTEN_LOCK_GRACE),
        }
    }

    fn lock_age(&self) -> Option<Duration> {
        fs::metadata(&self.lock_path)
            .and_then(|meta| meta.modified())
            .ok()?
            .elapsed()
            .ok()
    }

    async fn load(&self) -> Result<StoreDocument> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse state store {}", self.path.display())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(StoreDocument::default()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read state store {}", self.path.display())),
        }
    }

    async fn save(&self, document: &StoreDocument) -> Result<()> {
        let json =
            serde_json::to_string_pretty(document).context("Failed to serialize state store")?;

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("Failed to move state store to {}", self.path.display()))
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn refresh(&mut self) -> Result<StoreView> {
        let lock = self.try_lock()?;
        let document = self.load().await?;

        let keys = document.subsystem_keys();
        if self.subsystem_keys.as_ref() != Some(&keys) {
            self.subsystem_keys = Some(keys);
            self.seqno += 1;
        }

        Ok(StoreView {
            lock,
            seqno: self.seqno,
            document,
        })
    }

    async fn commit(&mut self, txn: StoreTxn) -> Result<()> {
        if txn.is_empty() {
            return Ok(());
        }
        let mut document = self.load().await?;
        document.apply(&txn);
        self.save(&document).await
    }

    fn watch_path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

impl Drop for JsonFileStore {
    fn drop(&mut self) {
        if self.lock_held {
            held_locks().remove(&self.lock_path);
            if let Err(e) = fs::remove_file(&self.lock_path) {
                warn!(
                    "Failed to release state store lock {}: {e}",
                    self.lock_path.display()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{FanSpeed, SensorStatus},
        store::{StoreOp, SubsystemRow, TempSensorRecord, tests::record},
    };
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn write_document(path: &Path, document: &StoreDocument) {
        fs::write(path, serde_json::to_string(document).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty_store() {
        let dir = TempDir::new().unwrap();
        let mut store = JsonFileStore::new(dir.path().join("state.json"));

        let view = store.refresh().await.unwrap();

        assert_eq!(view.lock, LockState::Held);
        assert_eq!(view.document, StoreDocument::default());
    }

    #[tokio::test]
    async fn published_record_reads_back_identically() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let mut store = JsonFileStore::new(&path);
        let published = TempSensorRecord {
            name: "base-1".to_string(),
            location: "Faceplate_side_of_switch_chip_U16".to_string(),
            temperature: 20_500,
            min: 0,
            max: 21_000,
            status: SensorStatus::Emergency,
            fan_state: FanSpeed::Max,
        };
        let mut txn = StoreTxn::new();
        txn.push(StoreOp::InsertSensor(published.clone()));

        store.commit(txn).await.unwrap();
        let view = store.refresh().await.unwrap();

        assert_eq!(view.document.sensor("base-1"), Some(&published));
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"emergency\""));
        assert!(raw.contains("\"max\""));
    }

    #[tokio::test]
    async fn seqno_changes_only_with_subsystem_set() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let mut store = JsonFileStore::new(&path);
        let first = store.refresh().await.unwrap().seqno;

        let mut txn = StoreTxn::new();
        txn.push(StoreOp::InsertSensor(record("base-1")));
        store.commit(txn).await.unwrap();
        assert_eq!(store.refresh().await.unwrap().seqno, first);

        write_document(
            &path,
            &StoreDocument {
                subsystems: vec![SubsystemRow {
                    name: "base".into(),
                    hw_desc_dir: "/etc/hw/base".into(),
                    temp_sensors: vec![],
                }],
                ..Default::default()
            },
        );
        assert_eq!(store.refresh().await.unwrap().seqno, first + 1);
    }

    #[tokio::test]
    async fn second_instance_is_contended_until_first_drops() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let mut first = JsonFileStore::new(&path);
        let mut second = JsonFileStore::new(&path);

        assert_eq!(first.refresh().await.unwrap().lock, LockState::Held);
        assert_eq!(second.refresh().await.unwrap().lock, LockState::Contended);

        drop(first);
        assert_eq!(second.refresh().await.unwrap().lock, LockState::Held);
    }

    #[tokio::test]
    async fn stale_lock_is_taken_over() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let mut store = JsonFileStore::new(&path);
        // pid beyond pid_max never exists
        fs::write(dir.path().join("state.json.lock"), "4294967").unwrap();

        assert_eq!(store.refresh().await.unwrap().lock, LockState::Pending);
        assert_eq!(store.refresh().await.unwrap().lock, LockState::Held);
    }

    #[tokio::test]
    async fn lock_left_with_our_own_pid_is_stale() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let mut store = JsonFileStore::new(&path);
        fs::write(
            dir.path().join("state.json.lock"),
            std::process::id().to_string(),
        )
        .unwrap();

        assert_eq!(store.refresh().await.unwrap().lock, LockState::Pending);
        assert_eq!(store.refresh().await.unwrap().lock, LockState::Held);
    }

    #[tokio::test]
    async fn lock_without_pid_expires() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let lock_path = dir.path().join("state.json.lock");
        let mut store = JsonFileStore::new(&path);
        fs::write(&lock_path, "").unwrap();

        assert_eq!(store.refresh().await.unwrap().lock, LockState::Contended);

        fs::File::options()
            .write(true)
            .open(&lock_path)
            .unwrap()
            .set_modified(std::time::SystemTime::now() - Duration::from_secs(60))
            .unwrap();

        assert_eq!(store.refresh().await.unwrap().lock, LockState::Pending);
        assert_eq!(store.refresh().await.unwrap().lock, LockState::Held);
    }

    #[tokio::test]
    async fn corrupt_store_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();
        let mut store = JsonFileStore::new(&path);

        let err = store.refresh().await.unwrap_err();
        assert!(err.to_string().contains("Failed to parse state store"));
    }
}
