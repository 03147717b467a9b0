//! In-process state store.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Result, bail};
use async_trait::async_trait;

use super::{DaemonRecord, LockState, StateStore, StoreDocument, StoreTxn, StoreView, SubsystemRow};

#[derive(Debug, Default)]
struct Inner {
    document: StoreDocument,
    seqno: u64,
    contended: bool,
    failing: bool,
    commits: usize,
}

/// State store kept in memory. Clones share the same content, so a handle
/// kept outside the poll loop sees (and can change) what the loop sees.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the configured subsystems, bumping the sequence number if
    /// the set actually changed.
    pub fn set_subsystems(&self, rows: Vec<SubsystemRow>) {
        let mut inner = self.inner();
        let before = inner.document.subsystem_keys();
        inner.document.subsystems = rows;
        if inner.document.subsystem_keys() != before {
            inner.seqno += 1;
        }
    }

    pub fn add_daemon(&self, name: &str) {
        self.inner().document.daemons.push(DaemonRecord {
            name: name.to_string(),
            cur_hw: 0,
        });
    }

    /// Simulates a peer instance holding the lock.
    pub fn set_contended(&self, contended: bool) {
        self.inner().contended = contended;
    }

    /// Makes every non-empty commit fail until switched off.
    pub fn set_failing(&self, failing: bool) {
        self.inner().failing = failing;
    }

    pub fn document(&self) -> StoreDocument {
        self.inner().document.clone()
    }

    /// Number of non-empty transactions committed so far.
    pub fn commits(&self) -> usize {
        self.inner().commits
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn refresh(&mut self) -> Result<StoreView> {
        let inner = self.inner();
        Ok(StoreView {
            lock: if inner.contended {
                LockState::Contended
            } else {
                LockState::Held
            },
            seqno: inner.seqno,
            document: inner.document.clone(),
        })
    }

    async fn commit(&mut self, txn: StoreTxn) -> Result<()> {
        if txn.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner();
        if inner.failing {
            bail!("State store rejected the transaction");
        }
        inner.document.apply(&txn);
        inner.commits += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{StoreOp, tests::record};
    use pretty_assertions::assert_eq;

    fn row(name: &str) -> SubsystemRow {
        SubsystemRow {
            name: name.to_string(),
            hw_desc_dir: format!("/etc/hw/{name}"),
            temp_sensors: vec![],
        }
    }

    #[tokio::test]
    async fn seqno_tracks_subsystem_set() {
        let mut store = MemoryStore::new();
        let start = store.refresh().await.unwrap().seqno;

        store.set_subsystems(vec![row("base")]);
        let after_add = store.refresh().await.unwrap().seqno;
        assert!(after_add > start);

        store.set_subsystems(vec![row("base")]);
        assert_eq!(store.refresh().await.unwrap().seqno, after_add);
    }

    #[tokio::test]
    async fn clones_share_content() {
        let handle = MemoryStore::new();
        let mut store = handle.clone();
        let mut txn = StoreTxn::new();
        txn.push(StoreOp::InsertSensor(record("base-1")));

        store.commit(txn).await.unwrap();
        store.commit(StoreTxn::new()).await.unwrap();

        assert_eq!(handle.commits(), 1);
        assert_eq!(handle.document().sensor("base-1"), Some(&record("base-1")));
    }

    #[tokio::test]
    async fn failing_store_keeps_its_content() {
        let handle = MemoryStore::new();
        let mut store = handle.clone();
        handle.set_failing(true);
        let mut txn = StoreTxn::new();
        txn.push(StoreOp::InsertSensor(record("base-1")));

        assert!(store.commit(txn.clone()).await.is_err());
        assert_eq!(handle.commits(), 0);
        assert_eq!(handle.document(), StoreDocument::default());

        handle.set_failing(false);
        store.commit(txn).await.unwrap();
        assert_eq!(handle.commits(), 1);
    }

    #[tokio::test]
    async fn contention_is_reported() {
        let mut store = MemoryStore::new();
        store.set_contended(true);
        assert_eq!(store.refresh().await.unwrap().lock, LockState::Contended);
        store.set_contended(false);
        assert_eq!(store.refresh().await.unwrap().lock, LockState::Held);
    }
}
