//! Error injection for the metadata store
//!
//! `FlakyRepository` wraps the SQLite repository and fails upserts on
//! demand, which is how tests simulate a crash between the document commit
//! and the row write. It can also hold a scan open, to interleave a
//! reconcile run with a finalize.

use async_trait::async_trait;
use blackhole_common::db::{TakeRow, TakeStatus};
use blackhole_common::{Error, Result};
use blackhole_ingest::repository::{SqliteTakeRepository, TakeRepository};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

pub struct FlakyRepository {
    inner: SqliteTakeRepository,
    failures_left: AtomicUsize,
    upsert_calls: AtomicUsize,
    upsert_delay_ms: AtomicU64,
    hold_scan: AtomicBool,
    scanned: Notify,
    resume_scan: Notify,
}

impl FlakyRepository {
    pub fn new(inner: SqliteTakeRepository) -> Self {
        Self {
            inner,
            failures_left: AtomicUsize::new(0),
            upsert_calls: AtomicUsize::new(0),
            upsert_delay_ms: AtomicU64::new(0),
            hold_scan: AtomicBool::new(false),
            scanned: Notify::new(),
            resume_scan: Notify::new(),
        }
    }

    /// Fail the next `n` upserts
    pub fn fail_next_upserts(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Fail every upsert until `heal`
    pub fn fail_all_upserts(&self) {
        self.failures_left.store(usize::MAX, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.failures_left.store(0, Ordering::SeqCst);
    }

    /// Delay every upsert (simulates a slow metadata store)
    pub fn delay_upserts(&self, delay: Duration) {
        self.upsert_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    /// The next scan returns only after `resume_scan`
    pub fn hold_next_scan(&self) {
        self.hold_scan.store(true, Ordering::SeqCst);
    }

    /// Wait until a held scan has read its rows
    pub async fn scan_taken(&self) {
        self.scanned.notified().await;
    }

    pub fn resume_scan(&self) {
        self.resume_scan.notify_one();
    }

    fn should_fail(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

#[async_trait]
impl TakeRepository for FlakyRepository {
    async fn get(&self, take_id: &str) -> Result<Option<TakeRow>> {
        self.inner.get(take_id).await
    }

    async fn upsert(&self, row: &TakeRow) -> Result<()> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.upsert_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.should_fail() {
            return Err(Error::Internal("injected row write failure".to_string()));
        }
        self.inner.upsert(row).await
    }

    async fn scan(&self, status: Option<TakeStatus>) -> Result<Vec<TakeRow>> {
        let rows = self.inner.scan(status).await?;
        if self.hold_scan.swap(false, Ordering::SeqCst) {
            self.scanned.notify_one();
            self.resume_scan.notified().await;
        }
        Ok(rows)
    }

    async fn set_status(&self, take_id: &str, status: TakeStatus) -> Result<bool> {
        self.inner.set_status(take_id, status).await
    }
}
