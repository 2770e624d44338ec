//! Background retention: age and total-size rules evaluated on a schedule.
//!
//! Rule evaluation ([`RetentionRule::select`]) is pure. Deletion happens per
//! candidate right after selection, so an interrupted cycle leaves whatever it
//! already removed removed and nothing else touched.

use crate::blob::BlobStore;
use crate::document::DocumentStore;
use crate::error::Result;
use crate::types::{BlobEntryMeta, DocumentEntryMeta, EntryMeta, LikeExpr, ListFilter, NamespaceFilter};
use chrono::{DateTime, TimeDelta, Utc};
use futures::stream::{BoxStream, TryStreamExt};
use std::collections::HashSet;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Delete entries older than either bound. Each bound is checked on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgeRule {
    pub namespace: String,
    pub key_pattern: Option<LikeExpr>,
    pub max_age_from_creation: Option<Duration>,
    pub max_age_from_last_change: Option<Duration>,
}

/// Delete the least recently modified entries until the namespace fits the budget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TotalSizeRule {
    pub namespace: String,
    pub key_pattern: Option<LikeExpr>,
    pub max_total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetentionRule {
    Age(AgeRule),
    TotalSize(TotalSizeRule),
}

fn exceeds(age: TimeDelta, bound: Option<Duration>) -> bool {
    match bound {
        // A bound too large for TimeDelta can never be exceeded
        Some(bound) => TimeDelta::from_std(bound).is_ok_and(|bound| age > bound),
        None => false,
    }
}

impl RetentionRule {
    pub fn age(
        namespace: impl Into<String>,
        max_age_from_creation: Option<Duration>,
        max_age_from_last_change: Option<Duration>,
    ) -> Self {
        RetentionRule::Age(AgeRule {
            namespace: namespace.into(),
            key_pattern: None,
            max_age_from_creation,
            max_age_from_last_change,
        })
    }

    pub fn total_size(namespace: impl Into<String>, max_total_bytes: u64) -> Self {
        RetentionRule::TotalSize(TotalSizeRule {
            namespace: namespace.into(),
            key_pattern: None,
            max_total_bytes,
        })
    }

    /// Restrict the rule to keys matching `pattern`
    pub fn with_key_pattern(mut self, pattern: impl Into<LikeExpr>) -> Self {
        let pattern = Some(pattern.into());
        match &mut self {
            RetentionRule::Age(rule) => rule.key_pattern = pattern,
            RetentionRule::TotalSize(rule) => rule.key_pattern = pattern,
        }
        self
    }

    pub fn namespace(&self) -> &str {
        match self {
            RetentionRule::Age(rule) => &rule.namespace,
            RetentionRule::TotalSize(rule) => &rule.namespace,
        }
    }

    pub fn key_pattern(&self) -> Option<&LikeExpr> {
        match self {
            RetentionRule::Age(rule) => rule.key_pattern.as_ref(),
            RetentionRule::TotalSize(rule) => rule.key_pattern.as_ref(),
        }
    }

    /// Entries from one namespace snapshot that violate this rule at `now`.
    ///
    /// For size rules the result is oldest first, and entries sharing a
    /// `last_modified` keep their input order.
    pub fn select<M: EntryMeta>(&self, entries: &[M], now: DateTime<Utc>) -> Vec<M> {
        match self {
            RetentionRule::Age(rule) => entries
                .iter()
                .filter(|e| {
                    exceeds(now - e.created(), rule.max_age_from_creation)
                        || exceeds(now - e.last_modified(), rule.max_age_from_last_change)
                })
                .cloned()
                .collect(),
            RetentionRule::TotalSize(rule) => {
                let mut total: u64 = entries.iter().map(EntryMeta::size).sum();
                if total <= rule.max_total_bytes {
                    return Vec::new();
                }
                let mut by_age: Vec<&M> = entries.iter().collect();
                by_age.sort_by_key(|e| e.last_modified());

                let mut selected = Vec::new();
                for entry in by_age {
                    if total <= rule.max_total_bytes {
                        break;
                    }
                    total -= entry.size();
                    selected.push(entry.clone());
                }
                selected
            }
        }
    }
}

/// What a retention engine needs from a store
pub trait RetentionTarget: Send + Sync + 'static {
    type Meta: EntryMeta;

    fn list_for_retention(
        &self,
        namespace: &str,
        key_pattern: Option<&LikeExpr>,
    ) -> BoxStream<'static, Result<Self::Meta>>;

    /// Delete the entry unless it was rewritten after `meta` was listed.
    /// Returns the number of rows removed.
    fn delete_entry(&self, meta: &Self::Meta) -> impl Future<Output = Result<u64>> + Send;
}

fn retention_filter(key_pattern: Option<&LikeExpr>) -> ListFilter {
    ListFilter {
        key_pattern: key_pattern.cloned(),
        ..ListFilter::default()
    }
}

impl RetentionTarget for DocumentStore {
    type Meta = DocumentEntryMeta;

    fn list_for_retention(
        &self,
        namespace: &str,
        key_pattern: Option<&LikeExpr>,
    ) -> BoxStream<'static, Result<DocumentEntryMeta>> {
        self.list_meta(NamespaceFilter::from(namespace), retention_filter(key_pattern))
    }

    async fn delete_entry(&self, meta: &DocumentEntryMeta) -> Result<u64> {
        self.delete(&meta.namespace, Some(&meta.key), None, Some(meta.last_modified))
            .await
    }
}

impl RetentionTarget for BlobStore {
    type Meta = BlobEntryMeta;

    fn list_for_retention(
        &self,
        namespace: &str,
        key_pattern: Option<&LikeExpr>,
    ) -> BoxStream<'static, Result<BlobEntryMeta>> {
        self.list_meta(NamespaceFilter::from(namespace), retention_filter(key_pattern))
    }

    async fn delete_entry(&self, meta: &BlobEntryMeta) -> Result<u64> {
        self.delete(&meta.namespace, Some(&meta.key), None, Some(meta.last_modified))
            .await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetentionState {
    #[default]
    Idle,
    Scanning,
    Deleting,
}

/// Published by a running engine after every phase change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionStatus {
    pub state: RetentionState,
    /// Completed cycles since attach
    pub cycles: u64,
    /// Entries removed by the most recent completed cycle
    pub last_deleted: usize,
}

pub type DeletedCallback<M> = Arc<dyn Fn(&HashSet<M>) + Send + Sync>;

pub struct RetentionOptions<M> {
    pub rules: Vec<RetentionRule>,
    pub scan_interval: Duration,
    /// Called once per cycle that deleted anything, with every entry it removed
    pub on_deleted: Option<DeletedCallback<M>>,
}

impl<M> Default for RetentionOptions<M> {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            scan_interval: DEFAULT_SCAN_INTERVAL,
            on_deleted: None,
        }
    }
}

impl<M> RetentionOptions<M> {
    pub fn new(rules: Vec<RetentionRule>) -> Self {
        Self {
            rules,
            ..Self::default()
        }
    }

    pub fn with_scan_interval(mut self, scan_interval: Duration) -> Self {
        self.scan_interval = scan_interval;
        self
    }

    pub fn on_deleted(mut self, callback: impl Fn(&HashSet<M>) + Send + Sync + 'static) -> Self {
        self.on_deleted = Some(Arc::new(callback));
        self
    }
}

/// Run every rule once against `target` and return what was deleted.
///
/// A rule whose listing fails is skipped; a failed delete is logged and the
/// cycle moves on to the next candidate.
pub async fn run_cycle<T: RetentionTarget>(
    target: &T,
    rules: &[RetentionRule],
    now: DateTime<Utc>,
) -> HashSet<T::Meta> {
    cycle(target, rules, now, None).await
}

async fn cycle<T: RetentionTarget>(
    target: &T,
    rules: &[RetentionRule],
    now: DateTime<Utc>,
    status: Option<&watch::Sender<RetentionStatus>>,
) -> HashSet<T::Meta> {
    let set_state = |state: RetentionState| {
        if let Some(status) = status {
            status.send_modify(|s| s.state = state);
        }
    };

    let mut deleted = HashSet::new();
    for rule in rules {
        set_state(RetentionState::Scanning);
        let entries: Vec<T::Meta> = match target
            .list_for_retention(rule.namespace(), rule.key_pattern())
            .try_collect()
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                warn!(namespace = %rule.namespace(), error = %e, "Retention scan failed");
                continue;
            }
        };

        let candidates = rule.select(&entries, now);
        if candidates.is_empty() {
            continue;
        }

        set_state(RetentionState::Deleting);
        debug!(
            "Retention rule on {} selected {} of {} entries",
            rule.namespace(),
            candidates.len(),
            entries.len()
        );
        for meta in candidates {
            match target.delete_entry(&meta).await {
                Ok(0) => {}
                Ok(_) => {
                    deleted.insert(meta);
                }
                Err(e) => {
                    warn!(
                        namespace = %meta.namespace(),
                        key = %meta.key(),
                        error = %e,
                        "Retention delete failed"
                    );
                }
            }
        }
    }
    deleted
}

pub struct RetentionEngine;

impl RetentionEngine {
    /// Start evaluating `options.rules` against `target`: once right away,
    /// then every `scan_interval`. Must be called inside a tokio runtime.
    pub fn attach<T: RetentionTarget>(
        target: Arc<T>,
        options: RetentionOptions<T::Meta>,
    ) -> RetentionHandle {
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(RetentionStatus::default());
        let task = tokio::spawn(run_loop(target, options, status_tx, cancel.clone()));
        RetentionHandle {
            cancel,
            status: status_rx,
            task: Some(task),
        }
    }
}

async fn run_loop<T: RetentionTarget>(
    target: Arc<T>,
    options: RetentionOptions<T::Meta>,
    status: watch::Sender<RetentionStatus>,
    cancel: CancellationToken,
) {
    let period = options.scan_interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        "Retention engine started with {} rule(s), scanning every {:?}",
        options.rules.len(),
        period
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let deleted = tokio::select! {
            _ = cancel.cancelled() => break,
            deleted = cycle(target.as_ref(), &options.rules, Utc::now(), Some(&status)) => deleted,
        };

        if !deleted.is_empty() {
            info!("Retention cycle removed {} entries", deleted.len());
            if let Some(callback) = &options.on_deleted {
                if catch_unwind(AssertUnwindSafe(|| callback(&deleted))).is_err() {
                    warn!("Retention callback panicked; continuing");
                }
            }
        }

        status.send_modify(|s| {
            s.state = RetentionState::Idle;
            s.cycles += 1;
            s.last_deleted = deleted.len();
        });
    }

    status.send_modify(|s| s.state = RetentionState::Idle);
    debug!("Retention engine stopped");
}

/// Owner of a running retention engine. Dropping it stops the engine.
pub struct RetentionHandle {
    cancel: CancellationToken,
    status: watch::Receiver<RetentionStatus>,
    task: Option<JoinHandle<()>>,
}

impl RetentionHandle {
    pub fn status(&self) -> RetentionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RetentionStatus> {
        self.status.clone()
    }

    /// Wait until at least `cycles` cycles have completed
    pub async fn wait_for_cycles(&self, cycles: u64) -> RetentionStatus {
        let mut rx = self.status.clone();
        if rx.wait_for(|s| s.cycles >= cycles).await.is_err() {
            debug!("Retention engine stopped before reaching cycle {}", cycles);
        }
        self.status.borrow().clone()
    }

    /// Stop the engine and wait for an in-flight cycle to unwind
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Retention task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for RetentionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn meta(key: &str, created: DateTime<Utc>, modified: DateTime<Utc>, length: u64) -> DocumentEntryMeta {
        DocumentEntryMeta {
            doc_id: 1,
            namespace: "ns".to_string(),
            key: key.to_string(),
            last_modified: modified,
            created,
            version: 1,
            length,
        }
    }

    async fn open_docs() -> (TempDir, Arc<DocumentStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path().join("docs.db")).await.unwrap();
        (dir, Arc::new(store))
    }

    #[test]
    fn test_age_rule_checks_each_bound_independently() {
        let now = Utc::now();
        let hour = TimeDelta::hours(1);
        let entries = vec![
            meta("old-created", now - hour * 3, now, 1),
            meta("stale", now, now - hour * 3, 1),
            meta("fresh", now - hour, now - hour, 1),
        ];

        let by_creation = RetentionRule::age("ns", Some(Duration::from_secs(7200)), None);
        let keys: Vec<_> = by_creation.select(&entries, now).into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["old-created"]);

        let by_change = RetentionRule::age("ns", None, Some(Duration::from_secs(7200)));
        let keys: Vec<_> = by_change.select(&entries, now).into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["stale"]);

        let both = RetentionRule::age(
            "ns",
            Some(Duration::from_secs(7200)),
            Some(Duration::from_secs(7200)),
        );
        assert_eq!(both.select(&entries, now).len(), 2);

        let unbounded = RetentionRule::age("ns", None, None);
        assert!(unbounded.select(&entries, now).is_empty());
    }

    #[test]
    fn test_size_rule_deletes_oldest_first_until_within_budget() {
        let now = Utc::now();
        let t = |mins: i64| now - TimeDelta::minutes(mins);
        let entries = vec![
            meta("c", t(10), t(10), 100),
            meta("a", t(30), t(30), 100),
            meta("d", t(5), t(5), 100),
            meta("b", t(20), t(20), 100),
        ];

        let rule = RetentionRule::total_size("ns", 250);
        let keys: Vec<_> = rule.select(&entries, now).into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["a", "b"]);

        let roomy = RetentionRule::total_size("ns", 400);
        assert!(roomy.select(&entries, now).is_empty());
    }

    #[test]
    fn test_size_rule_ties_keep_input_order() {
        let now = Utc::now();
        let entries = vec![
            meta("first", now, now, 10),
            meta("second", now, now, 10),
            meta("third", now, now, 10),
        ];
        let keys: Vec<_> = RetentionRule::total_size("ns", 15)
            .select(&entries, now)
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(keys, vec!["first", "second"]);
    }

    #[test]
    fn test_rule_accessors() {
        let rule = RetentionRule::total_size("logs", 1).with_key_pattern("2024-%");
        assert_eq!(rule.namespace(), "logs");
        assert_eq!(rule.key_pattern().map(LikeExpr::pattern), Some("2024-%"));
    }

    #[tokio::test]
    async fn test_age_rule_cycle_and_fresh_rewrite() {
        let (_dir, store) = open_docs().await;
        store.write("ns", "old", &json!(1)).await.unwrap();
        store.write("other", "old", &json!(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        store.write("ns", "fresh", &json!(2)).await.unwrap();

        let seen: Arc<Mutex<Vec<HashSet<DocumentEntryMeta>>>> = Arc::default();
        let sink = seen.clone();
        let options = RetentionOptions::new(vec![RetentionRule::age(
            "ns",
            Some(Duration::from_millis(200)),
            None,
        )])
        .on_deleted(move |deleted| sink.lock().unwrap().push(deleted.clone()));

        let handle = RetentionEngine::attach(store.clone(), options);
        let status = handle.wait_for_cycles(1).await;
        assert_eq!(status.last_deleted, 1);
        assert_eq!(status.state, RetentionState::Idle);

        {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            let keys: Vec<_> = seen[0].iter().map(|m| m.key.as_str()).collect();
            assert_eq!(keys, vec!["old"]);
        }
        assert!(store.read("ns", "old").await.unwrap().is_none());
        assert!(store.read("ns", "fresh").await.unwrap().is_some());
        assert!(store.read("other", "old").await.unwrap().is_some());
        handle.shutdown().await;

        // A rewrite of the same key survives until it too ages out
        store.write("ns", "old", &json!(3)).await.unwrap();
        let rules = vec![RetentionRule::age("ns", Some(Duration::from_millis(200)), None)];
        let deleted = run_cycle(store.as_ref(), &rules, Utc::now()).await;
        assert!(deleted.iter().all(|m| m.key != "old"));

        let later = Utc::now() + TimeDelta::seconds(1);
        let deleted = run_cycle(store.as_ref(), &rules, later).await;
        assert!(deleted.iter().any(|m| m.key == "old"));
    }

    #[tokio::test]
    async fn test_size_rule_on_blob_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path().join("blobs.db")).await.unwrap();
        for i in 0..5 {
            store
                .write_bytes("cache", &format!("k{}", i), &[i as u8; 100])
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let rules = vec![RetentionRule::total_size("cache", 250)];
        let deleted = run_cycle(&store, &rules, Utc::now()).await;
        let mut keys: Vec<_> = deleted.iter().map(|m| m.key.clone()).collect();
        keys.sort();
        assert_eq!(keys, vec!["k0", "k1", "k2"]);
        assert_eq!(store.count(Some("cache"), None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_entry_rewritten_after_listing_is_kept() {
        let (_dir, store) = open_docs().await;
        store.write("ns", "k", &json!(1)).await.unwrap();
        let listed: Vec<DocumentEntryMeta> = store
            .list_for_retention("ns", None)
            .try_collect()
            .await
            .unwrap();

        store.write("ns", "k", &json!(2)).await.unwrap();
        assert_eq!(store.delete_entry(&listed[0]).await.unwrap(), 0);
        assert_eq!(store.read("ns", "k").await.unwrap().unwrap().data, json!(2));
    }

    #[tokio::test]
    async fn test_callback_fires_once_with_union_of_rules() {
        let (_dir, store) = open_docs().await;
        for i in 0..3 {
            store.write("a", &i.to_string(), &json!(i)).await.unwrap();
            store.write("b", &i.to_string(), &json!(i)).await.unwrap();
        }

        let calls: Arc<Mutex<Vec<usize>>> = Arc::default();
        let sink = calls.clone();
        let options = RetentionOptions::new(vec![
            RetentionRule::total_size("a", 0),
            RetentionRule::total_size("b", 0).with_key_pattern("1"),
        ])
        .on_deleted(move |deleted| sink.lock().unwrap().push(deleted.len()));

        let handle = RetentionEngine::attach(store.clone(), options);
        handle.wait_for_cycles(1).await;
        assert_eq!(*calls.lock().unwrap(), vec![4]);
        assert_eq!(store.count(Some("b"), None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_callback_panic_does_not_stop_engine() {
        let (_dir, store) = open_docs().await;
        store.write("ns", "k", &json!(1)).await.unwrap();

        let options = RetentionOptions::new(vec![RetentionRule::total_size("ns", 0)])
            .with_scan_interval(Duration::from_millis(20))
            .on_deleted(|_| panic!("callback failure"));

        let handle = RetentionEngine::attach(store.clone(), options);
        handle.wait_for_cycles(1).await;

        store.write("ns", "k2", &json!(2)).await.unwrap();
        // Two more completions guarantee one full cycle started after the write
        let seen = handle.status().cycles;
        let status = handle.wait_for_cycles(seen + 2).await;
        assert!(status.cycles >= 3);
        assert_eq!(store.count(Some("ns"), None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_no_callback_when_nothing_deleted() {
        let (_dir, store) = open_docs().await;
        store.write("ns", "k", &json!(1)).await.unwrap();

        let calls = Arc::new(Mutex::new(0));
        let sink = calls.clone();
        let options = RetentionOptions::new(vec![RetentionRule::age(
            "ns",
            Some(Duration::from_secs(3600)),
            None,
        )])
        .on_deleted(move |_| *sink.lock().unwrap() += 1);

        let handle = RetentionEngine::attach(store, options);
        let status = handle.wait_for_cycles(1).await;
        assert_eq!(status.last_deleted, 0);
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_cycles() {
        let (_dir, store) = open_docs().await;
        let handle = RetentionEngine::attach(
            store,
            RetentionOptions::<DocumentEntryMeta>::default()
                .with_scan_interval(Duration::from_millis(10)),
        );
        let mut rx = handle.subscribe();
        handle.wait_for_cycles(1).await;
        handle.shutdown().await;

        let last = rx.borrow_and_update().cycles;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rx.borrow().cycles, last);
    }
}
