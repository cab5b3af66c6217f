//! In-process [`RecordStore`]
//!
//! Keeps rows in insertion order, assigns ids and timestamps the way the hosted
//! tables do, and notifies subscribers synchronously after each write. Used by
//! the tests and by anything that wants the data layer without a network.

use super::{
    plain, ChangeCallback, ChangeEvent, ChangeKind, Collection, FeedState, Filter, Query,
    RecordStore, Row, SortOrder, SubscriptionHandle,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

struct Subscriber {
    id: String,
    collection: Collection,
    filter: Option<Filter>,
    callback: ChangeCallback,
}

#[derive(Default)]
struct Inner {
    tables: HashMap<Collection, Vec<Row>>,
    subscribers: Vec<Subscriber>,
    last_timestamp: Option<DateTime<Utc>>,
    select_calls: HashMap<Collection, usize>,
    failing_selects: HashMap<Collection, usize>,
    rejected_inserts: Vec<(Collection, Filter)>,
}

impl Inner {
    // Strictly increasing so `created_at` ordering is deterministic.
    fn next_timestamp(&mut self) -> String {
        let mut now = Utc::now();
        if let Some(last) = self.last_timestamp {
            if now <= last {
                now = last + ChronoDuration::microseconds(1);
            }
        }
        self.last_timestamp = Some(now);
        now.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    latency: Option<Duration>,
    feed: broadcast::Sender<FeedState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (feed, _) = broadcast::channel(16);
        Self {
            inner: Mutex::default(),
            latency: None,
            feed,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announces a feed transition to every view, as a dropped socket would.
    pub fn set_feed_state(&self, state: FeedState) {
        // No listeners is fine.
        let _ = self.feed.send(state);
    }

    /// Delays every `select`, to keep fetches in flight while a test acts.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of live subscriptions across all collections.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Number of `select` calls made against a collection so far.
    pub fn select_calls(&self, collection: Collection) -> usize {
        self.lock().select_calls.get(&collection).copied().unwrap_or(0)
    }

    /// Makes the next `count` selects on `collection` fail.
    pub fn fail_next_selects(&self, collection: Collection, count: usize) {
        self.lock().failing_selects.insert(collection, count);
    }

    /// Rejects inserts into `collection` whose row matches `filter`.
    pub fn reject_inserts_where(&self, collection: Collection, filter: Filter) {
        self.lock().rejected_inserts.push((collection, filter));
    }

    /// Rows of a collection in insertion order.
    pub fn rows(&self, collection: Collection) -> Vec<Row> {
        self.lock().tables.get(&collection).cloned().unwrap_or_default()
    }

    // A poisoned lock still holds consistent tables: every mutation is a
    // single push/replace/remove.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, event: ChangeEvent) {
        let callbacks: Vec<ChangeCallback> = {
            let inner = self.lock();
            inner
                .subscribers
                .iter()
                .filter(|s| s.collection == event.collection)
                .filter(|s| {
                    s.filter.as_ref().map_or(true, |f| {
                        f.matches(&event.record) || f.matches(&event.old_record)
                    })
                })
                .map(|s| s.callback.clone())
                .collect()
        };
        for callback in callbacks {
            callback(event.clone());
        }
    }
}

fn required_columns(collection: Collection) -> &'static [&'static str] {
    match collection {
        Collection::Clients => &["name"],
        Collection::MaterialLogs => &["client_id"],
        Collection::MaterialItems => &["log_id", "name", "quantity", "unit"],
        Collection::QuickSelectMaterials => &["name", "unit"],
    }
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::Null) | None, Some(Value::Null) | None) => Ordering::Equal,
        (Some(Value::Null) | None, _) => Ordering::Greater,
        (_, Some(Value::Null) | None) => Ordering::Less,
        (Some(x), Some(y)) => plain(x).cmp(&plain(y)),
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn select(&self, collection: Collection, query: &Query) -> Result<Vec<Row>> {
        {
            let mut inner = self.lock();
            *inner.select_calls.entry(collection).or_insert(0) += 1;
            if let Some(remaining) = inner.failing_selects.get_mut(&collection) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::remote_store(format!(
                        "select on {} failed",
                        collection
                    )));
                }
            }
        }

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut rows: Vec<Row> = self
            .rows(collection)
            .into_iter()
            .filter(|row| query.filter.as_ref().map_or(true, |f| f.matches(row)))
            .collect();

        if let Some(order) = &query.order {
            // Stable sort: ties keep insertion order.
            rows.sort_by(|a, b| {
                let ord = compare(a.get(&order.column), b.get(&order.column));
                match order.direction {
                    SortOrder::Ascending => ord,
                    SortOrder::Descending => ord.reverse(),
                }
            });
        }
        Ok(rows)
    }

    async fn insert(&self, collection: Collection, mut row: Row) -> Result<Row> {
        {
            let mut inner = self.lock();

            for column in required_columns(collection) {
                if matches!(row.get(*column), None | Some(Value::Null)) {
                    return Err(Error::remote_store(format!(
                        "null value in column \"{}\" of relation \"{}\"",
                        column, collection
                    )));
                }
            }
            if inner
                .rejected_inserts
                .iter()
                .any(|(c, f)| *c == collection && f.matches(&row))
            {
                return Err(Error::remote_store(format!("insert into {} rejected", collection)));
            }

            if !row.contains_key("id") {
                row.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
            }
            if collection != Collection::MaterialItems && !row.contains_key("created_at") {
                let now = inner.next_timestamp();
                row.insert("created_at".into(), Value::String(now));
            }
            match collection {
                Collection::MaterialLogs => {
                    if matches!(row.get("date"), None | Some(Value::Null)) {
                        let created = row.get("created_at").cloned().unwrap_or(Value::Null);
                        row.insert("date".into(), created);
                    }
                }
                Collection::QuickSelectMaterials => {
                    row.entry("is_default").or_insert(Value::Bool(false));
                }
                _ => {}
            }

            inner.tables.entry(collection).or_default().push(row.clone());
        }

        debug!(collection = %collection, "memory insert");
        self.notify(ChangeEvent {
            collection,
            kind: ChangeKind::Insert,
            record: row.clone(),
            old_record: Row::new(),
        });
        Ok(row)
    }

    async fn update(&self, collection: Collection, id: &str, patch: Row) -> Result<()> {
        let change = {
            let mut inner = self.lock();
            let rows = inner.tables.entry(collection).or_default();
            rows.iter_mut()
                .find(|row| row.get("id").map(plain).as_deref() == Some(id))
                .map(|row| {
                    let old = row.clone();
                    for (key, value) in patch {
                        if key != "id" {
                            row.insert(key, value);
                        }
                    }
                    (row.clone(), old)
                })
        };

        match change {
            Some((record, old_record)) => self.notify(ChangeEvent {
                collection,
                kind: ChangeKind::Update,
                record,
                old_record,
            }),
            None => debug!(collection = %collection, id, "update matched no rows"),
        }
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<()> {
        let removed = {
            let mut inner = self.lock();
            let rows = inner.tables.entry(collection).or_default();
            rows.iter()
                .position(|row| row.get("id").map(plain).as_deref() == Some(id))
                .map(|index| rows.remove(index))
        };

        match removed {
            Some(old_record) => self.notify(ChangeEvent {
                collection,
                kind: ChangeKind::Delete,
                record: Row::new(),
                old_record,
            }),
            None => debug!(collection = %collection, id, "delete matched no rows"),
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        collection: Collection,
        filter: Option<Filter>,
        on_change: ChangeCallback,
    ) -> Result<SubscriptionHandle> {
        let id = Uuid::new_v4().to_string();
        self.lock().subscribers.push(Subscriber {
            id: id.clone(),
            collection,
            filter,
            callback: on_change,
        });
        debug!(collection = %collection, subscription = %id, "memory subscribe");
        Ok(SubscriptionHandle::new(id, collection))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        let mut inner = self.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.id != handle.id());
        if inner.subscribers.len() == before {
            return Err(Error::remote_store(format!(
                "unknown subscription {}",
                handle.id()
            )));
        }
        Ok(())
    }

    fn feed_state(&self) -> Option<broadcast::Receiver<FeedState>> {
        Some(self.feed.subscribe())
    }
}
