//! Record store capability
//!
//! Everything persisted goes through a [`RecordStore`]. Rows cross the trait
//! as JSON objects; [`fetch`], [`decode`] and [`encode`] turn them into the
//! typed records of [`crate::models`] and fail with [`Error::Shape`] when a row
//! does not fit.

pub mod memory;
pub mod remote;

use crate::error::{Error, Result};
use crate::models::{Client, MaterialItem, MaterialLog, QuickSelectMaterial};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

pub use memory::MemoryStore;
pub use remote::RemoteStore;

/// A stored row as the store returns it
pub type Row = Map<String, Value>;

/// The four persisted collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Clients,
    MaterialLogs,
    MaterialItems,
    QuickSelectMaterials,
}

impl Collection {
    pub fn table_name(&self) -> &'static str {
        match self {
            Collection::Clients => "clients",
            Collection::MaterialLogs => "material_logs",
            Collection::MaterialItems => "material_items",
            Collection::QuickSelectMaterials => "quick_select_materials",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// Row filter: equality or set membership on one column
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq { column: String, value: String },
    In { column: String, values: Vec<String> },
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<String>) -> Self {
        Filter::Eq {
            column: column.to_string(),
            value: value.into(),
        }
    }

    pub fn in_list<I, S>(column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Filter::In {
            column: column.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Filter::Eq { column, .. } | Filter::In { column, .. } => column,
        }
    }

    /// Evaluates the filter against a row; a missing column never matches.
    pub fn matches(&self, row: &Row) -> bool {
        let Some(actual) = row.get(self.column()).map(plain) else {
            return false;
        };
        match self {
            Filter::Eq { value, .. } => &actual == value,
            Filter::In { values, .. } => values.contains(&actual),
        }
    }
}

pub(crate) fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Single-column ordering
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub direction: SortOrder,
}

impl Order {
    pub fn asc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            direction: SortOrder::Ascending,
        }
    }

    pub fn desc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            direction: SortOrder::Descending,
        }
    }
}

/// Select parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filter: Option<Filter>,
    pub order: Option<Order>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Change notification delivered to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub collection: Collection,
    pub kind: ChangeKind,
    /// New row; empty for deletes
    pub record: Row,
    /// Previous row where the store provides one
    pub old_record: Row,
}

pub type ChangeCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// Health of the change feed behind a store's subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Connected,
    /// Changes may be missed until the feed is back
    Disconnected,
}

/// Disposable subscription handle
///
/// Not `Clone`: [`RecordStore::unsubscribe`] consumes it, so a handle is
/// released at most once.
#[derive(Debug, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: String,
    collection: Collection,
}

impl SubscriptionHandle {
    pub fn new(id: impl Into<String>, collection: Collection) -> Self {
        Self {
            id: id.into(),
            collection,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }
}

/// CRUD and change subscription over the four collections
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn select(&self, collection: Collection, query: &Query) -> Result<Vec<Row>>;

    /// Inserts one row and returns it as stored
    async fn insert(&self, collection: Collection, row: Row) -> Result<Row>;

    /// Inserts several rows; stores with a batched call override this
    async fn insert_many(&self, collection: Collection, rows: Vec<Row>) -> Result<Vec<Row>> {
        let mut stored = Vec::with_capacity(rows.len());
        for row in rows {
            stored.push(self.insert(collection, row).await?);
        }
        Ok(stored)
    }

    async fn update(&self, collection: Collection, id: &str, patch: Row) -> Result<()>;

    async fn delete(&self, collection: Collection, id: &str) -> Result<()>;

    async fn subscribe(
        &self,
        collection: Collection,
        filter: Option<Filter>,
        on_change: ChangeCallback,
    ) -> Result<SubscriptionHandle>;

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()>;

    /// Feed transitions, for stores whose notifications can be interrupted
    fn feed_state(&self) -> Option<broadcast::Receiver<FeedState>> {
        None
    }

    /// Releases connections; called once at shutdown
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A typed record bound to its collection
pub trait Record: DeserializeOwned {
    const COLLECTION: Collection;
}

impl Record for Client {
    const COLLECTION: Collection = Collection::Clients;
}

impl Record for MaterialLog {
    const COLLECTION: Collection = Collection::MaterialLogs;
}

impl Record for MaterialItem {
    const COLLECTION: Collection = Collection::MaterialItems;
}

impl Record for QuickSelectMaterial {
    const COLLECTION: Collection = Collection::QuickSelectMaterials;
}

/// Validates a row into its typed record
pub fn decode<T: Record>(row: Row) -> Result<T> {
    serde_json::from_value(Value::Object(row))
        .map_err(|e| Error::shape(T::COLLECTION.table_name(), e))
}

/// Serializes an insert payload or patch into a row
pub fn encode<T: Serialize>(value: &T) -> Result<Row> {
    match serde_json::to_value(value)? {
        Value::Object(row) => Ok(row),
        other => Err(Error::validation(format!(
            "expected an object payload, got {}",
            other
        ))),
    }
}

/// Selects and decodes rows of `T`'s collection
pub async fn fetch<T: Record>(store: &dyn RecordStore, query: &Query) -> Result<Vec<T>> {
    store
        .select(T::COLLECTION, query)
        .await?
        .into_iter()
        .map(decode)
        .collect()
}

/// Inserts a payload and decodes the stored record
pub async fn insert_record<T: Record, P: Serialize>(store: &dyn RecordStore, payload: &P) -> Result<T> {
    let row = store.insert(T::COLLECTION, encode(payload)?).await?;
    decode(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => Row::new(),
        }
    }

    #[test]
    fn filter_matches_eq_and_in() {
        let r = row(json!({ "client_id": "c-1", "quantity": 2 }));
        assert!(Filter::eq("client_id", "c-1").matches(&r));
        assert!(!Filter::eq("client_id", "c-2").matches(&r));
        assert!(Filter::in_list("quantity", ["1", "2"]).matches(&r));
        assert!(!Filter::eq("log_id", "l-1").matches(&r));
    }

    #[test]
    fn decode_reports_shape_errors() {
        let bad = row(json!({ "id": "i-1", "log_id": "l-1", "name": "Mulch", "quantity": "lots", "unit": "yd" }));
        match decode::<MaterialItem>(bad) {
            Err(Error::Shape { collection, .. }) => assert_eq!(collection, "material_items"),
            other => panic!("expected shape error, got {:?}", other),
        }

        let good = row(json!({ "id": "i-1", "log_id": "l-1", "name": "Mulch", "quantity": 2.5, "unit": "yd" }));
        let item = decode::<MaterialItem>(good).unwrap();
        assert_eq!(item.quantity, 2.5);
    }

    #[test]
    fn encode_rejects_non_objects() {
        assert!(encode(&vec![1, 2]).is_err());
        assert!(encode(&json!({ "name": "x" })).is_ok());
    }
}
