//! [`RecordStore`] over the hosted backend: PostgREST for reads and writes,
//! Realtime `postgres_changes` for subscriptions.

use super::{
    ChangeCallback, ChangeEvent, ChangeKind, Collection, FeedState, Filter, Query, RecordStore,
    Row, SortOrder, SubscriptionHandle,
};
use crate::config::{BloomConfig, BloomOptions};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bloom_postgrest::{PostgrestClient, SortOrder as PostgrestSortOrder};
use bloom_realtime::{
    ChangeType, ConnectionState, DatabaseChanges, PostgresChangePayload, RealtimeClient,
    RealtimeClientOptions, Subscription,
};
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct RemoteStore {
    base_url: String,
    anon_key: String,
    schema: String,
    http_client: Client,
    access_token: RwLock<Option<String>>,
    realtime: RealtimeClient,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    feed: broadcast::Sender<FeedState>,
}

impl RemoteStore {
    pub fn new(config: &BloomConfig, options: &BloomOptions) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = options.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http_client = builder.build()?;

        let base_url = config.base_url();
        let realtime_options = RealtimeClientOptions {
            heartbeat_interval: options.realtime_heartbeat.as_millis() as u64,
            ..Default::default()
        };

        let realtime =
            RealtimeClient::new_with_options(&base_url, &config.anon_key, realtime_options);
        let feed = forward_feed_state(realtime.on_state_change());

        Ok(Self {
            realtime,
            base_url,
            anon_key: config.anon_key.clone(),
            schema: options.db_schema.clone(),
            http_client,
            access_token: RwLock::new(None),
            subscriptions: Mutex::new(HashMap::new()),
            feed,
        })
    }

    /// Forwards the signed-in user's token to both PostgREST and Realtime.
    pub async fn set_access_token(&self, token: Option<String>) {
        {
            let mut current = self
                .access_token
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *current = token.clone();
        }
        self.realtime.set_auth(token).await;
    }

    fn bearer(&self) -> String {
        self.access_token
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .unwrap_or_else(|| self.anon_key.clone())
    }

    fn table(&self, collection: Collection) -> Result<PostgrestClient> {
        let mut client = PostgrestClient::new(
            &self.base_url,
            &self.anon_key,
            collection.table_name(),
            self.http_client.clone(),
        )?
        .with_auth(&self.bearer())?;
        if self.schema != "public" {
            client = client.schema(&self.schema)?;
        }
        Ok(client)
    }
}

// Socket states reduced to what a view cares about. The forwarder lives as
// long as the realtime client.
fn forward_feed_state(
    mut states: broadcast::Receiver<ConnectionState>,
) -> broadcast::Sender<FeedState> {
    let (feed, _) = broadcast::channel(16);
    let sender = feed.clone();
    let forward = async move {
        loop {
            let state = match states.recv().await {
                Ok(state) => state,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "feed state lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let mapped = match state {
                ConnectionState::Connected => FeedState::Connected,
                ConnectionState::Disconnected => FeedState::Disconnected,
                ConnectionState::Connecting | ConnectionState::Reconnecting => continue,
            };
            // No views is fine.
            let _ = sender.send(mapped);
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(forward);
        }
        Err(_) => warn!("store created outside a runtime; feed state is not reported"),
    }
    feed
}

fn apply_filter(client: PostgrestClient, filter: &Filter) -> PostgrestClient {
    match filter {
        Filter::Eq { column, value } => client.eq(column, value),
        Filter::In { column, values } => client.in_list(column, values.as_slice()),
    }
}

fn into_rows(collection: Collection, value: Value) -> Result<Vec<Row>> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(row) => Ok(row),
                other => Err(Error::shape(
                    collection.table_name(),
                    format!("expected an object, got {}", other),
                )),
            })
            .collect(),
        Value::Object(row) => Ok(vec![row]),
        other => Err(Error::shape(
            collection.table_name(),
            format!("expected rows, got {}", other),
        )),
    }
}

fn change_event(collection: Collection, change: PostgresChangePayload) -> ChangeEvent {
    ChangeEvent {
        collection,
        kind: match change.change_type {
            ChangeType::Insert => ChangeKind::Insert,
            ChangeType::Update => ChangeKind::Update,
            ChangeType::Delete => ChangeKind::Delete,
        },
        record: change.record,
        old_record: change.old_record,
    }
}

#[async_trait]
impl RecordStore for RemoteStore {
    async fn select(&self, collection: Collection, query: &Query) -> Result<Vec<Row>> {
        let mut request = self.table(collection)?.select("*");
        if let Some(filter) = &query.filter {
            request = apply_filter(request, filter);
        }
        if let Some(order) = &query.order {
            let direction = match order.direction {
                SortOrder::Ascending => PostgrestSortOrder::Ascending,
                SortOrder::Descending => PostgrestSortOrder::Descending,
            };
            request = request.order(&order.column, direction);
        }
        Ok(request.execute::<Row>().await?)
    }

    async fn insert(&self, collection: Collection, row: Row) -> Result<Row> {
        let stored = self.table(collection)?.insert(Value::Object(row)).await?;
        into_rows(collection, stored)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::shape(collection.table_name(), "insert returned no row"))
    }

    async fn insert_many(&self, collection: Collection, rows: Vec<Row>) -> Result<Vec<Row>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let payload = Value::Array(rows.into_iter().map(Value::Object).collect());
        let stored = self.table(collection)?.insert(payload).await?;
        into_rows(collection, stored)
    }

    async fn update(&self, collection: Collection, id: &str, patch: Row) -> Result<()> {
        self.table(collection)?
            .eq("id", id)
            .update(Value::Object(patch))
            .await?;
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<()> {
        self.table(collection)?.eq("id", id).delete().await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        collection: Collection,
        filter: Option<Filter>,
        on_change: ChangeCallback,
    ) -> Result<SubscriptionHandle> {
        let id = Uuid::new_v4().to_string();
        let mut changes = DatabaseChanges::new(collection.table_name()).schema(&self.schema);
        changes = match filter {
            Some(Filter::Eq { column, value }) => changes.eq(&column, value),
            Some(Filter::In { column, values }) => changes.in_values(&column, values),
            None => changes,
        };

        let subscription = self
            .realtime
            .channel(&format!("bloom-{}-{}", collection, id))
            .on(changes, move |change| on_change(change_event(collection, change)))
            .subscribe()
            .await?;
        info!(collection = %collection, topic = subscription.topic(), "subscribed");

        self.subscriptions.lock().await.insert(id.clone(), subscription);
        Ok(SubscriptionHandle::new(id, collection))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        let subscription = self
            .subscriptions
            .lock()
            .await
            .remove(handle.id())
            .ok_or_else(|| Error::remote_store(format!("unknown subscription {}", handle.id())))?;
        debug!(collection = %handle.collection(), "unsubscribing");
        subscription.unsubscribe().await?;
        Ok(())
    }

    fn feed_state(&self) -> Option<broadcast::Receiver<FeedState>> {
        Some(self.feed.subscribe())
    }

    async fn close(&self) -> Result<()> {
        let remaining: Vec<Subscription> = self
            .subscriptions
            .lock()
            .await
            .drain()
            .map(|(_, subscription)| subscription)
            .collect();
        for subscription in remaining {
            let topic = subscription.topic().to_string();
            if let Err(e) = subscription.unsubscribe().await {
                warn!(topic = %topic, error = %e, "failed to leave channel on close");
            }
        }
        self.realtime.disconnect().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(server: &MockServer) -> RemoteStore {
        let config = BloomConfig::new(&server.uri(), "anon").unwrap();
        RemoteStore::new(&config, &BloomOptions::default()).unwrap()
    }

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => Row::new(),
        }
    }

    #[tokio::test]
    async fn select_translates_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/material_items"))
            .and(query_param("log_id", "in.(l-1,l-2)"))
            .and(query_param("order", "name.asc"))
            .and(header("Authorization", "Bearer anon"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": "i-1", "log_id": "l-1", "name": "Mulch", "quantity": 2, "unit": "yd" }
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let rows = store(&server)
            .select(
                Collection::MaterialItems,
                &Query::new()
                    .filter(Filter::in_list("log_id", ["l-1", "l-2"]))
                    .order(crate::store::Order::asc("name")),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], "Mulch");
    }

    #[tokio::test]
    async fn insert_many_is_one_request_with_user_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/material_items"))
            .and(header("Authorization", "Bearer user-jwt"))
            .and(body_json(json!([
                { "log_id": "l-1", "name": "Mulch" },
                { "log_id": "l-1", "name": "Stone" }
            ])))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!([
                { "id": "i-1", "log_id": "l-1", "name": "Mulch" },
                { "id": "i-2", "log_id": "l-1", "name": "Stone" }
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let store = store(&server);
        store.set_access_token(Some("user-jwt".into())).await;
        let stored = store
            .insert_many(
                Collection::MaterialItems,
                vec![
                    row(json!({ "log_id": "l-1", "name": "Mulch" })),
                    row(json!({ "log_id": "l-1", "name": "Stone" })),
                ],
            )
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1]["id"], "i-2");
    }

    #[tokio::test]
    async fn api_errors_become_remote_store_errors() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/rest/v1/clients"))
            .and(query_param("id", "eq.c-1"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "code": "42501",
                "message": "permission denied for table clients"
            })))
            .mount(&server)
            .await;

        let result = store(&server).delete(Collection::Clients, "c-1").await;
        assert!(matches!(result, Err(Error::RemoteStore(_))));
    }

    #[tokio::test]
    async fn socket_states_reduce_to_feed_states() {
        let (states, rx) = broadcast::channel(8);
        let feed = forward_feed_state(rx);
        let mut seen = feed.subscribe();

        for state in [
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
            ConnectionState::Reconnecting,
            ConnectionState::Connected,
        ] {
            states.send(state).unwrap();
        }

        let mut forwarded = Vec::new();
        for _ in 0..3 {
            let next = tokio::time::timeout(std::time::Duration::from_secs(1), seen.recv());
            forwarded.push(next.await.unwrap().unwrap());
        }
        assert_eq!(
            forwarded,
            [FeedState::Connected, FeedState::Disconnected, FeedState::Connected]
        );
    }

    #[test]
    fn change_event_maps_kind_and_rows() {
        let payload: PostgresChangePayload = serde_json::from_value(json!({
            "schema": "public",
            "table": "material_items",
            "type": "DELETE",
            "old_record": { "id": "i-1" }
        }))
        .unwrap();
        let event = change_event(Collection::MaterialItems, payload);
        assert_eq!(event.kind, ChangeKind::Delete);
        assert_eq!(event.old_record["id"], "i-1");
        assert!(event.record.is_empty());
    }
}
