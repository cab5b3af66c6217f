use crate::client::{RealtimeClient, SocketHandle};
use crate::error::RealtimeError;
use crate::filters::{DatabaseFilter, FilterOperator};
use crate::message::{ChannelEvent, DatabaseEvent, PostgresChangePayload, RealtimeMessage};
use log::{debug, error, trace, warn};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tokio::time::timeout;

/// データベース変更監視設定
///
/// One binding per table; Realtime accepts at most one filter per binding, so
/// setting a second filter replaces the first.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseChanges {
    schema: String,
    table: String,
    event: DatabaseEvent,
    filter: Option<DatabaseFilter>,
}

impl DatabaseChanges {
    /// 新しいデータベース変更監視設定を作成
    pub fn new(table: &str) -> Self {
        Self {
            schema: "public".to_string(),
            table: table.to_string(),
            event: DatabaseEvent::All,
            filter: None,
        }
    }

    /// スキーマを設定
    pub fn schema(mut self, schema: &str) -> Self {
        self.schema = schema.to_string();
        self
    }

    /// イベントを設定
    pub fn event(mut self, event: DatabaseEvent) -> Self {
        self.event = event;
        self
    }

    /// フィルター条件を設定
    pub fn filter(mut self, filter: DatabaseFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn eq<T: Into<Value>>(self, column: &str, value: T) -> Self {
        self.filter(DatabaseFilter {
            column: column.to_string(),
            operator: FilterOperator::Eq,
            value: value.into(),
        })
    }

    pub fn neq<T: Into<Value>>(self, column: &str, value: T) -> Self {
        self.filter(DatabaseFilter {
            column: column.to_string(),
            operator: FilterOperator::Neq,
            value: value.into(),
        })
    }

    pub fn in_values<T: Into<Value>>(self, column: &str, values: Vec<T>) -> Self {
        self.filter(DatabaseFilter {
            column: column.to_string(),
            operator: FilterOperator::In,
            value: Value::Array(values.into_iter().map(Into::into).collect()),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Config entry for the `postgres_changes` array of a join payload.
    pub(crate) fn to_channel_config(&self) -> Value {
        let mut config = json!({
            "event": self.event.as_str(),
            "schema": self.schema,
            "table": self.table,
        });
        if let Some(filter) = &self.filter {
            config["filter"] = Value::String(filter.to_filter_string());
        }
        config
    }

    /// Whether an incoming change belongs to this binding.
    pub fn matches(&self, change: &PostgresChangePayload) -> bool {
        change.schema == self.schema
            && change.table == self.table
            && self.event.accepts(change.change_type)
            && self
                .filter
                .as_ref()
                .map_or(true, |filter| filter.matches(change.row()))
    }
}

type CallbackFn = Box<dyn Fn(PostgresChangePayload) + Send + Sync>;

struct Binding {
    id: String,
    changes: DatabaseChanges,
    callback: CallbackFn,
}

type JoinReply = oneshot::Sender<Result<(), String>>;

/// 内部チャンネル表現
pub(crate) struct Channel {
    topic: String,
    bindings: RwLock<Vec<Binding>>,
    pending_join: Mutex<Option<(String, JoinReply)>>,
}

impl Channel {
    fn new(topic: String, bindings: Vec<Binding>) -> Self {
        Self {
            topic,
            bindings: RwLock::new(bindings),
            pending_join: Mutex::new(None),
        }
    }

    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    async fn join_payload(&self, access_token: Option<String>) -> Value {
        let configs: Vec<Value> = self
            .bindings
            .read()
            .await
            .iter()
            .map(|binding| binding.changes.to_channel_config())
            .collect();

        let mut payload = json!({
            "config": {
                "broadcast": { "ack": false, "self": false },
                "presence": { "key": "" },
                "postgres_changes": configs,
            }
        });
        if let Some(token) = access_token {
            payload["access_token"] = Value::String(token);
        }
        payload
    }

    /// Sends `phx_join` without waiting for the reply.
    pub(crate) async fn send_join(
        &self,
        handle: &SocketHandle,
    ) -> Result<String, RealtimeError> {
        let token = handle.access_token.read().await.clone();
        let join_ref = handle.next_ref();
        let message = RealtimeMessage::new(
            &self.topic,
            ChannelEvent::PhoenixJoin,
            self.join_payload(token).await,
            Some(join_ref.clone()),
        );
        handle.send(&message).await?;
        Ok(join_ref)
    }

    /// Sends `phx_join` and waits for the matching `phx_reply`.
    async fn join(&self, handle: &SocketHandle, wait: Duration) -> Result<(), RealtimeError> {
        let (tx, rx) = oneshot::channel();
        let join_ref = handle.next_ref();
        self.set_pending_join(Some((join_ref.clone(), tx)));

        let token = handle.access_token.read().await.clone();
        let message = RealtimeMessage::new(
            &self.topic,
            ChannelEvent::PhoenixJoin,
            self.join_payload(token).await,
            Some(join_ref),
        );
        if let Err(e) = handle.send(&message).await {
            self.set_pending_join(None);
            return Err(e);
        }

        match timeout(wait, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(RealtimeError::JoinRejected {
                topic: self.topic.clone(),
                reason,
            }),
            Ok(Err(_)) => Err(RealtimeError::JoinTimeout(self.topic.clone())),
            Err(_) => {
                self.set_pending_join(None);
                Err(RealtimeError::JoinTimeout(self.topic.clone()))
            }
        }
    }

    fn set_pending_join(&self, pending: Option<(String, JoinReply)>) {
        match self.pending_join.lock() {
            Ok(mut guard) => *guard = pending,
            Err(poisoned) => *poisoned.into_inner() = pending,
        }
    }

    fn take_pending_join(&self, message_ref: &Value) -> Option<JoinReply> {
        let mut guard = match self.pending_join.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let matches = match (guard.as_ref(), message_ref.as_str()) {
            (Some((join_ref, _)), Some(reply_ref)) => join_ref == reply_ref,
            _ => false,
        };
        if matches {
            guard.take().map(|(_, tx)| tx)
        } else {
            None
        }
    }

    /// Removes bindings; returns true when the channel has none left.
    async fn remove_bindings(&self, ids: &[String]) -> bool {
        let mut bindings = self.bindings.write().await;
        bindings.retain(|binding| !ids.contains(&binding.id));
        bindings.is_empty()
    }

    pub(crate) async fn handle_message(&self, message: RealtimeMessage) {
        trace!("Handling {} on {}", message.event, self.topic);

        if message.is_event(ChannelEvent::PostgresChanges) {
            let change = match PostgresChangePayload::from_message_payload(&message.payload) {
                Ok(change) => change,
                Err(e) => {
                    error!(
                        "Failed to parse postgres_changes payload on {}: {}",
                        self.topic, e
                    );
                    return;
                }
            };
            let bindings = self.bindings.read().await;
            for binding in bindings.iter().filter(|b| b.changes.matches(&change)) {
                (binding.callback)(change.clone());
            }
        } else if message.is_event(ChannelEvent::PhoenixReply) {
            if let Some(tx) = self.take_pending_join(&message.message_ref) {
                let result = match message.reply_status() {
                    Some("ok") => Ok(()),
                    other => Err(message
                        .payload
                        .pointer("/response/reason")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("status {:?}", other))),
                };
                let _ = tx.send(result);
            }
        } else if message.is_event(ChannelEvent::PhoenixError) {
            error!("Channel {} received phx_error: {:?}", self.topic, message.payload);
        } else if message.is_event(ChannelEvent::PhoenixClose) {
            debug!("Channel {} received phx_close", self.topic);
        } else if message.is_event(ChannelEvent::System) {
            debug!("Channel {} system message: {:?}", self.topic, message.payload);
        } else {
            trace!("Unhandled event {} on {}", message.event, self.topic);
        }
    }
}

async fn release(
    handle: Arc<SocketHandle>,
    channel: Arc<Channel>,
    ids: Vec<String>,
) -> Result<(), RealtimeError> {
    if !channel.remove_bindings(&ids).await {
        return Ok(());
    }

    {
        let mut channels = handle.channels.write().await;
        if channels
            .get(channel.topic())
            .map_or(false, |registered| Arc::ptr_eq(registered, &channel))
        {
            channels.remove(channel.topic());
        }
    }

    if handle.state().await == crate::client::ConnectionState::Connected {
        let leave = RealtimeMessage::new(
            channel.topic(),
            ChannelEvent::PhoenixLeave,
            json!({}),
            Some(handle.next_ref()),
        );
        handle.send(&leave).await?;
    }
    debug!("Left channel {}", channel.topic());
    Ok(())
}

/// アクティブなチャンネル購読を表す
///
/// Call [`Subscription::unsubscribe`] to leave the channel. Dropping an active
/// subscription leaves it in the background.
pub struct Subscription {
    ids: Vec<String>,
    channel: Arc<Channel>,
    handle: Arc<SocketHandle>,
    active: bool,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        self.channel.topic()
    }

    /// 購読を解除
    pub async fn unsubscribe(mut self) -> Result<(), RealtimeError> {
        self.active = false;
        let ids = std::mem::take(&mut self.ids);
        release(self.handle.clone(), self.channel.clone(), ids).await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Subscription to {} dropped outside a runtime", self.channel.topic());
            return;
        };
        let handle = self.handle.clone();
        let channel = self.channel.clone();
        let ids = std::mem::take(&mut self.ids);
        runtime.spawn(async move {
            let topic = channel.topic().to_string();
            if let Err(e) = release(handle, channel, ids).await {
                warn!("Error leaving channel {}: {}", topic, e);
            }
        });
    }
}

/// チャンネル作成と購読設定のためのビルダー
pub struct ChannelBuilder<'a> {
    client: &'a RealtimeClient,
    topic: String,
    bindings: Vec<Binding>,
}

impl<'a> ChannelBuilder<'a> {
    pub(crate) fn new(client: &'a RealtimeClient, topic: String) -> Self {
        Self {
            client,
            topic,
            bindings: Vec::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// データベース変更イベントのコールバックを登録
    pub fn on<F>(mut self, changes: DatabaseChanges, callback: F) -> Self
    where
        F: Fn(PostgresChangePayload) + Send + Sync + 'static,
    {
        self.bindings.push(Binding {
            id: uuid::Uuid::new_v4().to_string(),
            changes,
            callback: Box::new(callback),
        });
        self
    }

    /// チャンネルへの接続と購読を開始
    ///
    /// Connects the socket if needed and resolves once the server acknowledges
    /// the join.
    pub async fn subscribe(self) -> Result<Subscription, RealtimeError> {
        if self.bindings.is_empty() {
            return Err(RealtimeError::NoBindings(self.topic));
        }

        self.client.connect().await?;
        let handle = self.client.handle.clone();
        let ids: Vec<String> = self.bindings.iter().map(|b| b.id.clone()).collect();
        let channel = Arc::new(Channel::new(self.topic.clone(), self.bindings));

        {
            let mut channels = handle.channels.write().await;
            if channels.contains_key(&self.topic) {
                return Err(RealtimeError::DuplicateTopic(self.topic));
            }
            channels.insert(self.topic.clone(), channel.clone());
        }

        let wait = Duration::from_millis(self.client.options().join_timeout);
        if let Err(e) = channel.join(&handle, wait).await {
            handle.channels.write().await.remove(&self.topic);
            return Err(e);
        }
        debug!("Joined channel {}", self.topic);

        Ok(Subscription {
            ids,
            channel,
            handle,
            active: true,
        })
    }
}
