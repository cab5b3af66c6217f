use crate::channel::{Channel, ChannelBuilder};
use crate::error::RealtimeError;
use crate::message::{ChannelEvent, RealtimeMessage};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, Notify, RwLock};
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

const PHOENIX_TOPIC: &str = "phoenix";

/// 接続状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// RealtimeClient設定オプション
#[derive(Debug, Clone)]
pub struct RealtimeClientOptions {
    /// Heartbeat period in milliseconds.
    pub heartbeat_interval: u64,
    /// Timeout for the websocket handshake in milliseconds.
    pub connect_timeout: u64,
    /// Timeout for a `phx_join` reply in milliseconds.
    pub join_timeout: u64,
    /// Reopen the socket and rejoin channels after an unexpected close.
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: Option<u32>,
    /// First retry delay in milliseconds, grown by `reconnect_backoff_factor`.
    pub reconnect_interval: u64,
    pub reconnect_backoff_factor: f64,
    pub max_reconnect_interval: u64,
}

impl Default for RealtimeClientOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: 30000, // 30 seconds
            connect_timeout: 10000,
            join_timeout: 10000,
            auto_reconnect: true,
            max_reconnect_attempts: None, // Infinite attempts
            reconnect_interval: 1000,
            reconnect_backoff_factor: 1.5,
            max_reconnect_interval: 30000,
        }
    }
}

/// State shared between the client, its socket tasks and live subscriptions.
pub(crate) struct SocketHandle {
    url: String,
    key: String,
    options: RealtimeClientOptions,
    connect_lock: Mutex<()>,
    socket: RwLock<Option<mpsc::Sender<Message>>>,
    pub(crate) channels: RwLock<HashMap<String, Arc<Channel>>>,
    next_ref: AtomicU32,
    state: RwLock<ConnectionState>,
    state_change: broadcast::Sender<ConnectionState>,
    pub(crate) access_token: RwLock<Option<String>>,
    shutdown: Notify,
    manually_closed: AtomicBool,
    supervised: AtomicBool,
}

impl SocketHandle {
    fn new(url: &str, key: &str, options: RealtimeClientOptions) -> Self {
        let (state_change, _) = broadcast::channel(16);
        Self {
            url: url.to_string(),
            key: key.to_string(),
            options,
            connect_lock: Mutex::new(()),
            socket: RwLock::new(None),
            channels: RwLock::new(HashMap::new()),
            next_ref: AtomicU32::new(1),
            state: RwLock::new(ConnectionState::Disconnected),
            state_change,
            access_token: RwLock::new(None),
            shutdown: Notify::new(),
            manually_closed: AtomicBool::new(false),
            supervised: AtomicBool::new(false),
        }
    }

    /// 次のメッセージ参照番号を生成
    pub(crate) fn next_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::SeqCst).to_string()
    }

    pub(crate) async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    async fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.write().await;
        if *current != state {
            info!("Client state changing from {:?} to {:?}", *current, state);
            *current = state;
            // No receivers is fine.
            let _ = self.state_change.send(state);
        }
    }

    /// Queues a message for the writer task.
    pub(crate) async fn send(&self, message: &RealtimeMessage) -> Result<(), RealtimeError> {
        let text = serde_json::to_string(message)?;
        trace!("Queueing message: {}", text);
        let socket = self.socket.read().await;
        match socket.as_ref() {
            Some(tx) => tx.send(Message::Text(text)).await.map_err(RealtimeError::from),
            None => Err(RealtimeError::NotConnected),
        }
    }

    async fn dispatch(&self, text: &str) {
        let message = match serde_json::from_str::<RealtimeMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to parse incoming message: {}. Raw: {}", e, text);
                return;
            }
        };

        if message.topic == PHOENIX_TOPIC {
            trace!("Phoenix reply: {:?}", message.payload);
            return;
        }

        let channel = self.channels.read().await.get(&message.topic).cloned();
        match channel {
            Some(channel) => channel.handle_message(message).await,
            None => warn!(
                "Received message for unknown/unsubscribed topic: {}",
                message.topic
            ),
        }
    }

    fn websocket_url(&self) -> Result<Url, RealtimeError> {
        let mut url = Url::parse(&self.url)?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            s => return Err(RealtimeError::UnsupportedScheme(s.to_string())),
        };
        url.set_scheme(scheme)
            .map_err(|_| RealtimeError::UnsupportedScheme(format!("{} for {}", scheme, self.url)))?;
        url.set_path("/realtime/v1/websocket");
        url.query_pairs_mut()
            .clear()
            .append_pair("apikey", &self.key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }

    /// Opens the socket, starts the writer and reader tasks and rejoins every
    /// registered channel. A no-op when already connected.
    async fn open(self: &Arc<Self>) -> Result<(), RealtimeError> {
        let _guard = self.connect_lock.lock().await;
        if self.state().await == ConnectionState::Connected {
            return Ok(());
        }

        let ws_url = self.websocket_url()?;
        info!("Attempting to connect to WebSocket: {}", ws_url.host_str().unwrap_or_default());
        self.set_state(ConnectionState::Connecting).await;

        let connect_timeout = Duration::from_millis(self.options.connect_timeout);
        let ws_stream = match timeout(connect_timeout, connect_async(ws_url.as_str())).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                error!("WebSocket connection failed: {}", e);
                self.set_state(ConnectionState::Disconnected).await;
                return Err(RealtimeError::Socket(e));
            }
            Err(_) => {
                self.set_state(ConnectionState::Disconnected).await;
                return Err(RealtimeError::Connection(
                    "timed out opening WebSocket connection".to_string(),
                ));
            }
        };

        let (mut write, mut read) = ws_stream.split();
        let (socket_tx, mut socket_rx) = mpsc::channel::<Message>(100);
        *self.socket.write().await = Some(socket_tx);
        self.set_state(ConnectionState::Connected).await;

        // --- WebSocket Writer Task ---
        let writer = self.clone();
        tokio::spawn(async move {
            debug!("Writer task started");
            while let Some(message) = socket_rx.recv().await {
                if let Err(e) = write.send(message).await {
                    error!("WebSocket send error: {}. Closing connection.", e);
                    *writer.socket.write().await = None;
                    writer.set_state(ConnectionState::Disconnected).await;
                    break;
                }
            }
            let _ = write.close().await;
            debug!("Writer task finished");
        });

        // --- WebSocket Reader Task (and heartbeat) ---
        let reader = self.clone();
        let heartbeat = Duration::from_millis(self.options.heartbeat_interval);
        tokio::spawn(async move {
            debug!("Reader task started");
            let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
            loop {
                tokio::select! {
                    _ = reader.shutdown.notified() => {
                        debug!("Reader task received shutdown");
                        break;
                    }
                    incoming = read.next() => match incoming {
                        Some(Ok(Message::Text(text))) => reader.dispatch(&text).await,
                        Some(Ok(Message::Close(frame))) => {
                            debug!("Received Close frame: {:?}", frame);
                            break;
                        }
                        Some(Ok(other)) => trace!("Ignoring non-text message: {:?}", other),
                        Some(Err(e)) => {
                            error!("WebSocket read error: {}", e);
                            break;
                        }
                        None => {
                            debug!("WebSocket stream closed by remote");
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        let beat = RealtimeMessage::new(
                            PHOENIX_TOPIC,
                            ChannelEvent::Heartbeat,
                            json!({}),
                            Some(reader.next_ref()),
                        );
                        if let Err(e) = reader.send(&beat).await {
                            warn!("Failed to send heartbeat: {}. Assuming connection lost.", e);
                            break;
                        }
                    }
                }
            }
            *reader.socket.write().await = None;
            reader.set_state(ConnectionState::Disconnected).await;
            debug!("Reader task finished");
        });

        let existing: Vec<Arc<Channel>> = self.channels.read().await.values().cloned().collect();
        for channel in existing {
            if let Err(e) = channel.send_join(self).await {
                warn!("Failed to rejoin {}: {}", channel.topic(), e);
            }
        }

        Ok(())
    }

    /// Retries [`SocketHandle::open`] with exponential backoff until it
    /// succeeds, the attempt limit is hit, or the client is closed on purpose.
    async fn reconnect(self: &Arc<Self>) {
        let mut interval = self.options.reconnect_interval;
        let mut attempts = 0u32;
        loop {
            if self.manually_closed.load(Ordering::SeqCst) {
                debug!("Manual disconnect requested, stopping reconnect attempts.");
                return;
            }
            if let Some(max_attempts) = self.options.max_reconnect_attempts {
                if attempts >= max_attempts {
                    error!("Max reconnect attempts ({}) reached.", max_attempts);
                    self.set_state(ConnectionState::Disconnected).await;
                    return;
                }
            }
            attempts += 1;

            self.set_state(ConnectionState::Reconnecting).await;
            info!("Attempting to reconnect... (Attempt #{})", attempts);
            tokio::time::sleep(Duration::from_millis(interval)).await;
            if self.manually_closed.load(Ordering::SeqCst) {
                self.set_state(ConnectionState::Disconnected).await;
                return;
            }

            match self.open().await {
                Ok(()) => {
                    info!("Reconnected after {} attempt(s)", attempts);
                    return;
                }
                Err(e) => {
                    warn!("Reconnect attempt #{} failed: {}", attempts, e);
                    interval = (interval as f64 * self.options.reconnect_backoff_factor) as u64;
                    interval = interval.min(self.options.max_reconnect_interval);
                }
            }
        }
    }
}

// Watches the connection state for the life of the client and reconnects after
// every close that `disconnect()` did not ask for.
async fn supervise(handle: Weak<SocketHandle>, mut states: broadcast::Receiver<ConnectionState>) {
    loop {
        match states.recv().await {
            Ok(ConnectionState::Disconnected) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
        let Some(socket) = handle.upgrade() else { break };
        if socket.manually_closed.load(Ordering::SeqCst)
            || socket.state().await != ConnectionState::Disconnected
        {
            continue;
        }

        socket.reconnect().await;
        // Transitions made while reconnecting are already handled.
        states = states.resubscribe();
    }
    debug!("Reconnect supervisor finished");
}

/// Realtimeクライアント本体
///
/// One websocket per client. Channels are joined through [`RealtimeClient::channel`];
/// the socket is opened lazily by the first subscription and reopened after an
/// unexpected close when `auto_reconnect` is set.
pub struct RealtimeClient {
    pub(crate) handle: Arc<SocketHandle>,
}

impl RealtimeClient {
    /// デフォルトオプションで新しいクライアントを作成
    pub fn new(url: &str, key: &str) -> Self {
        Self::new_with_options(url, key, RealtimeClientOptions::default())
    }

    /// カスタムオプションで新しいクライアントを作成
    pub fn new_with_options(url: &str, key: &str, options: RealtimeClientOptions) -> Self {
        Self {
            handle: Arc::new(SocketHandle::new(url, key, options)),
        }
    }

    pub fn url(&self) -> &str {
        &self.handle.url
    }

    pub fn options(&self) -> &RealtimeClientOptions {
        &self.handle.options
    }
    /// 認証トークンを設定
    ///
    /// Joined channels are sent the new token immediately when connected.
    pub async fn set_auth(&self, token: Option<String>) {
        info!("Setting auth token (is_some: {})", token.is_some());
        *self.handle.access_token.write().await = token.clone();

        let Some(token) = token else { return };
        if self.handle.state().await != ConnectionState::Connected {
            return;
        }
        let channels: Vec<Arc<Channel>> =
            self.handle.channels.read().await.values().cloned().collect();
        for channel in channels {
            let message = RealtimeMessage::new(
                channel.topic(),
                ChannelEvent::AccessToken,
                json!({ "access_token": token }),
                Some(self.handle.next_ref()),
            );
            if let Err(e) = self.handle.send(&message).await {
                warn!("Failed to push access token to {}: {}", channel.topic(), e);
            }
        }
    }

    pub async fn access_token(&self) -> Option<String> {
        self.handle.access_token.read().await.clone()
    }

    /// 接続状態変更の通知を受け取るためのレシーバーを取得
    pub fn on_state_change(&self) -> broadcast::Receiver<ConnectionState> {
        self.handle.state_change.subscribe()
    }

    /// 現在の接続状態を取得
    pub async fn get_connection_state(&self) -> ConnectionState {
        self.handle.state().await
    }

    /// Number of channels currently registered on the socket.
    pub async fn channel_count(&self) -> usize {
        self.handle.channels.read().await.len()
    }

    /// 特定のトピックに対するチャンネルビルダーを作成
    ///
    /// Topics without the `realtime:` prefix get it added.
    pub fn channel(&self, name: &str) -> ChannelBuilder<'_> {
        let topic = if name.starts_with("realtime:") {
            name.to_string()
        } else {
            format!("realtime:{}", name)
        };
        debug!("Creating channel builder for topic: {}", topic);
        ChannelBuilder::new(self, topic)
    }

    pub(crate) fn websocket_url(&self) -> Result<Url, RealtimeError> {
        self.handle.websocket_url()
    }

    /// WebSocket接続を開始
    ///
    /// Returns immediately when already connected. Channels registered before a
    /// disconnect are joined again once the socket is back.
    pub async fn connect(&self) -> Result<(), RealtimeError> {
        self.handle.manually_closed.store(false, Ordering::SeqCst);
        let states = self.handle.state_change.subscribe();
        self.handle.open().await?;

        if self.handle.options.auto_reconnect && !self.handle.supervised.swap(true, Ordering::SeqCst)
        {
            tokio::spawn(supervise(Arc::downgrade(&self.handle), states));
        }
        Ok(())
    }

    /// 切断処理
    pub async fn disconnect(&self) -> Result<(), RealtimeError> {
        info!("disconnect() called");
        self.handle.manually_closed.store(true, Ordering::SeqCst);
        let sender = self.handle.socket.write().await.take();
        if sender.is_some() {
            // Dropping the sender ends the writer; the reader needs a nudge.
            self.handle.shutdown.notify_one();
        } else {
            debug!("disconnect(): no active socket");
        }
        drop(sender);
        self.handle.set_state(ConnectionState::Disconnected).await;
        Ok(())
    }
}

// 送信タスクが終了している場合
impl From<mpsc::error::SendError<Message>> for RealtimeError {
    fn from(_: mpsc::error::SendError<Message>) -> Self {
        RealtimeError::NotConnected
    }
}
