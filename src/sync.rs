//! Live views: full refetch on every change notification
//!
//! A [`LiveView`] owns the subscriptions of one mounted view. Change
//! notifications only wake a worker task; the worker drains whatever queued up
//! while it was busy and runs the whole load again, so a burst of changes
//! during a fetch costs exactly one follow-up fetch. Results that land after
//! [`LiveView::unmount`] are dropped.
//!
//! When the store reports its change feed as lost, the view keeps its data,
//! shows an error, and refetches once the feed is back.

use crate::aggregate::{load_client_detail, load_client_list, ClientDetail};
use crate::auth::AuthProvider;
use crate::config::BloomOptions;
use crate::error::{Error, Result};
use crate::models::{ClientWithStats, QuickSelectMaterial};
use crate::store::{
    fetch, ChangeCallback, Collection, FeedState, Filter, Order, Query, RecordStore,
    SubscriptionHandle,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

const FEED_INTERRUPTED: &str = "live updates interrupted; showing the last loaded data";

/// A query a view keeps fresh
#[async_trait]
pub trait LiveQuery: Send + Sync + 'static {
    type Output: Clone + Send + Sync + 'static;

    fn name(&self) -> String;

    /// Collections (and optional row filters) whose changes invalidate the result
    fn sources(&self) -> Vec<(Collection, Option<Filter>)>;

    async fn load(&self, store: &dyn RecordStore) -> Result<Self::Output>;
}

/// Client list with statistics
#[derive(Debug, Clone, Default)]
pub struct ClientListQuery;

#[async_trait]
impl LiveQuery for ClientListQuery {
    type Output = Vec<ClientWithStats>;

    fn name(&self) -> String {
        "clients-realtime".to_string()
    }

    fn sources(&self) -> Vec<(Collection, Option<Filter>)> {
        vec![
            (Collection::Clients, None),
            (Collection::MaterialLogs, None),
            (Collection::MaterialItems, None),
        ]
    }

    async fn load(&self, store: &dyn RecordStore) -> Result<Self::Output> {
        load_client_list(store).await
    }
}

/// One client with its logs and items
#[derive(Debug, Clone)]
pub struct ClientDetailQuery {
    pub client_id: String,
}

impl ClientDetailQuery {
    pub fn new(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
        }
    }
}

#[async_trait]
impl LiveQuery for ClientDetailQuery {
    type Output = ClientDetail;

    fn name(&self) -> String {
        format!("client-{}", self.client_id)
    }

    fn sources(&self) -> Vec<(Collection, Option<Filter>)> {
        vec![
            (
                Collection::MaterialLogs,
                Some(Filter::eq("client_id", self.client_id.clone())),
            ),
            (Collection::MaterialItems, None),
        ]
    }

    async fn load(&self, store: &dyn RecordStore) -> Result<Self::Output> {
        load_client_detail(store, &self.client_id).await
    }
}

/// Quick-select catalog, by name
#[derive(Debug, Clone, Default)]
pub struct QuickSelectQuery;

#[async_trait]
impl LiveQuery for QuickSelectQuery {
    type Output = Vec<QuickSelectMaterial>;

    fn name(&self) -> String {
        "quick-select-materials".to_string()
    }

    fn sources(&self) -> Vec<(Collection, Option<Filter>)> {
        vec![(Collection::QuickSelectMaterials, None)]
    }

    async fn load(&self, store: &dyn RecordStore) -> Result<Self::Output> {
        fetch(store, &Query::new().order(Order::asc("name"))).await
    }
}

/// Runs the wrapped query only while the same user is signed in
pub struct SignedIn<Q> {
    query: Q,
    auth: Arc<dyn AuthProvider>,
    user_id: String,
}

impl<Q> SignedIn<Q> {
    pub fn new(query: Q, auth: Arc<dyn AuthProvider>, user_id: &str) -> Self {
        Self {
            query,
            auth,
            user_id: user_id.to_string(),
        }
    }
}

#[async_trait]
impl<Q: LiveQuery> LiveQuery for SignedIn<Q> {
    type Output = Q::Output;

    fn name(&self) -> String {
        self.query.name()
    }

    fn sources(&self) -> Vec<(Collection, Option<Filter>)> {
        self.query.sources()
    }

    async fn load(&self, store: &dyn RecordStore) -> Result<Self::Output> {
        match self.auth.current_user() {
            Some(user) if user.id == self.user_id => self.query.load(store).await,
            _ => Err(Error::auth("signed out")),
        }
    }
}

/// What a view currently shows
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
    /// Last successful result; kept when a later refetch fails
    pub data: Option<T>,
    /// Message of the most recent failed load, cleared by the next success
    pub error: Option<String>,
    /// Bumped on every published load, successful or not
    pub revision: u64,
}

impl<T> Snapshot<T> {
    fn empty() -> Self {
        Self {
            data: None,
            error: None,
            revision: 0,
        }
    }

    /// An auth failure also drops the data; nobody may see it any more.
    fn apply(&mut self, result: Result<T>) {
        match result {
            Ok(data) => {
                self.data = Some(data);
                self.error = None;
            }
            Err(e) => {
                if e.is_auth() {
                    self.data = None;
                }
                self.error = Some(e.to_string());
            }
        }
        self.revision += 1;
    }

    fn fail(&mut self, message: &str) {
        self.error = Some(message.to_string());
        self.revision += 1;
    }
}

// Poisoning cannot leave a bool half-written.
fn lock_flag(flag: &Mutex<bool>) -> MutexGuard<'_, bool> {
    flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A mounted view and the subscriptions it owns
pub struct LiveView<T> {
    name: String,
    store: Arc<dyn RecordStore>,
    state: watch::Receiver<Snapshot<T>>,
    refresh_tx: Option<mpsc::UnboundedSender<()>>,
    /// Held while publishing, so nothing is published once unmount has
    /// cleared it
    mounted: Arc<Mutex<bool>>,
    refreshes: Arc<AtomicU64>,
    handles: Vec<SubscriptionHandle>,
}

impl<T> std::fmt::Debug for LiveView<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveView")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> LiveView<T> {
    /// Subscribes to every source, loads once, then keeps the result fresh.
    ///
    /// Subscriptions are taken before the initial load so a change racing the
    /// load still triggers a refetch. A failed initial load is reported in the
    /// snapshot; a failed subscription releases the ones already taken and is
    /// returned as an error. Dropping the future part way releases whatever it
    /// had subscribed.
    pub async fn mount<Q>(
        store: Arc<dyn RecordStore>,
        query: Q,
        options: &BloomOptions,
    ) -> Result<Self>
    where
        Q: LiveQuery<Output = T>,
    {
        let name = query.name();
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel::<()>();
        let (state_tx, state) = watch::channel(Snapshot::empty());
        let feed = store.feed_state();

        // Handles go straight onto the view so its Drop covers a cancelled mount.
        let mut view = Self {
            name: name.clone(),
            store: store.clone(),
            state,
            refresh_tx: Some(refresh_tx.clone()),
            mounted: Arc::new(Mutex::new(true)),
            refreshes: Arc::new(AtomicU64::new(0)),
            handles: Vec::new(),
        };

        for (collection, filter) in query.sources() {
            let tx = refresh_tx.clone();
            let view_name = name.clone();
            let on_change: ChangeCallback = Arc::new(move |event| {
                trace!(view = %view_name, collection = %event.collection, kind = ?event.kind, "change");
                let _ = tx.send(());
            });
            match store.subscribe(collection, filter, on_change).await {
                Ok(handle) => view.handles.push(handle),
                Err(e) => {
                    warn!(view = %name, collection = %collection, error = %e, "subscribe failed");
                    if let Err(release) = view.release().await {
                        warn!(view = %name, error = %release, "release after failed mount");
                    }
                    return Err(e);
                }
            }
        }

        let initial = query.load(store.as_ref()).await;
        if let Err(e) = &initial {
            warn!(view = %name, error = %e, "initial load failed");
        }
        state_tx.send_modify(|snapshot| snapshot.apply(initial));
        view.state.borrow_and_update();

        tokio::spawn(refetch_loop(
            query,
            store,
            refresh_rx,
            feed,
            state_tx,
            view.mounted.clone(),
            view.refreshes.clone(),
            options.refetch_debounce,
        ));

        info!(view = %name, subscriptions = view.handles.len(), "view mounted");
        Ok(view)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current snapshot
    pub fn state(&self) -> Snapshot<T> {
        self.state.borrow().clone()
    }

    /// Current data, if any load has succeeded
    pub fn data(&self) -> Option<T> {
        self.state.borrow().data.clone()
    }

    /// A receiver that observes every published snapshot
    pub fn watch(&self) -> watch::Receiver<Snapshot<T>> {
        self.state.clone()
    }

    /// Waits for the next published snapshot; `None` once the view is gone.
    pub async fn changed(&mut self) -> Option<Snapshot<T>> {
        self.state.changed().await.ok()?;
        Some(self.state.borrow_and_update().clone())
    }

    /// Asks for a refetch, as if a change had arrived.
    pub fn refresh(&self) {
        if let Some(tx) = &self.refresh_tx {
            let _ = tx.send(());
        }
    }

    /// Number of refetches published since mount
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Releases every subscription exactly once and stops publishing.
    ///
    /// All handles are released even if one fails; the first failure is
    /// returned.
    pub async fn unmount(mut self) -> Result<()> {
        *lock_flag(&self.mounted) = false;
        self.refresh_tx = None;

        let released = self.release().await;
        info!(view = %self.name, "view unmounted");
        released
    }
}

impl<T> LiveView<T> {
    async fn release(&mut self) -> Result<()> {
        let mut first_error = None;
        for handle in std::mem::take(&mut self.handles) {
            if let Err(e) = self.store.unsubscribe(handle).await {
                warn!(view = %self.name, error = %e, "unsubscribe failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl<T> Drop for LiveView<T> {
    fn drop(&mut self) {
        *lock_flag(&self.mounted) = false;
        if self.handles.is_empty() {
            return;
        }
        let handles = std::mem::take(&mut self.handles);
        let store = self.store.clone();
        let name = self.name.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    for handle in handles {
                        if let Err(e) = store.unsubscribe(handle).await {
                            warn!(view = %name, error = %e, "unsubscribe on drop failed");
                        }
                    }
                });
            }
            Err(_) => warn!(view = %name, "view dropped outside a runtime; subscriptions leaked"),
        }
    }
}

// Publishes under the mount flag; false once the view is gone.
fn publish<T>(
    mounted: &Mutex<bool>,
    state_tx: &watch::Sender<Snapshot<T>>,
    update: impl FnOnce(&mut Snapshot<T>),
) -> bool {
    let mounted = lock_flag(mounted);
    if !*mounted {
        return false;
    }
    state_tx.send_modify(update);
    true
}

// Never resolves for stores without a feed or once the feed is closed.
async fn next_feed_state(feed: &mut Option<broadcast::Receiver<FeedState>>) -> FeedState {
    loop {
        let Some(rx) = feed.as_mut() else {
            return std::future::pending().await;
        };
        match rx.recv().await {
            Ok(state) => return state,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => *feed = None,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn refetch_loop<Q: LiveQuery>(
    query: Q,
    store: Arc<dyn RecordStore>,
    mut refresh_rx: mpsc::UnboundedReceiver<()>,
    mut feed: Option<broadcast::Receiver<FeedState>>,
    state_tx: watch::Sender<Snapshot<Q::Output>>,
    mounted: Arc<Mutex<bool>>,
    refreshes: Arc<AtomicU64>,
    debounce: Option<Duration>,
) {
    let name = query.name();
    let mut feed_lost = false;
    loop {
        tokio::select! {
            request = refresh_rx.recv() => if request.is_none() {
                break;
            },
            state = next_feed_state(&mut feed) => match state {
                FeedState::Disconnected => {
                    if feed_lost {
                        continue;
                    }
                    feed_lost = true;
                    warn!(view = %name, "change feed interrupted");
                    if !publish(&mounted, &state_tx, |snapshot| snapshot.fail(FEED_INTERRUPTED)) {
                        break;
                    }
                    continue;
                }
                FeedState::Connected => {
                    if !std::mem::replace(&mut feed_lost, false) {
                        continue;
                    }
                    info!(view = %name, "change feed restored");
                }
            },
        }

        if let Some(quiet) = debounce {
            tokio::time::sleep(quiet).await;
        }
        let mut coalesced = 0usize;
        while refresh_rx.try_recv().is_ok() {
            coalesced += 1;
        }
        let still_mounted = *lock_flag(&mounted);
        if !still_mounted {
            break;
        }

        debug!(view = %name, coalesced, "refetching");
        let result = query.load(store.as_ref()).await;
        if let Err(e) = &result {
            warn!(view = %name, error = %e, "refetch failed");
        }
        let published = publish(&mounted, &state_tx, |snapshot| {
            refreshes.fetch_add(1, Ordering::SeqCst);
            snapshot.apply(result);
            if feed_lost && snapshot.error.is_none() {
                snapshot.error = Some(FEED_INTERRUPTED.to_string());
            }
        });
        if !published {
            debug!(view = %name, "view unmounted during refetch; result dropped");
            break;
        }
    }
    debug!(view = %name, "refetch loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn row(value: serde_json::Value) -> crate::store::Row {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Default::default(),
        }
    }

    #[tokio::test]
    async fn catalog_view_refetches_on_change() {
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn RecordStore> = memory.clone();
        let mut view = LiveView::mount(store.clone(), QuickSelectQuery, &BloomOptions::default())
            .await
            .unwrap();
        assert_eq!(view.data(), Some(Vec::new()));
        assert_eq!(memory.subscriber_count(), 1);

        store
            .insert(
                Collection::QuickSelectMaterials,
                row(json!({ "name": "Mulch", "unit": "yards" })),
            )
            .await
            .unwrap();

        let snapshot = view.changed().await.unwrap();
        let names: Vec<_> = snapshot.data.unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, ["Mulch"]);

        view.unmount().await.unwrap();
        assert_eq!(memory.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn failed_initial_load_is_reported_then_recovers() {
        let memory = Arc::new(MemoryStore::new());
        memory.fail_next_selects(Collection::QuickSelectMaterials, 1);
        let store: Arc<dyn RecordStore> = memory.clone();

        let mut view = LiveView::mount(store, QuickSelectQuery, &BloomOptions::default())
            .await
            .unwrap();
        let initial = view.state();
        assert!(initial.data.is_none());
        assert!(initial.error.is_some());

        view.refresh();
        let next = view.changed().await.unwrap();
        assert_eq!(next.data, Some(Vec::new()));
        assert!(next.error.is_none());
        view.unmount().await.unwrap();
    }

    #[tokio::test]
    async fn failed_refetch_keeps_previous_data() {
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn RecordStore> = memory.clone();
        let mut view = LiveView::mount(store, QuickSelectQuery, &BloomOptions::default())
            .await
            .unwrap();

        memory.fail_next_selects(Collection::QuickSelectMaterials, 1);
        view.refresh();
        let next = view.changed().await.unwrap();
        assert_eq!(next.data, Some(Vec::new()));
        assert!(next.error.is_some());
        view.unmount().await.unwrap();
    }

    #[tokio::test]
    async fn dropping_a_view_releases_subscriptions() {
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn RecordStore> = memory.clone();
        let view = LiveView::mount(store, ClientListQuery, &BloomOptions::default())
            .await
            .unwrap();
        assert_eq!(memory.subscriber_count(), 3);

        drop(view);
        for _ in 0..50 {
            if memory.subscriber_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(memory.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_mount_releases_its_subscriptions() {
        let memory = Arc::new(MemoryStore::new().with_latency(Duration::from_millis(200)));
        let store: Arc<dyn RecordStore> = memory.clone();

        let options = BloomOptions::default();
        let mount = LiveView::mount(store, ClientListQuery, &options);
        let outcome = tokio::time::timeout(Duration::from_millis(20), mount).await;
        assert!(outcome.is_err(), "mount should still be loading");
        assert_eq!(memory.select_calls(Collection::Clients), 1);

        for _ in 0..50 {
            if memory.subscriber_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(memory.subscriber_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unmount_during_refetch_publishes_nothing() {
        let memory = Arc::new(MemoryStore::new().with_latency(Duration::from_millis(100)));
        let store: Arc<dyn RecordStore> = memory.clone();
        let view = LiveView::mount(store.clone(), QuickSelectQuery, &BloomOptions::default())
            .await
            .unwrap();
        let watcher = view.watch();
        let before = watcher.borrow().revision;

        store
            .insert(
                Collection::QuickSelectMaterials,
                row(json!({ "name": "Mulch", "unit": "yards" })),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(memory.select_calls(Collection::QuickSelectMaterials), 2);

        view.unmount().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(watcher.borrow().revision, before);
        assert_eq!(watcher.borrow().data, Some(Vec::new()));
        assert_eq!(memory.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn lost_feed_is_reported_and_refetched_on_restore() {
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn RecordStore> = memory.clone();
        let mut view = LiveView::mount(store.clone(), QuickSelectQuery, &BloomOptions::default())
            .await
            .unwrap();

        memory.set_feed_state(FeedState::Disconnected);
        let lost = view.changed().await.unwrap();
        assert_eq!(lost.data, Some(Vec::new()));
        assert_eq!(lost.error.as_deref(), Some(FEED_INTERRUPTED));
        assert_eq!(view.refresh_count(), 0);

        // Written while the feed is down, so no notification is trusted.
        store
            .insert(
                Collection::QuickSelectMaterials,
                row(json!({ "name": "Sod", "unit": "pallets" })),
            )
            .await
            .unwrap();
        let during = view.changed().await.unwrap();
        assert_eq!(during.error.as_deref(), Some(FEED_INTERRUPTED));

        memory.set_feed_state(FeedState::Connected);
        let restored = view.changed().await.unwrap();
        assert!(restored.error.is_none());
        let names: Vec<_> = restored.data.unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, ["Sod"]);

        view.unmount().await.unwrap();
    }

    #[tokio::test]
    async fn signed_in_query_fails_after_sign_out() {
        use crate::auth::{AuthUser, StaticAuth};

        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn RecordStore> = memory.clone();
        let auth = Arc::new(StaticAuth::signed_in(AuthUser {
            id: "crew-1".into(),
            email: None,
        }));
        let query = SignedIn::new(QuickSelectQuery, auth.clone(), "crew-1");
        let mut view = LiveView::mount(store, query, &BloomOptions::default())
            .await
            .unwrap();
        assert_eq!(view.data(), Some(Vec::new()));

        auth.sign_out().await.unwrap();
        view.refresh();
        let after = view.changed().await.unwrap();
        assert!(after.data.is_none());
        assert!(after.error.is_some());
        view.unmount().await.unwrap();
    }
}
