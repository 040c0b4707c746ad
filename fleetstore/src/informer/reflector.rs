use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::StreamExt;
use kube::core::{DynamicObject, GroupVersionKind};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::concurrency::shutdown::{self, ShutdownRx};
use crate::error::{ErrorKind, FleetError, FleetResult};
use crate::fleet_error;
use crate::informer::backoff::{ExponentialBackoff, RetryWithDeadline};
use crate::informer::lister_watcher::{
    ListParams, ListerWatcher, WatchEvent, WatchParams, WatchStream,
};
use crate::informer::pager::{ListPager, DEFAULT_PAGE_SIZE};
use crate::informer::store::{Store, StoreItem};
use crate::resource::{object_gvk, object_resource_version, ObjectKey};

/// How long the watch retry window for internal errors stays open once it is reset.
const INTERNAL_ERROR_RESET_PERIOD: Duration = Duration::from_secs(60);

/// Called whenever list-and-watch drops the connection with an error, and with `None`
/// each time a watch connects. Implementations must return quickly.
pub type WatchErrorHandler = Arc<dyn Fn(&str, Option<&FleetError>) + Send + Sync>;

/// Consulted on every resync tick; the store's resync only runs when it returns true.
pub type ShouldResync = Arc<dyn Fn() -> bool + Send + Sync>;

/// The default watch error handler logs at a level matching the error class.
pub fn default_watch_error_handler(name: &str, err: Option<&FleetError>) {
    let Some(err) = err else { return };
    if err.is_expired() {
        debug!(reflector = name, error = %err, "watch closed because the resource version expired");
    } else {
        warn!(reflector = name, error = %err, "failed to list and watch");
    }
}

/// Tunables of a [`Reflector`].
#[derive(Debug, Clone)]
pub struct ReflectorOptions {
    /// Interval between store resyncs. Zero disables resyncing.
    pub resync_period: Duration,
    /// Lower bound of the randomized watch timeout; requests use a timeout uniform in
    /// `[min_watch_timeout, 2 * min_watch_timeout]`.
    pub min_watch_timeout: Duration,
    /// Explicit chunk size for list requests. Zero lets the reflector decide.
    pub watch_list_page_size: i64,
    /// Forces chunked listing even for the very first list.
    pub force_paginated_list: bool,
    /// Hands listed objects to the store as pages arrive instead of materializing the
    /// whole list first; the store replacement then carries natural keys only.
    pub stream_handle_for_paginated_list: bool,
    /// Budget for retrying internal errors on the watch stream. Zero disables retrying.
    pub max_internal_error_retry_duration: Duration,
}

impl Default for ReflectorOptions {
    fn default() -> Self {
        Self {
            resync_period: Duration::ZERO,
            min_watch_timeout: Duration::from_secs(5 * 60),
            watch_list_page_size: 0,
            force_paginated_list: false,
            stream_handle_for_paginated_list: false,
            max_internal_error_retry_duration: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct RvState {
    last_sync_resource_version: String,
    /// Set when the previous request at `last_sync_resource_version` was rejected as
    /// expired or too large; cleared by any successful list.
    unavailable: bool,
}

/// Keeps a [`Store`] aligned with one resource kind of one cluster.
///
/// [`Reflector::run`] performs a paginated initial list, atomically replaces the store
/// contents, then applies watch events until the stream drops, relisting and backing
/// off as needed. The last observed resource version advances monotonically across
/// events and successful lists.
pub struct Reflector<L, S> {
    name: String,
    expected_gvk: Option<GroupVersionKind>,
    lister_watcher: Arc<L>,
    store: Arc<S>,
    options: ReflectorOptions,
    should_resync: Option<ShouldResync>,
    watch_error_handler: WatchErrorHandler,

    rv: Arc<RwLock<RvState>>,
    /// Whether the initial list came back chunked; later relists then keep asking for
    /// chunks instead of probing the watch cache.
    paginated_result: AtomicBool,
    has_initialized_synced: AtomicBool,

    backoff: Mutex<ExponentialBackoff>,
    init_conn_backoff: Mutex<ExponentialBackoff>,
}

/// Result of one (possibly retried) list pass, produced on the forked list task.
struct ListOutcome {
    resource_version: String,
    items: Vec<DynamicObject>,
    item_keys: Vec<ObjectKey>,
    paginated: bool,
}

impl<L, S> Reflector<L, S>
where
    L: ListerWatcher,
    S: Store,
{
    pub fn new(name: &str, lister_watcher: Arc<L>, store: Arc<S>, options: ReflectorOptions) -> Self {
        Self {
            name: name.to_string(),
            expected_gvk: None,
            lister_watcher,
            store,
            options,
            should_resync: None,
            watch_error_handler: Arc::new(|name, err| default_watch_error_handler(name, err)),
            rv: Arc::new(RwLock::new(RvState::default())),
            paginated_result: AtomicBool::new(false),
            has_initialized_synced: AtomicBool::new(false),
            backoff: Mutex::new(ExponentialBackoff::for_sync_loop()),
            init_conn_backoff: Mutex::new(ExponentialBackoff::for_sync_loop()),
        }
    }

    /// Rejects watch events whose object does not carry this group/version/kind.
    pub fn with_expected_gvk(mut self, gvk: GroupVersionKind) -> Self {
        self.expected_gvk = Some(gvk);
        self
    }

    pub fn with_should_resync(mut self, should_resync: ShouldResync) -> Self {
        self.should_resync = Some(should_resync);
        self
    }

    pub fn with_watch_error_handler(mut self, handler: WatchErrorHandler) -> Self {
        self.watch_error_handler = handler;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The resource version observed by the last sync. Safe to call from any task.
    pub fn last_sync_resource_version(&self) -> String {
        self.rv.read().unwrap().last_sync_resource_version.clone()
    }

    /// True once the first list has been applied to the store.
    pub fn has_initialized_synced(&self) -> bool {
        self.has_initialized_synced.load(Ordering::SeqCst)
    }

    /// Runs list-and-watch until shutdown fires, relaunching it under backoff whenever
    /// it drops.
    pub async fn run(&self, mut shutdown: ShutdownRx) {
        info!(reflector = %self.name, resync_period = ?self.options.resync_period, "starting reflector");

        loop {
            if shutdown::is_shutdown(&shutdown) {
                break;
            }
            if let Err(err) = self.list_and_watch(shutdown.clone()).await {
                (self.watch_error_handler)(&self.name, Some(&err));
            }
            if shutdown::is_shutdown(&shutdown) {
                break;
            }

            let delay = self.backoff.lock().unwrap().next_backoff();
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown::wait_shutdown(&mut shutdown) => break,
            }
        }

        info!(reflector = %self.name, "stopping reflector");
    }

    /// One full cycle: list, replace the store, then watch until the stream drops.
    async fn list_and_watch(&self, mut shutdown: ShutdownRx) -> FleetResult<()> {
        debug!(reflector = %self.name, "listing and watching");

        if !self.list(&mut shutdown).await? {
            return Ok(());
        }
        self.has_initialized_synced.store(true, Ordering::SeqCst);

        let (resync_err_tx, mut resync_err_rx) = mpsc::channel(1);
        let (cancel_tx, cancel_rx) = watch::channel(());
        if !self.options.resync_period.is_zero() {
            tokio::spawn(resync_loop(
                self.store.clone(),
                self.options.resync_period,
                self.should_resync.clone(),
                shutdown.clone(),
                cancel_rx,
                resync_err_tx,
                self.name.clone(),
            ));
        }
        // Dropping the sender on return stops the resync task with this cycle.
        let _cancel = cancel_tx;

        let mut retry = RetryWithDeadline::new(
            self.options.max_internal_error_retry_duration,
            INTERNAL_ERROR_RESET_PERIOD,
        );

        loop {
            if shutdown::is_shutdown(&shutdown) {
                return Ok(());
            }

            let timeout_seconds =
                (self.options.min_watch_timeout.as_secs_f64() * (1.0 + rand::random::<f64>())) as i64;
            let params = WatchParams {
                resource_version: self.last_sync_resource_version(),
                // Stop watchers that receive nothing within the timeout window.
                timeout_seconds: Some(timeout_seconds),
                allow_watch_bookmarks: true,
            };

            // Started before the request: proxies may hold headers until the first event.
            let start = Instant::now();
            let stream = match self.lister_watcher.watch(params).await {
                Ok(stream) => stream,
                Err(err) => {
                    if err.is_connection_refused() || err.is_throttled() {
                        // The source is unreachable or shedding load; resuming the watch
                        // where it ended beats relisting everything.
                        self.init_conn_backoff_sleep(&mut shutdown).await;
                        continue;
                    }
                    return Err(err);
                }
            };

            (self.watch_error_handler)(&self.name, None);

            let result = self
                .watch_handler(start, stream, &mut resync_err_rx, &mut shutdown)
                .await;
            retry.track(&result);

            let Err(err) = result else { continue };
            if err.is_stop_requested() {
                return Ok(());
            }
            if err.is_expired() {
                // A list at the last seen version returns data at least as fresh, so the
                // next list starts there rather than from scratch.
                debug!(reflector = %self.name, error = %err, "watch closed");
                return Ok(());
            }
            if err.is_throttled() {
                warn!(reflector = %self.name, "watch returned 429, backing off");
                self.init_conn_backoff_sleep(&mut shutdown).await;
                continue;
            }
            if err.is_internal() && retry.should_retry() {
                debug!(reflector = %self.name, error = %err, "retrying watch after internal error");
                continue;
            }
            warn!(reflector = %self.name, error = %err, "watch ended");
            return Ok(());
        }
    }

    /// Lists all items and replaces the store. Returns false when shutdown preempted
    /// the list; the forked request then finishes detached and its result is dropped.
    async fn list(&self, shutdown: &mut ShutdownRx) -> FleetResult<bool> {
        let start_rv = self.relist_resource_version();
        let params = ListParams {
            resource_version: start_rv.clone(),
            ..Default::default()
        };

        let page_size = if self.options.watch_list_page_size != 0 {
            self.options.watch_list_page_size
        } else if self.paginated_result.load(Ordering::Relaxed) {
            // The source honored chunking before; watch cache is likely disabled.
            DEFAULT_PAGE_SIZE
        } else if !start_rv.is_empty() && start_rv != "0" {
            // Relist at a known version: disable chunking so the source can serve the
            // request from its watch cache.
            0
        } else {
            DEFAULT_PAGE_SIZE
        };

        let lister = self.lister_watcher.clone();
        let store = self.store.clone();
        let rv_state = self.rv.clone();
        let stream_mode = self.options.stream_handle_for_paginated_list;
        let force_paginated = self.options.force_paginated_list;
        let task_params = params.clone();
        let mut handle = tokio::spawn(async move {
            run_list(lister, store, rv_state, task_params, page_size, stream_mode, force_paginated)
                .await
        });

        let outcome = tokio::select! {
            _ = shutdown::wait_shutdown(shutdown) => return Ok(false),
            res = &mut handle => match res {
                Ok(outcome) => outcome,
                Err(err) => {
                    return Err(fleet_error!(
                        ErrorKind::InternalError,
                        "list task aborted",
                        err
                    ));
                }
            },
        };
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(reflector = %self.name, error = %err, "failed to list");
                return Err(err);
            }
        };

        // Only the initial list (the only one issued at resource version "0") decides
        // whether chunking is the norm for this source; forced full reads later would
        // otherwise flip the preference.
        if start_rv == "0" && outcome.paginated {
            self.paginated_result.store(true, Ordering::Relaxed);
        }
        self.set_unavailable(false);

        let resource_version = outcome.resource_version.clone();
        let items: Vec<StoreItem> = if !outcome.item_keys.is_empty() {
            debug!(reflector = %self.name, "replacing store from streamed list keys");
            outcome.item_keys.into_iter().map(StoreItem::Key).collect()
        } else {
            outcome
                .items
                .into_iter()
                .map(|obj| StoreItem::Object(Box::new(obj)))
                .collect()
        };
        self.store.replace(items, &resource_version).await?;

        self.set_last_sync_resource_version(&resource_version);
        Ok(true)
    }

    /// Applies watch events to the store until the stream closes or fails.
    async fn watch_handler(
        &self,
        start: Instant,
        mut stream: WatchStream,
        resync_err_rx: &mut mpsc::Receiver<FleetError>,
        shutdown: &mut ShutdownRx,
    ) -> FleetResult<()> {
        let mut event_count = 0u64;

        loop {
            let event = tokio::select! {
                _ = shutdown::wait_shutdown(shutdown) => {
                    return Err(fleet_error!(ErrorKind::StopRequested, "stop requested"));
                }
                Some(err) = resync_err_rx.recv() => return Err(err),
                event = stream.next() => event,
            };
            let Some(event) = event else { break };

            let (obj, action) = match event? {
                WatchEvent::Error(status) => return Err(FleetError::from_status(&status)),
                WatchEvent::Added(obj) => (obj, Action::Add),
                WatchEvent::Modified(obj) => (obj, Action::Update),
                WatchEvent::Deleted(obj) => (obj, Action::Delete),
                WatchEvent::Bookmark(obj) => (obj, Action::Bookmark),
            };

            if let Some(expected) = &self.expected_gvk {
                let matches = object_gvk(&obj)
                    .map(|actual| gvk_matches(&actual, expected))
                    .unwrap_or(false);
                if !matches {
                    error!(
                        reflector = %self.name,
                        expected = ?expected,
                        actual = ?object_gvk(&obj),
                        "watch event object had unexpected group/version/kind"
                    );
                    continue;
                }
            }

            let resource_version = object_resource_version(&obj);
            let applied = match action {
                Action::Add => self.store.add(obj).await,
                Action::Update => self.store.update(obj).await,
                // The payload is the last known state of the deleted object.
                Action::Delete => self.store.delete(obj).await,
                Action::Bookmark => Ok(()),
            };
            if let Err(err) = applied {
                error!(reflector = %self.name, error = %err, "unable to apply watch event to store");
            }

            self.set_last_sync_resource_version(&resource_version);
            if let Some(updater) = self.store.resource_version_updater() {
                updater.update_resource_version(&resource_version);
            }
            event_count += 1;
        }

        if start.elapsed() < Duration::from_secs(1) && event_count == 0 {
            return Err(fleet_error!(
                ErrorKind::VeryShortWatch,
                "watch lasted less than a second and delivered no items"
            ));
        }
        debug!(reflector = %self.name, events = event_count, "watch closed");
        Ok(())
    }

    async fn init_conn_backoff_sleep(&self, shutdown: &mut ShutdownRx) {
        let delay = self.init_conn_backoff.lock().unwrap().next_backoff();
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown::wait_shutdown(shutdown) => {}
        }
    }

    /// The resource version the next list starts from: the last observed version, `"0"`
    /// when nothing was observed yet, or empty after the last version became
    /// unavailable (forcing a consistent read).
    fn relist_resource_version(&self) -> String {
        let state = self.rv.read().unwrap();
        relist_rv(&state, self.options.force_paginated_list)
    }

    fn set_last_sync_resource_version(&self, resource_version: &str) {
        self.rv.write().unwrap().last_sync_resource_version = resource_version.to_string();
    }

    fn set_unavailable(&self, unavailable: bool) {
        self.rv.write().unwrap().unavailable = unavailable;
    }
}

enum Action {
    Add,
    Update,
    Delete,
    Bookmark,
}

fn gvk_matches(actual: &GroupVersionKind, expected: &GroupVersionKind) -> bool {
    actual.group == expected.group
        && actual.version == expected.version
        && actual.kind == expected.kind
}

fn relist_rv(state: &RvState, force_paginated_list: bool) -> String {
    if state.unavailable {
        // Re-establish against the latest version the source has, via a consistent read.
        return String::new();
    }
    if state.last_sync_resource_version.is_empty() {
        if force_paginated_list {
            return String::new();
        }
        // The initial list opts into arbitrarily old data so it can be served cheaply.
        return "0".to_string();
    }
    state.last_sync_resource_version.clone()
}

/// Runs the list pass on the forked task, retrying once from a consistent read when the
/// requested resource version is gone.
async fn run_list<L, S>(
    lister: Arc<L>,
    store: Arc<S>,
    rv_state: Arc<RwLock<RvState>>,
    params: ListParams,
    page_size: i64,
    stream_mode: bool,
    force_paginated_list: bool,
) -> FleetResult<ListOutcome>
where
    L: ListerWatcher,
    S: Store,
{
    let first = list_attempt(&lister, &store, params.clone(), page_size, stream_mode).await;
    let err = match first {
        Ok(outcome) => return Ok(outcome),
        Err(err) => err,
    };
    if !err.is_expired() && !err.is_too_large_resource_version() {
        return Err(err);
    }

    // The version we listed at is gone (or lies in the future). Remember that so every
    // path recomputing the start version lands on a consistent read, then retry
    // immediately from there.
    rv_state.write().unwrap().unavailable = true;
    let retry_params = ListParams {
        resource_version: relist_rv(&rv_state.read().unwrap(), force_paginated_list),
        ..Default::default()
    };
    list_attempt(&lister, &store, retry_params, page_size, stream_mode).await
}

async fn list_attempt<L, S>(
    lister: &Arc<L>,
    store: &Arc<S>,
    params: ListParams,
    page_size: i64,
    stream_mode: bool,
) -> FleetResult<ListOutcome>
where
    L: ListerWatcher,
    S: Store,
{
    let mut pager = ListPager::new(lister.clone());
    pager.page_size = page_size;

    if !stream_mode {
        let (list, paginated) = pager.list(params).await?;
        return Ok(ListOutcome {
            resource_version: list.resource_version,
            items: list.items,
            item_keys: Vec::new(),
            paginated,
        });
    }

    let (tx, mut rx) = mpsc::channel(10);
    let pager_task = tokio::spawn(async move { pager.list_with_sink(params, tx).await });

    let mut keys = Vec::new();
    while let Some(obj) = rx.recv().await {
        let key = ObjectKey::from_object(&obj);
        store.add(obj).await?;
        keys.push(key);
    }

    let (list, paginated) = pager_task
        .await
        .map_err(|err| fleet_error!(ErrorKind::InternalError, "list task aborted", err))??;
    Ok(ListOutcome {
        resource_version: list.resource_version,
        items: Vec::new(),
        item_keys: keys,
        paginated,
    })
}

async fn resync_loop<S: Store>(
    store: Arc<S>,
    period: Duration,
    should_resync: Option<ShouldResync>,
    mut shutdown: ShutdownRx,
    mut cancel: watch::Receiver<()>,
    err_tx: mpsc::Sender<FleetError>,
    name: String,
) {
    loop {
        tokio::select! {
            _ = sleep(period) => {}
            _ = shutdown::wait_shutdown(&mut shutdown) => return,
            _ = cancel.changed() => return,
        }
        if should_resync.as_ref().map(|f| f()).unwrap_or(true) {
            debug!(reflector = %name, "forcing resync");
            if let Err(err) = store.resync().await {
                let _ = err_tx.send(err).await;
                return;
            }
        }
    }
}
