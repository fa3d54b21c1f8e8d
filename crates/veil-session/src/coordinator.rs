//! Session coordinator.
//!
//! Owns "are we connected". Commands arrive from the presentation side;
//! permission results, tunnel start/stop confirmations and traffic samples
//! arrive from spawned tasks. Every mutation goes through the single
//! `CoreState` mutex, publications happen inside that critical section, and
//! the lock is never held across an await - so observers see snapshots in
//! exactly the order the state changed.
//!
//! Cancellation uses an epoch counter: each connect attempt gets a fresh
//! epoch, disconnect bumps it, and any completion arriving for a stale
//! epoch is discarded. A grant or start confirmation from an attempt the
//! user already cancelled can therefore never resurrect a session.

use crate::config::SessionConfig;
use crate::error::{ErrorCategory, SessionError};
use crate::state::{ConnectionState, SessionSnapshot};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;
use veil_subscription::{NodeId, SubscriptionFetcher, SubscriptionStore};
use veil_tunnel::{
    PermissionBackend, PermissionDecision, PermissionGate, StartedTunnel, TrafficCounter,
    TrafficSample, TunnelConfig, TunnelDriver, TunnelHandle,
};

/// Everything behind the critical section.
struct CoreState {
    state: ConnectionState,
    /// Connect-attempt generation; stale completions are discarded
    epoch: u64,
    /// Publication counter
    revision: u64,
    subscription: SubscriptionStore,
    /// Node the running tunnel was started with
    active_node: Option<NodeId>,
    connected_at: Option<Instant>,
    last_error: Option<(ErrorCategory, String)>,
    /// Handle of the running tunnel; owned here and nowhere else
    handle: Option<TunnelHandle>,
    /// Generation counter for refresh rounds; an older fetch result must
    /// not overwrite a newer one
    refresh_epoch: u64,
    pump: Option<JoinHandle<()>>,
    auto_refresh: Option<JoinHandle<()>>,
    last_traffic_publish: Option<Instant>,
}

impl CoreState {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            epoch: 0,
            revision: 0,
            subscription: SubscriptionStore::new(),
            active_node: None,
            connected_at: None,
            last_error: None,
            handle: None,
            refresh_epoch: 0,
            pump: None,
            auto_refresh: None,
            last_traffic_publish: None,
        }
    }

    fn clear_error(&mut self, category: ErrorCategory) {
        if self.last_error.as_ref().is_some_and(|(c, _)| *c == category) {
            self.last_error = None;
        }
    }
}

struct Inner {
    tunnel: Arc<dyn TunnelDriver>,
    permission: PermissionGate,
    fetcher: Arc<dyn SubscriptionFetcher>,
    traffic: TrafficCounter,
    config: SessionConfig,
    tx: broadcast::Sender<SessionSnapshot>,
    core: Mutex<CoreState>,
}

impl Inner {
    fn snapshot_locked(&self, core: &CoreState) -> SessionSnapshot {
        SessionSnapshot {
            revision: core.revision,
            state: core.state.clone(),
            traffic: self.traffic.current(),
            user: core.subscription.user().cloned(),
            nodes: core.subscription.nodes().to_vec(),
            selected_node_id: core.subscription.selected().cloned(),
            active_node_id: core.active_node.clone(),
            connected_at: core.connected_at,
            last_error: core.last_error.as_ref().map(|(_, msg)| msg.clone()),
        }
    }

    /// Bump the revision and broadcast. Must be called with the lock held,
    /// which is what serializes publication order.
    fn publish_locked(&self, core: &mut CoreState) -> SessionSnapshot {
        core.revision += 1;
        let snap = self.snapshot_locked(core);
        let _ = self.tx.send(snap.clone());
        snap
    }

    /// Surface a connection failure: Error is published so the transition
    /// is observable, then the session settles back to Disconnected with
    /// `last_error` retained.
    fn fail_connection_locked(&self, core: &mut CoreState, reason: String) {
        warn!(%reason, "connection failed");
        core.last_error = Some((ErrorCategory::Connection, reason.clone()));
        core.state = ConnectionState::Error(reason);
        self.publish_locked(core);
        core.state = ConnectionState::Disconnected;
        core.connected_at = None;
        core.active_node = None;
        self.publish_locked(core);
    }

    /// Fold a traffic sample into the counters.
    ///
    /// Returns whether the caller's session is still current (the pump
    /// stops when it is not). Samples outside Connected are dropped.
    fn ingest_sample(&self, sample: TrafficSample, required_epoch: Option<u64>) -> bool {
        let mut core = self.core.lock().unwrap();
        if required_epoch.is_some_and(|epoch| core.epoch != epoch) {
            return false;
        }
        if core.state != ConnectionState::Connected {
            trace!("traffic sample dropped outside connected state");
            return false;
        }

        self.traffic.add(sample.upload_delta, sample.download_delta);

        // Publication is coalesced; the counters are not.
        let now = Instant::now();
        let due = core
            .last_traffic_publish
            .is_none_or(|last| now.duration_since(last) >= self.config.traffic_publish_interval);
        if due {
            core.last_traffic_publish = Some(now);
            self.publish_locked(&mut core);
        }
        true
    }
}

/// Coordinates the VPN session lifecycle.
///
/// One instance per process. Commands return immediately; their results
/// manifest as later snapshots on [`SessionCoordinator::observe`]. Must be
/// created and used within a Tokio runtime.
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

impl SessionCoordinator {
    /// Create a coordinator over the given platform boundaries.
    pub fn new(
        tunnel: Arc<dyn TunnelDriver>,
        permission: Arc<dyn PermissionBackend>,
        fetcher: Arc<dyn SubscriptionFetcher>,
        config: SessionConfig,
    ) -> Self {
        let (tx, _) = broadcast::channel(config.broadcast_capacity);
        let inner = Arc::new(Inner {
            tunnel,
            permission: PermissionGate::new(permission),
            fetcher,
            traffic: TrafficCounter::new(),
            config,
            tx,
            core: Mutex::new(CoreState::new()),
        });

        if let Some(every) = inner.config.auto_refresh {
            let task = tokio::spawn(run_auto_refresh(inner.clone(), every));
            inner.core.lock().unwrap().auto_refresh = Some(task);
        }

        Self { inner }
    }

    /// Begin connecting.
    ///
    /// A no-op returning the current snapshot unless the session is resting
    /// at Disconnected - concurrent calls coalesce into the attempt already
    /// in flight and can never double-start the tunnel. Skips the
    /// permission phase when the capability is already granted.
    pub fn connect(&self) -> SessionSnapshot {
        let inner = &self.inner;
        let mut core = inner.core.lock().unwrap();

        if core.state != ConnectionState::Disconnected {
            debug!(state = %core.state, "connect coalesced; session not idle");
            return inner.snapshot_locked(&core);
        }

        core.epoch += 1;
        let epoch = core.epoch;
        let granted = inner.permission.is_granted();
        core.state = if granted {
            ConnectionState::Connecting
        } else {
            ConnectionState::AwaitingPermission
        };
        info!(epoch, granted, "connect attempt started");
        let snap = inner.publish_locked(&mut core);
        tokio::spawn(run_attempt(self.inner.clone(), epoch, granted));
        snap
    }

    /// Stop the session. Idempotent.
    ///
    /// While AwaitingPermission or Connecting this cancels the in-flight
    /// attempt and moves straight to Disconnected; no partial tunnel is
    /// left running. From Connected it publishes Disconnecting, stops the
    /// tunnel in the background, then publishes Disconnected.
    pub fn disconnect(&self) -> SessionSnapshot {
        let inner = &self.inner;
        let mut core = inner.core.lock().unwrap();

        let state = core.state.clone();
        match state {
            ConnectionState::Disconnected | ConnectionState::Error(_) => {
                debug!("disconnect is a no-op; session already down");
                inner.snapshot_locked(&core)
            }
            ConnectionState::Disconnecting => inner.snapshot_locked(&core),
            ConnectionState::AwaitingPermission | ConnectionState::Connecting => {
                // The attempt task is never aborted: it may be suspended
                // inside TunnelDriver::start, and dropping that future
                // could leak a tunnel the driver already brought up. The
                // epoch bump makes its completion stale instead, and the
                // attempt tears a late-started tunnel down itself.
                core.epoch += 1;
                inner.permission.cancel_pending();
                core.state = ConnectionState::Disconnected;
                core.connected_at = None;
                core.active_node = None;
                info!("connect attempt cancelled");
                inner.publish_locked(&mut core)
            }
            ConnectionState::Connected => {
                core.epoch += 1;
                if let Some(pump) = core.pump.take() {
                    pump.abort();
                }
                let handle = core.handle.take();
                core.state = ConnectionState::Disconnecting;
                core.connected_at = None;
                info!("disconnecting");
                let snap = inner.publish_locked(&mut core);
                drop(core);

                let inner = self.inner.clone();
                tokio::spawn(async move {
                    if let Some(handle) = handle {
                        inner.tunnel.stop(handle).await;
                    }
                    let mut core = inner.core.lock().unwrap();
                    if core.state == ConnectionState::Disconnecting {
                        core.state = ConnectionState::Disconnected;
                        core.active_node = None;
                        info!("tunnel stopped");
                        inner.publish_locked(&mut core);
                    }
                });
                snap
            }
        }
    }

    /// Replace the subscription from `url`.
    ///
    /// Fails synchronously on an empty or unparseable URL. Otherwise the
    /// fetch runs in the background; on success the node list and account
    /// info are replaced wholesale, on failure existing data stays
    /// untouched and only `last_error` changes. Never touches the
    /// connection state.
    pub fn refresh_subscription(&self, url: &str) -> Result<SessionSnapshot, SessionError> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(SessionError::InvalidInput(
                "subscription url is empty".to_string(),
            ));
        }
        let parsed =
            Url::parse(trimmed).map_err(|e| SessionError::InvalidInput(e.to_string()))?;

        let (snap, round) = {
            let mut core = self.inner.core.lock().unwrap();
            core.refresh_epoch += 1;
            (self.inner.snapshot_locked(&core), core.refresh_epoch)
        };
        tokio::spawn(do_refresh(self.inner.clone(), parsed, round));
        Ok(snap)
    }

    /// Select a node from the current list.
    ///
    /// Never reconnects by itself; when the session is connected to a
    /// different node, the mismatch shows up as
    /// [`SessionSnapshot::selection_in_sync`] returning false.
    pub fn select_node(&self, id: &NodeId) -> Result<SessionSnapshot, SessionError> {
        let inner = &self.inner;
        let mut core = inner.core.lock().unwrap();

        if !core.subscription.select(id) {
            return Err(SessionError::NotFound(format!(
                "node {id} is not in the subscription"
            )));
        }
        if core.state == ConnectionState::Connected && core.active_node.as_ref() != Some(id) {
            debug!(%id, "selection differs from active tunnel; reconnect needed to apply");
        }
        Ok(inner.publish_locked(&mut core))
    }

    /// Fold a traffic sample into the session counters.
    ///
    /// Called by the tunnel boundary. Samples arriving outside Connected
    /// are dropped, not errored.
    pub fn ingest_traffic_sample(&self, sample: TrafficSample) {
        self.inner.ingest_sample(sample, None);
    }

    /// Subscribe to session snapshots.
    ///
    /// The observer yields the current snapshot immediately, then every
    /// subsequent publication in order.
    pub fn observe(&self) -> Observer {
        let core = self.inner.core.lock().unwrap();
        Observer {
            pending: Some(self.inner.snapshot_locked(&core)),
            rx: self.inner.tx.subscribe(),
        }
    }

    /// Current snapshot, on demand.
    pub fn snapshot(&self) -> SessionSnapshot {
        let core = self.inner.core.lock().unwrap();
        self.inner.snapshot_locked(&core)
    }

    /// Is the tunnel currently up?
    pub fn is_connected(&self) -> bool {
        self.inner.core.lock().unwrap().state.is_connected()
    }

    /// Tear down: cancel any pending permission round, stop the tunnel,
    /// stop background refresh. The coordinator stays usable afterwards.
    pub fn shutdown(&self) {
        info!("session coordinator shutting down");
        if let Some(task) = self.inner.core.lock().unwrap().auto_refresh.take() {
            task.abort();
        }
        self.inner.permission.cancel_pending();
        self.disconnect();
    }
}

/// Build the tunnel config from the current node selection.
fn tunnel_config(core: &CoreState) -> (TunnelConfig, Option<NodeId>) {
    match core
        .subscription
        .selected()
        .and_then(|id| core.subscription.node(id))
    {
        Some(node) => (
            TunnelConfig {
                node_id: Some(node.id.as_str().to_string()),
                node_name: Some(node.display_name.clone()),
                endpoint: Some(node.metadata.endpoint()),
            },
            Some(node.id.clone()),
        ),
        None => (TunnelConfig::default(), None),
    }
}

/// One connect attempt: permission phase (unless already granted), then
/// tunnel start. Re-checks the epoch after every await.
async fn run_attempt(inner: Arc<Inner>, epoch: u64, granted: bool) {
    if !granted {
        let decision = inner.permission.request().await;
        let mut core = inner.core.lock().unwrap();
        if core.epoch != epoch {
            debug!(epoch, "stale permission result discarded");
            return;
        }
        match decision {
            PermissionDecision::Granted => {
                core.state = ConnectionState::Connecting;
                inner.publish_locked(&mut core);
            }
            PermissionDecision::Denied => {
                inner.fail_connection_locked(&mut core, "permission denied".to_string());
                return;
            }
            // The cancelling disconnect already reset the state.
            PermissionDecision::Cancelled => return,
        }
    }

    let (config, node_id) = {
        let core = inner.core.lock().unwrap();
        if core.epoch != epoch {
            return;
        }
        tunnel_config(&core)
    };

    match inner.tunnel.start(config).await {
        Ok(StartedTunnel { handle, samples }) => {
            let mut core = inner.core.lock().unwrap();
            if core.epoch != epoch {
                // Raced with a cancel; tear the fresh tunnel back down.
                debug!(epoch, "stale tunnel start discarded");
                let tunnel = inner.tunnel.clone();
                tokio::spawn(async move { tunnel.stop(handle).await });
                return;
            }
            inner.traffic.reset();
            core.state = ConnectionState::Connected;
            core.connected_at = Some(Instant::now());
            core.active_node = node_id;
            core.handle = Some(handle);
            core.last_traffic_publish = None;
            core.clear_error(ErrorCategory::Connection);
            core.pump = Some(tokio::spawn(run_pump(inner.clone(), epoch, samples)));
            info!(node = ?core.active_node, "tunnel established");
            inner.publish_locked(&mut core);
        }
        Err(e) => {
            let mut core = inner.core.lock().unwrap();
            if core.epoch != epoch {
                return;
            }
            inner.fail_connection_locked(&mut core, format!("tunnel start failed: {e}"));
        }
    }
}

/// Forwards driver traffic samples into the counters until the session
/// moves on. The stream closing while the session is still current means
/// the tunnel died underneath us.
async fn run_pump(inner: Arc<Inner>, epoch: u64, mut samples: mpsc::Receiver<TrafficSample>) {
    while let Some(sample) = samples.recv().await {
        if !inner.ingest_sample(sample, Some(epoch)) {
            return;
        }
    }

    let mut core = inner.core.lock().unwrap();
    if core.epoch != epoch || core.state != ConnectionState::Connected {
        return;
    }
    core.handle = None; // the tunnel is already gone
    core.pump = None;
    inner.fail_connection_locked(&mut core, "tunnel stopped unexpectedly".to_string());
}

/// One subscription refresh round.
///
/// `round` orders concurrent refreshes: a result arriving after a newer
/// round was submitted is discarded, so a slow old fetch can never
/// overwrite fresher data or resurrect a cleared error.
async fn do_refresh(inner: Arc<Inner>, url: Url, round: u64) {
    debug!(%url, round, "refreshing subscription");
    match inner.fetcher.fetch(&url).await {
        Ok(payload) => {
            let mut core = inner.core.lock().unwrap();
            if core.refresh_epoch != round {
                debug!(round, "stale refresh result discarded");
                return;
            }
            let nodes = payload.nodes.len();
            core.subscription.apply(url, payload);
            core.clear_error(ErrorCategory::Subscription);
            inner.publish_locked(&mut core);
            info!(nodes, "subscription refreshed");
        }
        Err(e) => {
            let err = SessionError::from(e);
            let mut core = inner.core.lock().unwrap();
            if core.refresh_epoch != round {
                debug!(round, "stale refresh failure discarded");
                return;
            }
            warn!(%err, "subscription refresh failed; keeping previous data");
            core.last_error = Some((ErrorCategory::Subscription, err.to_string()));
            inner.publish_locked(&mut core);
        }
    }
}

/// Periodic subscription refresh against the last applied URL.
async fn run_auto_refresh(inner: Arc<Inner>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await; // the first tick fires immediately
    loop {
        interval.tick().await;
        let (url, round) = {
            let mut core = inner.core.lock().unwrap();
            match core.subscription.url().cloned() {
                Some(url) => {
                    core.refresh_epoch += 1;
                    (Some(url), core.refresh_epoch)
                }
                None => (None, 0),
            }
        };
        match url {
            Some(url) => do_refresh(inner.clone(), url, round).await,
            None => debug!("auto refresh skipped; no subscription url yet"),
        }
    }
}

/// Live snapshot stream for one subscriber.
pub struct Observer {
    pending: Option<SessionSnapshot>,
    rx: broadcast::Receiver<SessionSnapshot>,
}

impl Observer {
    /// Next snapshot, in publication order.
    ///
    /// Returns `None` once the coordinator is gone. A subscriber that
    /// falls more than the channel capacity behind skips ahead to the
    /// oldest retained snapshot.
    pub async fn next(&mut self) -> Option<SessionSnapshot> {
        if let Some(snap) = self.pending.take() {
            return Some(snap);
        }
        loop {
            match self.rx.recv().await {
                Ok(snap) => return Some(snap),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "observer lagged; skipping ahead");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use veil_subscription::{FetchError, Node, NodeMetadata, SubscriptionPayload, UserInfo};
    use veil_tunnel::StartError;

    /// Permission backend resolving with decisions fed in by the test.
    struct ScriptedPermission {
        decisions: tokio::sync::Mutex<mpsc::UnboundedReceiver<PermissionDecision>>,
        prompts: AtomicUsize,
    }

    impl ScriptedPermission {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<PermissionDecision>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    decisions: tokio::sync::Mutex::new(rx),
                    prompts: AtomicUsize::new(0),
                }),
                tx,
            )
        }
    }

    #[async_trait]
    impl PermissionBackend for ScriptedPermission {
        async fn request(&self) -> PermissionDecision {
            self.prompts.fetch_add(1, Ordering::Relaxed);
            self.decisions
                .lock()
                .await
                .recv()
                .await
                .unwrap_or(PermissionDecision::Cancelled)
        }
    }

    /// Driver whose start outcomes are fed in by the test.
    struct ManualDriver {
        outcomes: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<(), StartError>>>,
        starts: AtomicUsize,
        stops: AtomicUsize,
        sample_tx: Mutex<Option<mpsc::Sender<TrafficSample>>>,
    }

    impl ManualDriver {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<Result<(), StartError>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    outcomes: tokio::sync::Mutex::new(rx),
                    starts: AtomicUsize::new(0),
                    stops: AtomicUsize::new(0),
                    sample_tx: Mutex::new(None),
                }),
                tx,
            )
        }

        async fn send_sample(&self, sample: TrafficSample) {
            let tx = self.sample_tx.lock().unwrap().clone();
            tx.expect("no running tunnel").send(sample).await.unwrap();
        }

        /// Simulate the tunnel dying: closes the sample stream.
        fn kill_tunnel(&self) {
            *self.sample_tx.lock().unwrap() = None;
        }
    }

    #[async_trait]
    impl TunnelDriver for ManualDriver {
        async fn start(&self, _config: TunnelConfig) -> Result<StartedTunnel, StartError> {
            let id = self.starts.fetch_add(1, Ordering::Relaxed) as u64 + 1;
            self.outcomes
                .lock()
                .await
                .recv()
                .await
                .unwrap_or(Err(StartError::Failed("unscripted start".into())))?;

            let (tx, rx) = mpsc::channel(16);
            *self.sample_tx.lock().unwrap() = Some(tx);
            Ok(StartedTunnel {
                handle: TunnelHandle::new(id),
                samples: rx,
            })
        }

        async fn stop(&self, _handle: TunnelHandle) {
            self.stops.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Fetcher returning queued results.
    struct ScriptedFetcher {
        results: Mutex<VecDeque<Result<SubscriptionPayload, FetchError>>>,
        fetches: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(VecDeque::new()),
                fetches: AtomicUsize::new(0),
            })
        }

        fn push(&self, result: Result<SubscriptionPayload, FetchError>) {
            self.results.lock().unwrap().push_back(result);
        }
    }

    #[async_trait]
    impl SubscriptionFetcher for ScriptedFetcher {
        async fn fetch(&self, _url: &Url) -> Result<SubscriptionPayload, FetchError> {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(FetchError::Network("unscripted fetch".into())))
        }
    }

    /// Fetcher whose in-flight calls the test resolves explicitly, in any
    /// order.
    #[derive(Default)]
    struct GatedFetcher {
        pending: Mutex<Vec<tokio::sync::oneshot::Sender<Result<SubscriptionPayload, FetchError>>>>,
    }

    impl GatedFetcher {
        fn pending_count(&self) -> usize {
            self.pending.lock().unwrap().len()
        }

        /// Resolve the in-flight call at `index` (submission order).
        fn resolve(&self, index: usize, result: Result<SubscriptionPayload, FetchError>) {
            let tx = self.pending.lock().unwrap().remove(index);
            let _ = tx.send(result);
        }
    }

    #[async_trait]
    impl SubscriptionFetcher for GatedFetcher {
        async fn fetch(&self, _url: &Url) -> Result<SubscriptionPayload, FetchError> {
            let (tx, rx) = tokio::sync::oneshot::channel();
            self.pending.lock().unwrap().push(tx);
            rx.await
                .unwrap_or(Err(FetchError::Network("fetch dropped".into())))
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            traffic_publish_interval: Duration::ZERO,
            auto_refresh: None,
            broadcast_capacity: 64,
        }
    }

    fn node(id: &str) -> Node {
        Node {
            id: NodeId::from(id),
            display_name: format!("node {id}"),
            metadata: NodeMetadata {
                protocol: "vmess".to_string(),
                address: format!("{id}.example.com"),
                port: 443,
                location: None,
            },
        }
    }

    fn payload(ids: &[&str]) -> SubscriptionPayload {
        SubscriptionPayload {
            nodes: ids.iter().map(|id| node(id)).collect(),
            user: UserInfo {
                email: "user@example.com".to_string(),
                used_bytes: 42,
                quota_bytes: 1000,
                expires_at: None,
            },
        }
    }

    async fn next_snap(obs: &mut Observer) -> SessionSnapshot {
        tokio::time::timeout(Duration::from_secs(2), obs.next())
            .await
            .expect("timed out waiting for a snapshot")
            .expect("snapshot stream closed")
    }

    async fn wait_for(what: &str, predicate: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !predicate() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn wait_until(
        coord: &SessionCoordinator,
        what: &str,
        predicate: impl Fn(&SessionSnapshot) -> bool,
    ) {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if predicate(&coord.snapshot()) {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {what}; last snapshot: {:?}",
                coord.snapshot()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    struct Rig {
        coord: SessionCoordinator,
        driver: Arc<ManualDriver>,
        driver_tx: mpsc::UnboundedSender<Result<(), StartError>>,
        permission: Arc<ScriptedPermission>,
        permission_tx: mpsc::UnboundedSender<PermissionDecision>,
        fetcher: Arc<ScriptedFetcher>,
    }

    fn rig_with_config(config: SessionConfig) -> Rig {
        let (driver, driver_tx) = ManualDriver::new();
        let (permission, permission_tx) = ScriptedPermission::new();
        let fetcher = ScriptedFetcher::new();
        let coord = SessionCoordinator::new(
            driver.clone(),
            permission.clone(),
            fetcher.clone(),
            config,
        );
        Rig {
            coord,
            driver,
            driver_tx,
            permission,
            permission_tx,
            fetcher,
        }
    }

    fn rig() -> Rig {
        rig_with_config(test_config())
    }

    impl Rig {
        /// Drive a full connect to Connected.
        async fn connect_fully(&self) {
            self.permission_tx.send(PermissionDecision::Granted).ok();
            self.driver_tx.send(Ok(())).unwrap();
            self.coord.connect();
            wait_until(&self.coord, "connected", |s| s.state.is_connected()).await;
        }
    }

    #[tokio::test]
    async fn test_connect_sequence_is_fully_observable() {
        let rig = rig();
        let mut obs = rig.coord.observe();

        let initial = next_snap(&mut obs).await;
        assert_eq!(initial.state, ConnectionState::Disconnected);

        rig.permission_tx.send(PermissionDecision::Granted).unwrap();
        rig.driver_tx.send(Ok(())).unwrap();
        rig.coord.connect();

        let s1 = next_snap(&mut obs).await;
        let s2 = next_snap(&mut obs).await;
        let s3 = next_snap(&mut obs).await;
        assert_eq!(s1.state, ConnectionState::AwaitingPermission);
        assert_eq!(s2.state, ConnectionState::Connecting);
        assert_eq!(s3.state, ConnectionState::Connected);

        // No skipped or reordered publications.
        assert!(initial.revision < s1.revision);
        assert_eq!(s2.revision, s1.revision + 1);
        assert_eq!(s3.revision, s2.revision + 1);

        assert!(s3.connected_at.is_some());
        assert!(s3.last_error.is_none());
        assert_eq!(rig.driver.starts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_connect_skips_permission_once_granted() {
        let rig = rig();
        rig.connect_fully().await;
        rig.coord.disconnect();
        wait_until(&rig.coord, "disconnected", |s| {
            s.state == ConnectionState::Disconnected
        })
        .await;

        let mut obs = rig.coord.observe();
        next_snap(&mut obs).await; // current: Disconnected

        rig.driver_tx.send(Ok(())).unwrap();
        rig.coord.connect();

        // Straight to Connecting; the grant latched.
        let s = next_snap(&mut obs).await;
        assert_eq!(s.state, ConnectionState::Connecting);
        assert_eq!(rig.permission.prompts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_permission_denied_surfaces_error_then_disconnects() {
        let rig = rig();
        let mut obs = rig.coord.observe();
        next_snap(&mut obs).await;

        rig.permission_tx.send(PermissionDecision::Denied).unwrap();
        rig.coord.connect();

        assert_eq!(
            next_snap(&mut obs).await.state,
            ConnectionState::AwaitingPermission
        );
        assert_eq!(
            next_snap(&mut obs).await.state,
            ConnectionState::Error("permission denied".to_string())
        );
        let settled = next_snap(&mut obs).await;
        assert_eq!(settled.state, ConnectionState::Disconnected);
        assert_eq!(settled.last_error.as_deref(), Some("permission denied"));

        // Never reached the tunnel.
        assert_eq!(rig.driver.starts.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_tunnel_start_failure_surfaces_error_then_disconnects() {
        let rig = rig();
        let mut obs = rig.coord.observe();
        next_snap(&mut obs).await;

        rig.permission_tx.send(PermissionDecision::Granted).unwrap();
        rig.driver_tx
            .send(Err(StartError::Failed("handshake refused".into())))
            .unwrap();
        rig.coord.connect();

        assert_eq!(
            next_snap(&mut obs).await.state,
            ConnectionState::AwaitingPermission
        );
        assert_eq!(next_snap(&mut obs).await.state, ConnectionState::Connecting);

        let errored = next_snap(&mut obs).await;
        assert!(matches!(errored.state, ConnectionState::Error(_)));
        let settled = next_snap(&mut obs).await;
        assert_eq!(settled.state, ConnectionState::Disconnected);
        assert!(
            settled
                .last_error
                .as_deref()
                .unwrap()
                .contains("tunnel start failed")
        );
    }

    #[tokio::test]
    async fn test_concurrent_connects_coalesce() {
        let rig = rig();

        // No permission decision yet: the attempt parks in AwaitingPermission.
        let first = rig.coord.connect();
        assert_eq!(first.state, ConnectionState::AwaitingPermission);

        let second = rig.coord.connect();
        assert_eq!(second.state, ConnectionState::AwaitingPermission);
        assert_eq!(second.revision, first.revision);

        rig.permission_tx.send(PermissionDecision::Granted).unwrap();
        rig.driver_tx.send(Ok(())).unwrap();
        wait_until(&rig.coord, "connected", |s| s.state.is_connected()).await;

        assert_eq!(rig.driver.starts.load(Ordering::Relaxed), 1);
        assert_eq!(rig.permission.prompts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_from_disconnected() {
        let rig = rig();

        let s1 = rig.coord.disconnect();
        let s2 = rig.coord.disconnect();

        assert_eq!(s1.state, ConnectionState::Disconnected);
        assert_eq!(s2.state, ConnectionState::Disconnected);
        // No publication, no tunnel stop.
        assert_eq!(s1.revision, s2.revision);
        assert_eq!(rig.driver.stops.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_permission_discards_stale_grant() {
        let rig = rig();

        rig.coord.connect();
        wait_until(&rig.coord, "awaiting permission", |s| {
            s.state == ConnectionState::AwaitingPermission
        })
        .await;

        let cancelled = rig.coord.disconnect();
        assert_eq!(cancelled.state, ConnectionState::Disconnected);

        // A late grant for the cancelled attempt must not connect anything.
        rig.permission_tx.send(PermissionDecision::Granted).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rig.coord.snapshot().state, ConnectionState::Disconnected);
        assert_eq!(rig.driver.starts.load(Ordering::Relaxed), 0);

        // The coordinator stays usable: a fresh attempt can still succeed.
        rig.driver_tx.send(Ok(())).unwrap();
        rig.coord.connect();
        wait_until(&rig.coord, "connected", |s| s.state.is_connected()).await;
    }

    #[tokio::test]
    async fn test_tunnel_started_after_cancel_is_torn_down() {
        let rig = rig();
        rig.permission_tx.send(PermissionDecision::Granted).unwrap();

        // No start outcome yet: the attempt parks inside the driver's
        // start call.
        rig.coord.connect();
        wait_until(&rig.coord, "connecting", |s| {
            s.state == ConnectionState::Connecting
        })
        .await;

        let cancelled = rig.coord.disconnect();
        assert_eq!(cancelled.state, ConnectionState::Disconnected);

        // The driver finishes bringing the tunnel up only now, for the
        // cancelled attempt. The stale start must be stopped, not leaked.
        rig.driver_tx.send(Ok(())).unwrap();
        wait_for("stale tunnel stop", || {
            rig.driver.stops.load(Ordering::Relaxed) == 1
        })
        .await;

        assert_eq!(rig.driver.starts.load(Ordering::Relaxed), 1);
        assert_eq!(rig.coord.snapshot().state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_from_connected_stops_tunnel() {
        let rig = rig();
        rig.connect_fully().await;

        let mut obs = rig.coord.observe();
        next_snap(&mut obs).await; // current: Connected

        let ack = rig.coord.disconnect();
        assert_eq!(ack.state, ConnectionState::Disconnecting);

        assert_eq!(
            next_snap(&mut obs).await.state,
            ConnectionState::Disconnecting
        );
        assert_eq!(
            next_snap(&mut obs).await.state,
            ConnectionState::Disconnected
        );
        assert_eq!(rig.driver.stops.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_refresh_rejects_bad_input() {
        let rig = rig();

        let empty = rig.coord.refresh_subscription("   ").unwrap_err();
        assert!(matches!(empty, SessionError::InvalidInput(_)));

        let garbage = rig.coord.refresh_subscription("not a url").unwrap_err();
        assert!(matches!(garbage, SessionError::InvalidInput(_)));

        let snap = rig.coord.snapshot();
        assert!(snap.nodes.is_empty());
        assert!(snap.user.is_none());
        assert_eq!(rig.fetcher.fetches.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_refresh_failure_preserves_previous_data() {
        let rig = rig();

        rig.fetcher.push(Ok(payload(&["a", "b"])));
        rig.coord
            .refresh_subscription("https://panel.example.com/sub")
            .unwrap();
        wait_until(&rig.coord, "first refresh", |s| s.nodes.len() == 2).await;

        rig.fetcher.push(Err(FetchError::Network("refused".into())));
        rig.coord
            .refresh_subscription("https://panel.example.com/sub")
            .unwrap();
        wait_until(&rig.coord, "failed refresh", |s| s.last_error.is_some()).await;

        let snap = rig.coord.snapshot();
        assert_eq!(snap.nodes.len(), 2);
        assert!(snap.user.is_some());
        assert!(snap.last_error.as_deref().unwrap().contains("network error"));
        assert_eq!(snap.state, ConnectionState::Disconnected);

        // A later success replaces data and clears the error.
        rig.fetcher.push(Ok(payload(&["c"])));
        rig.coord
            .refresh_subscription("https://panel.example.com/sub")
            .unwrap();
        wait_until(&rig.coord, "recovery refresh", |s| s.nodes.len() == 1).await;
        assert!(rig.coord.snapshot().last_error.is_none());
    }

    #[tokio::test]
    async fn test_stale_refresh_result_is_discarded() {
        let (driver, _driver_tx) = ManualDriver::new();
        let (permission, _permission_tx) = ScriptedPermission::new();
        let fetcher = Arc::new(GatedFetcher::default());
        let coord =
            SessionCoordinator::new(driver, permission, fetcher.clone(), test_config());
        let url = "https://panel.example.com/sub";

        // Two refreshes in flight at once.
        coord.refresh_subscription(url).unwrap();
        wait_for("first fetch in flight", || fetcher.pending_count() == 1).await;
        coord.refresh_subscription(url).unwrap();
        wait_for("second fetch in flight", || fetcher.pending_count() == 2).await;

        // The newer round lands first.
        fetcher.resolve(1, Ok(payload(&["new"])));
        wait_until(&coord, "newer payload applied", |s| {
            s.nodes.first().map(|n| n.id.as_str()) == Some("new")
        })
        .await;

        // The older result arrives late and must not overwrite it.
        fetcher.resolve(0, Ok(payload(&["old"])));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snap = coord.snapshot();
        assert_eq!(snap.nodes.len(), 1);
        assert_eq!(snap.nodes[0].id.as_str(), "new");

        // Same for failures: a stale error cannot shadow a newer success.
        coord.refresh_subscription(url).unwrap();
        wait_for("third fetch in flight", || fetcher.pending_count() == 1).await;
        coord.refresh_subscription(url).unwrap();
        wait_for("fourth fetch in flight", || fetcher.pending_count() == 2).await;

        fetcher.resolve(1, Ok(payload(&["newer"])));
        wait_until(&coord, "fourth payload applied", |s| {
            s.nodes.first().map(|n| n.id.as_str()) == Some("newer")
        })
        .await;
        fetcher.resolve(0, Err(FetchError::Network("slow and stale".into())));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(coord.snapshot().last_error.is_none());
    }

    #[tokio::test]
    async fn test_select_node_unknown_id_fails() {
        let rig = rig();
        rig.fetcher.push(Ok(payload(&["a", "b"])));
        rig.coord
            .refresh_subscription("https://panel.example.com/sub")
            .unwrap();
        wait_until(&rig.coord, "refresh", |s| s.nodes.len() == 2).await;

        let err = rig.coord.select_node(&NodeId::from("zz")).unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
        assert!(rig.coord.snapshot().selected_node_id.is_none());

        let snap = rig.coord.select_node(&NodeId::from("a")).unwrap();
        assert_eq!(snap.selected_node_id, Some(NodeId::from("a")));
    }

    #[tokio::test]
    async fn test_selection_change_while_connected_flags_reconnect() {
        let rig = rig();
        rig.fetcher.push(Ok(payload(&["a", "b"])));
        rig.coord
            .refresh_subscription("https://panel.example.com/sub")
            .unwrap();
        wait_until(&rig.coord, "refresh", |s| s.nodes.len() == 2).await;
        rig.coord.select_node(&NodeId::from("a")).unwrap();

        rig.connect_fully().await;
        let snap = rig.coord.snapshot();
        assert_eq!(snap.active_node_id, Some(NodeId::from("a")));
        assert!(snap.selection_in_sync());

        // Selecting another node signals, but does not execute, a reconnect.
        let snap = rig.coord.select_node(&NodeId::from("b")).unwrap();
        assert!(!snap.selection_in_sync());
        assert_eq!(snap.state, ConnectionState::Connected);
        assert_eq!(snap.active_node_id, Some(NodeId::from("a")));
    }

    #[tokio::test]
    async fn test_samples_outside_connected_are_dropped() {
        let rig = rig();

        rig.coord.ingest_traffic_sample(TrafficSample::new(10, 20));

        let snap = rig.coord.snapshot();
        assert_eq!(snap.traffic.uploaded_bytes, 0);
        assert_eq!(snap.traffic.downloaded_bytes, 0);
    }

    #[tokio::test]
    async fn test_traffic_accumulates_and_resets_per_session() {
        let rig = rig();
        rig.connect_fully().await;

        rig.coord.ingest_traffic_sample(TrafficSample::new(100, 200));
        rig.coord.ingest_traffic_sample(TrafficSample::new(1, 2));

        let snap = rig.coord.snapshot();
        assert_eq!(snap.traffic.uploaded_bytes, 101);
        assert_eq!(snap.traffic.downloaded_bytes, 202);

        rig.coord.disconnect();
        wait_until(&rig.coord, "disconnected", |s| {
            s.state == ConnectionState::Disconnected
        })
        .await;

        // New session starts from zero.
        rig.driver_tx.send(Ok(())).unwrap();
        rig.coord.connect();
        wait_until(&rig.coord, "reconnected", |s| s.state.is_connected()).await;
        assert_eq!(rig.coord.snapshot().traffic.total_bytes(), 0);
    }

    #[tokio::test]
    async fn test_driver_samples_flow_through_pump() {
        let rig = rig();
        rig.connect_fully().await;

        rig.driver.send_sample(TrafficSample::new(5, 7)).await;

        wait_until(&rig.coord, "sample folded in", |s| {
            s.traffic.uploaded_bytes == 5 && s.traffic.downloaded_bytes == 7
        })
        .await;
    }

    #[tokio::test]
    async fn test_traffic_publications_coalesce_within_interval() {
        let rig = rig_with_config(SessionConfig {
            traffic_publish_interval: Duration::from_secs(5),
            ..test_config()
        });
        rig.connect_fully().await;

        let mut obs = rig.coord.observe();
        next_snap(&mut obs).await; // current: Connected

        // The first sample after connect is published immediately.
        rig.coord.ingest_traffic_sample(TrafficSample::new(1, 1));
        let first = next_snap(&mut obs).await;
        assert_eq!(first.traffic.uploaded_bytes, 1);

        // A second sample inside the window accumulates without a new
        // publication.
        rig.coord.ingest_traffic_sample(TrafficSample::new(2, 2));
        let snap = rig.coord.snapshot();
        assert_eq!(snap.traffic.uploaded_bytes, 3);
        assert_eq!(snap.traffic.downloaded_bytes, 3);
        assert_eq!(snap.revision, first.revision);

        // A state change inside the window is still published at once.
        rig.coord.disconnect();
        let next = next_snap(&mut obs).await;
        assert_eq!(next.state, ConnectionState::Disconnecting);
        assert_eq!(next.traffic.uploaded_bytes, 3);
    }

    #[tokio::test]
    async fn test_unexpected_tunnel_stop_surfaces_error() {
        let rig = rig();
        rig.connect_fully().await;

        let mut obs = rig.coord.observe();
        next_snap(&mut obs).await; // current: Connected

        rig.driver.kill_tunnel();

        let errored = next_snap(&mut obs).await;
        assert!(matches!(errored.state, ConnectionState::Error(_)));
        let settled = next_snap(&mut obs).await;
        assert_eq!(settled.state, ConnectionState::Disconnected);
        assert!(
            settled
                .last_error
                .as_deref()
                .unwrap()
                .contains("stopped unexpectedly")
        );
    }

    #[tokio::test]
    async fn test_auto_refresh_reuses_last_url() {
        let rig = rig_with_config(SessionConfig {
            auto_refresh: Some(Duration::from_millis(30)),
            ..test_config()
        });

        rig.fetcher.push(Ok(payload(&["a"])));
        rig.fetcher.push(Ok(payload(&["b"])));
        rig.coord
            .refresh_subscription("https://panel.example.com/sub")
            .unwrap();

        wait_until(&rig.coord, "auto refresh applied", |s| {
            s.nodes.first().map(|n| n.id.as_str()) == Some("b")
        })
        .await;
        assert!(rig.fetcher.fetches.load(Ordering::Relaxed) >= 2);

        rig.coord.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_permission() {
        let rig = rig();

        rig.coord.connect();
        wait_until(&rig.coord, "awaiting permission", |s| {
            s.state == ConnectionState::AwaitingPermission
        })
        .await;

        rig.coord.shutdown();
        wait_until(&rig.coord, "disconnected", |s| {
            s.state == ConnectionState::Disconnected
        })
        .await;
        assert_eq!(rig.driver.starts.load(Ordering::Relaxed), 0);
    }
}
