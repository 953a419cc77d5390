//! The session relay: one live store subscription, a dedup filter over
//! request ids, and fire-and-forget cleanup of consumed entries.

use crate::command::HostCommand;
use patchlink_core::{
    DeviceSink, ProbeRecord, RequestId, RequestSnapshot, RequestStore, SessionId, StoreError,
    StoreEvent, Subscription,
};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Callback invoked with a description of a background failure (emission,
/// cleanup, probe) so hosts can surface it. The relay itself never fails.
pub type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Relays device-load requests from a remote store to a host output sink.
///
/// All mutable state lives on the task driving [`SessionRelay::run`], so
/// command handling and snapshot processing never overlap and the
/// processed-id set needs no locking.
pub struct SessionRelay {
    session: SessionId,
    store: Arc<dyn RequestStore>,
    sink: Arc<dyn DeviceSink>,
    processed: HashSet<RequestId>,
    subscription: Option<Subscription>,
    listening: bool,
    error_callback: Option<ErrorCallback>,
}

impl fmt::Debug for SessionRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRelay")
            .field("session", &self.session)
            .field("store", &self.store.id())
            .field("sink", &self.sink.id())
            .field("processed", &self.processed.len())
            .field("listening", &self.listening)
            .field("connected", &self.subscription.is_some())
            .finish()
    }
}

enum Turn {
    Command(Option<HostCommand>),
    Event(Option<StoreEvent>),
}

impl SessionRelay {
    pub fn new(session: SessionId, store: Arc<dyn RequestStore>, sink: Arc<dyn DeviceSink>) -> Self {
        Self {
            session,
            store,
            sink,
            processed: HashSet::new(),
            subscription: None,
            listening: false,
            error_callback: None,
        }
    }

    /// Set a callback for background failure notifications.
    pub fn set_error_callback<F>(&mut self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.error_callback = Some(Arc::new(callback));
    }

    /// Attach the realtime listener for the current session. No-op while
    /// already listening.
    pub async fn start(&mut self) {
        if self.listening {
            return;
        }
        self.listening = true;
        tracing::info!(session = %self.session, "starting realtime listener for device requests");

        match self.store.subscribe(&self.session).await {
            Ok(subscription) => {
                self.subscription = Some(subscription);
                tracing::info!(session = %self.session, "listener attached");
            }
            Err(error) => {
                // Still marked listening; an explicit stop/start cycle is
                // the only recovery path.
                tracing::error!(session = %self.session, error = %error, "failed to attach listener");
                self.report_error(&format!("failed to attach listener: {error}"));
            }
        }
    }

    /// Detach the listener and release its handle. No-op while stopped.
    pub fn stop(&mut self) {
        if !self.listening {
            return;
        }
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
        self.listening = false;
        tracing::info!("stopped listening for device requests");
    }

    /// Replace the session id. Tears down and re-establishes the listener
    /// when one is attached; always clears the processed-request cache.
    pub async fn set_session(&mut self, session: SessionId) {
        let was_listening = self.listening;
        if was_listening {
            self.stop();
        }

        self.session = session;
        self.processed.clear();
        tracing::info!(session = %self.session, "session id updated");

        if was_listening {
            tracing::info!("restarting listener with new session id");
            self.start().await;
        }
    }

    /// Empty the processed-request cache without touching the listener.
    pub fn clear_cache(&mut self) {
        self.processed.clear();
        tracing::info!("cleared processed request cache");
    }

    /// Point-in-time view of the relay. Pure read, no side effects.
    pub fn status(&self) -> RelayStatus {
        RelayStatus {
            session: self.session.clone(),
            listening: self.listening,
            connected: self.subscription.is_some(),
            processed: self.processed.len(),
        }
    }

    /// Write a timestamped probe to the store's diagnostic path; the
    /// outcome arrives asynchronously on the logging channel.
    pub fn test_connection(&self) {
        let store = Arc::clone(&self.store);
        let callback = self.error_callback.clone();
        tracing::info!(store = store.id(), "testing store connection");
        tokio::spawn(async move {
            match store.write_probe(&ProbeRecord::now()).await {
                Ok(()) => tracing::info!("store connection test succeeded"),
                Err(error) => {
                    tracing::error!(error = %error, "store connection test failed");
                    if let Some(callback) = callback {
                        callback(&format!("connection test failed: {error}"));
                    }
                }
            }
        });
    }

    pub async fn handle_command(&mut self, command: HostCommand) {
        match command {
            HostCommand::SetSession(session) => self.set_session(session).await,
            HostCommand::Start => self.start().await,
            HostCommand::Stop => self.stop(),
            HostCommand::Test => self.test_connection(),
            HostCommand::Check => {
                tracing::info!("forced checks are unnecessary, the listener is realtime once started");
            }
            HostCommand::Clear => self.clear_cache(),
            HostCommand::Status => self.log_status(),
        }
    }

    /// Drive the relay until the host command channel closes.
    pub async fn run(mut self, mut commands: mpsc::Receiver<HostCommand>) {
        loop {
            match self.next_turn(&mut commands).await {
                Turn::Command(Some(command)) => self.handle_command(command).await,
                Turn::Command(None) => {
                    tracing::info!("host command channel closed, shutting down relay");
                    self.stop();
                    return;
                }
                Turn::Event(Some(StoreEvent::Snapshot(snapshot))) => {
                    self.apply_snapshot(snapshot)
                }
                Turn::Event(Some(StoreEvent::Lost(error))) => self.handle_lost(error),
                Turn::Event(None) => self.handle_stream_end(),
            }
        }
    }

    async fn next_turn(&mut self, commands: &mut mpsc::Receiver<HostCommand>) -> Turn {
        match self.subscription.as_mut() {
            Some(subscription) => tokio::select! {
                command = commands.recv() => Turn::Command(command),
                event = subscription.next_event() => Turn::Event(event),
            },
            None => Turn::Command(commands.recv().await),
        }
    }

    /// Forward every unseen, non-empty entry and schedule its remote
    /// cleanup. Empty values are skipped without being marked processed so
    /// a later populated snapshot can still deliver them.
    fn apply_snapshot(&mut self, snapshot: RequestSnapshot) {
        if snapshot.is_empty() {
            tracing::debug!("no device requests pending");
            return;
        }

        for (request, device_name) in snapshot.iter() {
            if device_name.is_empty() || self.processed.contains(request) {
                continue;
            }

            tracing::info!(request = %request, device = device_name, "loading device");
            if let Err(error) = self.sink.emit(device_name) {
                // Forwarding counts as attempted; re-emitting on the next
                // snapshot would break once-per-lifetime delivery.
                tracing::warn!(request = %request, error = %error, "device emission failed");
                self.report_error(&format!("emission failed: {error}"));
            }

            self.processed.insert(request.clone());
            self.spawn_delete(request.clone());
        }
    }

    fn spawn_delete(&self, request: RequestId) {
        let store = Arc::clone(&self.store);
        let session = self.session.clone();
        let callback = self.error_callback.clone();
        tokio::spawn(async move {
            if let Err(error) = store.delete_request(&session, &request).await {
                tracing::warn!(request = %request, error = %error, "error cleaning up request");
                if let Some(callback) = callback {
                    callback(&format!("cleanup failed for {request}: {error}"));
                }
            }
        });
    }

    fn handle_lost(&mut self, error: StoreError) {
        // The handle stays attached; nothing further arrives until an
        // explicit stop/start cycle.
        tracing::error!(error = %error, "store listener error");
        self.report_error(&format!("listener error: {error}"));
    }

    fn handle_stream_end(&mut self) {
        tracing::warn!("store event stream ended, stop and start to re-attach");
        self.report_error("event stream ended");
    }

    fn log_status(&self) {
        for line in self.status().report_lines() {
            tracing::info!("{line}");
        }
    }

    fn report_error(&self, message: &str) {
        if let Some(callback) = &self.error_callback {
            callback(message);
        }
    }
}

/// Point-in-time view of a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStatus {
    pub session: SessionId,
    pub listening: bool,
    pub connected: bool,
    pub processed: usize,
}

impl RelayStatus {
    /// Multi-line human-readable report for the logging channel.
    pub fn report_lines(&self) -> Vec<String> {
        vec![
            "relay status:".to_string(),
            format!("  session id: {}", self.session),
            format!("  listening: {}", if self.listening { "ON" } else { "OFF" }),
            format!(
                "  connection: {}",
                if self.connected { "active" } else { "inactive" }
            ),
            format!("  processed requests: {}", self.processed),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use patchlink_core::{SinkError, SinkResult, StoreResult};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Store mock that records traffic and lets tests push snapshots into
    /// the most recent subscription.
    struct MockStore {
        deletes: Mutex<Vec<(SessionId, RequestId)>>,
        probes: AtomicUsize,
        subscribes: AtomicUsize,
        fail_subscribe: AtomicBool,
        fail_delete: AtomicBool,
        events: Mutex<Option<mpsc::Sender<StoreEvent>>>,
    }

    impl MockStore {
        fn new() -> Self {
            Self {
                deletes: Mutex::new(Vec::new()),
                probes: AtomicUsize::new(0),
                subscribes: AtomicUsize::new(0),
                fail_subscribe: AtomicBool::new(false),
                fail_delete: AtomicBool::new(false),
                events: Mutex::new(None),
            }
        }

        fn deletes(&self) -> Vec<(SessionId, RequestId)> {
            self.deletes.lock().unwrap().clone()
        }

        fn subscribe_count(&self) -> usize {
            self.subscribes.load(Ordering::SeqCst)
        }

        fn push_snapshot(&self, snapshot: RequestSnapshot) {
            let guard = self.events.lock().unwrap();
            let sender = guard.as_ref().expect("no live subscription");
            sender
                .try_send(StoreEvent::Snapshot(snapshot))
                .expect("event buffer full");
        }
    }

    #[async_trait]
    impl RequestStore for MockStore {
        fn id(&self) -> &str {
            "mock"
        }

        async fn subscribe(&self, _session: &SessionId) -> StoreResult<Subscription> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            if self.fail_subscribe.load(Ordering::SeqCst) {
                return Err(StoreError::Network {
                    message: "simulated outage".into(),
                });
            }
            let (tx, rx) = Subscription::channel();
            *self.events.lock().unwrap() = Some(tx);
            let producer = tokio::spawn(std::future::pending::<()>());
            Ok(Subscription::new(rx, producer))
        }

        async fn delete_request(
            &self,
            session: &SessionId,
            request: &RequestId,
        ) -> StoreResult<()> {
            if self.fail_delete.load(Ordering::SeqCst) {
                return Err(StoreError::Network {
                    message: "simulated delete failure".into(),
                });
            }
            self.deletes
                .lock()
                .unwrap()
                .push((session.clone(), request.clone()));
            Ok(())
        }

        async fn write_probe(&self, _record: &ProbeRecord) -> StoreResult<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Sink mock that records emissions and can fail on demand.
    struct MockSink {
        emitted: Mutex<Vec<String>>,
        fail_count: AtomicUsize,
    }

    impl MockSink {
        fn new() -> Self {
            Self {
                emitted: Mutex::new(Vec::new()),
                fail_count: AtomicUsize::new(0),
            }
        }

        fn set_fail_next(&self, count: usize) {
            self.fail_count.store(count, Ordering::SeqCst);
        }

        fn emitted(&self) -> Vec<String> {
            self.emitted.lock().unwrap().clone()
        }
    }

    impl DeviceSink for MockSink {
        fn id(&self) -> &str {
            "mock"
        }

        fn emit(&self, device_name: &str) -> SinkResult<()> {
            let fail = self.fail_count.load(Ordering::SeqCst);
            if fail > 0 {
                self.fail_count.fetch_sub(1, Ordering::SeqCst);
                return Err(SinkError::Unavailable {
                    message: "simulated failure".into(),
                });
            }
            self.emitted.lock().unwrap().push(device_name.to_string());
            Ok(())
        }
    }

    fn relay_parts() -> (Arc<MockStore>, Arc<MockSink>, SessionRelay) {
        let store = Arc::new(MockStore::new());
        let sink = Arc::new(MockSink::new());
        let relay = SessionRelay::new(SessionId::new("abc"), store.clone(), sink.clone());
        (store, sink, relay)
    }

    fn snapshot(entries: &[(&str, &str)]) -> RequestSnapshot {
        entries
            .iter()
            .map(|(id, name)| (RequestId::new(*id), name.to_string()))
            .collect()
    }

    /// Let spawned fire-and-forget tasks run on the current-thread runtime.
    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn forwards_each_new_request_once() {
        let (store, sink, mut relay) = relay_parts();

        relay.apply_snapshot(snapshot(&[("req1", "Reverb"), ("req2", "Operator")]));
        relay.apply_snapshot(snapshot(&[("req1", "Reverb"), ("req2", "Operator")]));

        assert_eq!(sink.emitted(), vec!["Reverb", "Operator"]);
        wait_for(|| store.deletes().len() == 2).await;
        assert_eq!(relay.status().processed, 2);
    }

    #[tokio::test]
    async fn empty_values_are_skipped_and_retried_later() {
        let (store, sink, mut relay) = relay_parts();

        relay.apply_snapshot(snapshot(&[("req1", "Reverb"), ("req2", "")]));
        assert_eq!(sink.emitted(), vec!["Reverb"]);
        assert_eq!(relay.status().processed, 1);

        wait_for(|| store.deletes().len() == 1).await;
        assert_eq!(store.deletes()[0].1, RequestId::new("req1"));

        // the entry becomes deliverable once a later snapshot populates it
        relay.apply_snapshot(snapshot(&[("req2", "Delay")]));
        assert_eq!(sink.emitted(), vec!["Reverb", "Delay"]);
    }

    #[tokio::test]
    async fn empty_snapshot_is_a_no_op() {
        let (store, sink, mut relay) = relay_parts();

        relay.apply_snapshot(RequestSnapshot::new());

        assert!(sink.emitted().is_empty());
        assert!(store.deletes().is_empty());
        assert_eq!(relay.status().processed, 0);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (store, _sink, mut relay) = relay_parts();

        relay.start().await;
        relay.start().await;

        assert_eq!(store.subscribe_count(), 1);
        let status = relay.status();
        assert!(status.listening);
        assert!(status.connected);
    }

    #[tokio::test]
    async fn stop_then_start_keeps_processed_cache() {
        let (store, _sink, mut relay) = relay_parts();

        relay.start().await;
        relay.apply_snapshot(snapshot(&[("req1", "Reverb")]));
        assert_eq!(relay.status().processed, 1);

        relay.stop();
        assert!(!relay.status().listening);
        assert!(!relay.status().connected);

        relay.start().await;
        assert_eq!(store.subscribe_count(), 2);
        assert_eq!(relay.status().processed, 1);
    }

    #[tokio::test]
    async fn set_session_clears_cache_even_while_stopped() {
        let (store, _sink, mut relay) = relay_parts();

        relay.apply_snapshot(snapshot(&[("req1", "Reverb")]));
        assert_eq!(relay.status().processed, 1);

        relay.set_session(SessionId::new("xyz")).await;

        let status = relay.status();
        assert_eq!(status.session, SessionId::new("xyz"));
        assert_eq!(status.processed, 0);
        assert_eq!(store.subscribe_count(), 0);
    }

    #[tokio::test]
    async fn set_session_restarts_an_attached_listener() {
        let (store, _sink, mut relay) = relay_parts();

        relay.start().await;
        relay.apply_snapshot(snapshot(&[("req1", "Reverb")]));

        relay.set_session(SessionId::new("xyz")).await;

        assert_eq!(store.subscribe_count(), 2);
        let status = relay.status();
        assert!(status.listening);
        assert!(status.connected);
        assert_eq!(status.processed, 0);
    }

    #[tokio::test]
    async fn clear_cache_resets_status_count() {
        let (_store, _sink, mut relay) = relay_parts();

        relay.apply_snapshot(snapshot(&[("req1", "Reverb"), ("req2", "Operator")]));
        assert_eq!(relay.status().processed, 2);

        relay.clear_cache();
        assert_eq!(relay.status().processed, 0);
    }

    #[tokio::test]
    async fn subscribe_failure_leaves_relay_listening_but_disconnected() {
        let (store, _sink, mut relay) = relay_parts();
        store.fail_subscribe.store(true, Ordering::SeqCst);

        relay.start().await;

        let status = relay.status();
        assert!(status.listening);
        assert!(!status.connected);
    }

    #[tokio::test]
    async fn emission_failure_still_marks_processed() {
        let (store, sink, mut relay) = relay_parts();
        sink.set_fail_next(1);

        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();
        relay.set_error_callback(move |_message| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        relay.apply_snapshot(snapshot(&[("req1", "Reverb")]));

        assert!(sink.emitted().is_empty());
        assert_eq!(relay.status().processed, 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        wait_for(|| store.deletes().len() == 1).await;
    }

    #[tokio::test]
    async fn delete_failure_reaches_error_callback() {
        let (store, _sink, mut relay) = relay_parts();
        store.fail_delete.store(true, Ordering::SeqCst);

        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();
        relay.set_error_callback(move |_message| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        relay.apply_snapshot(snapshot(&[("req1", "Reverb")]));

        wait_for(|| errors.load(Ordering::SeqCst) == 1).await;
        // the request stays processed; no retry is scheduled
        assert_eq!(relay.status().processed, 1);
    }

    #[tokio::test]
    async fn test_connection_writes_probe() {
        let (store, _sink, relay) = relay_parts();

        relay.test_connection();

        wait_for(|| store.probes.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn status_report_is_multi_line() {
        let status = RelayStatus {
            session: SessionId::new("abc"),
            listening: true,
            connected: false,
            processed: 3,
        };
        let lines = status.report_lines();
        assert_eq!(lines.len(), 5);
        assert!(lines[1].contains("abc"));
        assert!(lines[2].contains("ON"));
        assert!(lines[3].contains("inactive"));
        assert!(lines[4].contains('3'));
    }

    #[tokio::test]
    async fn run_loop_forwards_snapshots_and_shuts_down() {
        let (store, sink, relay) = relay_parts();
        let (tx, rx) = mpsc::channel(8);

        let driver = tokio::spawn(relay.run(rx));

        tx.send(HostCommand::Start).await.unwrap();
        wait_for(|| store.subscribe_count() == 1).await;

        store.push_snapshot(snapshot(&[("req1", "Reverb")]));
        wait_for(|| sink.emitted() == vec!["Reverb"]).await;
        wait_for(|| store.deletes().len() == 1).await;

        // same entry again: dedup suppresses the second delivery
        store.push_snapshot(snapshot(&[("req1", "Reverb")]));
        store.push_snapshot(snapshot(&[("req2", "Operator")]));
        wait_for(|| sink.emitted() == vec!["Reverb", "Operator"]).await;

        drop(tx);
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn run_loop_survives_listener_loss() {
        let (store, _sink, relay) = relay_parts();
        let (tx, rx) = mpsc::channel(8);

        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();
        let mut relay = relay;
        relay.set_error_callback(move |_message| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let driver = tokio::spawn(relay.run(rx));

        tx.send(HostCommand::Start).await.unwrap();
        wait_for(|| store.subscribe_count() == 1).await;

        {
            let guard = store.events.lock().unwrap();
            guard
                .as_ref()
                .unwrap()
                .try_send(StoreEvent::Lost(StoreError::Network {
                    message: "connection reset".into(),
                }))
                .unwrap();
        }
        wait_for(|| errors.load(Ordering::SeqCst) == 1).await;

        // still answers commands after the loss
        tx.send(HostCommand::Status).await.unwrap();
        tx.send(HostCommand::Stop).await.unwrap();
        drop(tx);
        driver.await.unwrap();
    }
}
