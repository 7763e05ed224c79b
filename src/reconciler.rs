//! Converges the set of bound listeners onto the slots document.
//!
//! A `Reconciler` owns its managed-port table outright; nothing outside a
//! tick touches it. Each listener is an axum server task holding its own
//! socket, so traffic on untouched ports never waits on a tick.

use crate::classify;
use crate::config::Settings;
use crate::listener::ListenerFactory;
use crate::store::{ConfigStore, StoreError};
use crate::types::ListenerEntry;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

struct ManagedListener {
    entry: ListenerEntry,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// What one tick changed.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub started: Vec<u16>,
    pub stopped: Vec<u16>,
    /// Desired ports that could not be bound this tick.
    pub failed: Vec<u16>,
}

impl TickReport {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && self.failed.is_empty()
    }
}

pub struct Reconciler {
    store: ConfigStore,
    factory: ListenerFactory,
    host: IpAddr,
    drain_timeout: Duration,
    retry_interval: Duration,
    managed: BTreeMap<u16, ManagedListener>,
    snapshot: watch::Sender<Vec<ListenerEntry>>,
}

impl Reconciler {
    pub fn new(store: ConfigStore, factory: ListenerFactory, settings: &Settings) -> Self {
        let (snapshot, _) = watch::channel(Vec::new());
        Self {
            store,
            factory,
            host: settings.host,
            drain_timeout: settings.drain_timeout(),
            retry_interval: settings.retry_interval(),
            managed: BTreeMap::new(),
            snapshot,
        }
    }

    /// Receiver that always holds the entries currently being served.
    pub fn subscribe(&self) -> watch::Receiver<Vec<ListenerEntry>> {
        self.snapshot.subscribe()
    }

    pub fn managed_ports(&self) -> Vec<u16> {
        self.managed.keys().copied().collect()
    }

    pub fn managed_entries(&self) -> Vec<ListenerEntry> {
        self.managed.values().map(|l| l.entry.clone()).collect()
    }

    /// One reconciliation pass.
    ///
    /// A document that cannot be read or parsed aborts the pass before any
    /// listener is touched.
    pub async fn tick(&mut self) -> Result<TickReport, StoreError> {
        let doc = self.store.load()?;
        let desired = classify::desired_entries(&doc);
        let mut report = TickReport::default();

        // Anything no longer wanted, or wanted differently, goes first. The
        // close is awaited so a rebind of the same port below cannot race it.
        let stale: Vec<u16> = self
            .managed
            .iter()
            .filter(|(port, listener)| desired.get(*port) != Some(&listener.entry))
            .map(|(port, _)| *port)
            .collect();
        for port in stale {
            if let Some(listener) = self.managed.remove(&port) {
                self.close(listener).await;
                report.stopped.push(port);
            }
        }

        for (port, entry) in desired {
            if self.managed.contains_key(&port) {
                continue;
            }
            match self.bind(entry).await {
                Ok(listener) => {
                    self.managed.insert(port, listener);
                    report.started.push(port);
                }
                Err(e) => {
                    warn!("Port {} unavailable, will retry: {}", port, e);
                    report.failed.push(port);
                }
            }
        }

        self.publish();
        Ok(report)
    }

    async fn bind(&self, entry: ListenerEntry) -> std::io::Result<ManagedListener> {
        let listener = TcpListener::bind(SocketAddr::new(self.host, entry.port)).await?;
        let app = self.factory.build(&entry);
        let (tx, rx) = oneshot::channel::<()>();

        let port = entry.port;
        let slot = entry.slot.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    // A dropped sender also means stop.
                    let _ = rx.await;
                })
                .await;
            if let Err(e) = result {
                error!("Listener on port {} (slot {}) failed: {}", port, slot, e);
            }
        });

        info!(
            "Serving {} for slot {} on port {}",
            entry.mode.name(),
            entry.slot,
            entry.port
        );
        Ok(ManagedListener {
            entry,
            shutdown: Some(tx),
            task,
        })
    }

    /// Graceful close, aborting the server task if it outlives the drain timeout.
    async fn close(&self, listener: ManagedListener) {
        let deadline = Instant::now() + self.drain_timeout;
        close_until(listener, deadline).await;
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.managed_entries());
    }

    async fn tick_logged(&mut self) -> bool {
        match self.tick().await {
            Ok(report) => {
                if report.is_noop() {
                    debug!("Reconciled: no changes ({} managed)", self.managed.len());
                } else {
                    info!(
                        "Reconciled: started {:?}, stopped {:?}, failed {:?} ({} managed)",
                        report.started,
                        report.stopped,
                        report.failed,
                        self.managed.len()
                    );
                }
                !report.failed.is_empty()
            }
            Err(e) => {
                error!(
                    "Configuration read failed; keeping {} listener(s): {}",
                    self.managed.len(),
                    e
                );
                false
            }
        }
    }

    /// Run ticks until `stop` fires, then close every listener.
    ///
    /// An initial tick runs immediately. Triggers that arrive during a tick
    /// leave a single stored permit on `trigger`, so any burst collapses into
    /// one follow-up tick. Failed binds are retried every `retry_interval`.
    pub async fn run(mut self, trigger: Arc<Notify>, mut stop: oneshot::Receiver<()>) {
        let mut retry_pending = self.tick_logged().await;
        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = trigger.notified() => {}
                _ = tokio::time::sleep(self.retry_interval), if retry_pending => {
                    debug!("Retrying unbound ports");
                }
            }
            retry_pending = self.tick_logged().await;
        }
        self.shutdown().await;
    }

    /// Close every managed listener concurrently, sharing one drain deadline.
    pub async fn shutdown(&mut self) {
        let count = self.managed.len();
        let deadline = Instant::now() + self.drain_timeout;
        let closes: Vec<_> = std::mem::take(&mut self.managed)
            .into_values()
            .map(|listener| tokio::spawn(close_until(listener, deadline)))
            .collect();
        for close in closes {
            let _ = close.await;
        }
        self.publish();
        info!("Closed {} listener(s)", count);
    }
}

async fn close_until(mut listener: ManagedListener, deadline: Instant) {
    let port = listener.entry.port;
    if let Some(tx) = listener.shutdown.take() {
        let _ = tx.send(());
    }
    if tokio::time::timeout_at(deadline, &mut listener.task)
        .await
        .is_err()
    {
        warn!("Port {} did not drain in time; aborting connections", port);
        listener.task.abort();
        let _ = (&mut listener.task).await;
    }
    info!("Released port {} (slot {})", port, listener.entry.slot);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HealthPayload, Slot, SlotStatus, SlotType, SlotsDocument};
    use std::net::Ipv4Addr;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        dir: TempDir,
        store: ConfigStore,
        reconciler: Reconciler,
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn settings() -> Settings {
        Settings {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            drain_timeout_ms: 1000,
            retry_interval_ms: 50,
            ..Settings::default()
        }
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("slots.json"));
        let placeholders = dir.path().join("placeholders");
        for id in ["a", "b", "c"] {
            let slot_dir = placeholders.join(id);
            std::fs::create_dir_all(&slot_dir).unwrap();
            std::fs::write(slot_dir.join("index.html"), format!("placeholder {}", id)).unwrap();
        }
        let reconciler = Reconciler::new(store.clone(), ListenerFactory::new(placeholders), &settings());
        Fixture {
            dir,
            store,
            reconciler,
        }
    }

    fn write_slots(store: &ConfigStore, slots: &[(&str, Slot)]) {
        let mut doc = SlotsDocument::default();
        for (id, slot) in slots {
            doc.slots.insert(id.to_string(), slot.clone());
        }
        store.write_atomic(&doc).unwrap();
    }

    fn with_status(status: SlotStatus, port: u16) -> Slot {
        Slot {
            status: Some(status),
            port: Some(port),
            ..Slot::default()
        }
    }

    fn static_slot(root: &Path, port: u16, spa: bool) -> Slot {
        Slot {
            status: Some(SlotStatus::Deployed),
            slot_type: Some(SlotType::Static),
            static_root: Some(root.to_path_buf()),
            spa_mode: Some(spa),
            port: Some(port),
            ..Slot::default()
        }
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    async fn fetch(port: u16, path: &str) -> Option<(u16, String)> {
        let resp = client()
            .get(format!("http://127.0.0.1:{}{}", port, path))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .ok()?;
        let status = resp.status().as_u16();
        Some((status, resp.text().await.ok()?))
    }

    async fn health(port: u16) -> HealthPayload {
        let (status, body) = fetch(port, "/health").await.expect("health request failed");
        assert_eq!(status, 200);
        serde_json::from_str(&body).unwrap()
    }

    #[tokio::test]
    async fn empty_slot_serves_placeholder_and_health() {
        let mut f = fixture();
        let port = free_port();
        write_slots(&f.store, &[("a", with_status(SlotStatus::Empty, port))]);

        let report = f.reconciler.tick().await.unwrap();
        assert_eq!(report.started, vec![port]);

        let h = health(port).await;
        assert_eq!(h.status, "healthy");
        assert_eq!(h.slot, "a");
        assert_eq!(h.port, port);
        assert_eq!(h.mode, "placeholder");
        assert_eq!(fetch(port, "/").await.unwrap().1, "placeholder a");

        f.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn second_tick_on_unchanged_config_is_a_noop() {
        let mut f = fixture();
        let (pa, pb) = (free_port(), free_port());
        write_slots(
            &f.store,
            &[
                ("a", with_status(SlotStatus::Empty, pa)),
                ("b", with_status(SlotStatus::Error, pb)),
            ],
        );

        let first = f.reconciler.tick().await.unwrap();
        assert_eq!(first.started.len(), 2);
        let second = f.reconciler.tick().await.unwrap();
        assert!(second.is_noop(), "unexpected changes: {:?}", second);

        f.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn deployed_static_slot_switches_content_and_mode() {
        let mut f = fixture();
        let port = free_port();
        write_slots(&f.store, &[("a", with_status(SlotStatus::Empty, port))]);
        f.reconciler.tick().await.unwrap();
        assert_eq!(health(port).await.mode, "placeholder");

        let site = f.dir.path().join("site");
        std::fs::create_dir_all(&site).unwrap();
        std::fs::write(site.join("index.html"), "static home").unwrap();
        write_slots(&f.store, &[("a", static_slot(&site, port, false))]);

        let report = f.reconciler.tick().await.unwrap();
        assert_eq!(report.stopped, vec![port]);
        assert_eq!(report.started, vec![port]);
        assert_eq!(health(port).await.mode, "static");
        assert_eq!(fetch(port, "/").await.unwrap().1, "static home");

        f.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn static_to_placeholder_flip_serves_placeholder() {
        let mut f = fixture();
        let port = free_port();
        let site = f.dir.path().join("site");
        std::fs::create_dir_all(&site).unwrap();
        std::fs::write(site.join("index.html"), "static home").unwrap();
        write_slots(&f.store, &[("a", static_slot(&site, port, true))]);
        f.reconciler.tick().await.unwrap();
        assert_eq!(fetch(port, "/anything").await.unwrap().1, "static home");

        write_slots(&f.store, &[("a", with_status(SlotStatus::Empty, port))]);
        f.reconciler.tick().await.unwrap();

        assert_eq!(fetch(port, "/").await.unwrap().1, "placeholder a");
        assert_eq!(fetch(port, "/anything").await.unwrap().1, "placeholder a");
        assert_eq!(health(port).await.mode, "placeholder");

        f.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn deployed_nodejs_slot_is_left_unbound() {
        let mut f = fixture();
        let (pa, pb) = (free_port(), free_port());
        write_slots(
            &f.store,
            &[
                ("a", with_status(SlotStatus::Empty, pa)),
                (
                    "b",
                    Slot {
                        slot_type: Some(SlotType::Nodejs),
                        ..with_status(SlotStatus::Deployed, pb)
                    },
                ),
            ],
        );

        f.reconciler.tick().await.unwrap();
        assert_eq!(f.reconciler.managed_ports(), vec![pa]);
        // The port is still free for the app's own process.
        std::net::TcpListener::bind(("127.0.0.1", pb)).expect("port b should be free");

        f.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn slot_going_deployed_releases_its_port() {
        let mut f = fixture();
        let port = free_port();
        write_slots(&f.store, &[("a", with_status(SlotStatus::Empty, port))]);
        f.reconciler.tick().await.unwrap();

        write_slots(&f.store, &[("a", with_status(SlotStatus::Deployed, port))]);
        let report = f.reconciler.tick().await.unwrap();
        assert_eq!(report.stopped, vec![port]);
        assert!(f.reconciler.managed_ports().is_empty());
        std::net::TcpListener::bind(("127.0.0.1", port)).expect("port should be released");

        f.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn unreadable_config_keeps_running_listeners() {
        let mut f = fixture();
        let port = free_port();
        write_slots(&f.store, &[("a", with_status(SlotStatus::Empty, port))]);
        f.reconciler.tick().await.unwrap();

        std::fs::write(f.store.path(), "{ not json").unwrap();
        assert!(f.reconciler.tick().await.is_err());
        assert_eq!(f.reconciler.managed_ports(), vec![port]);
        assert_eq!(health(port).await.slot, "a");

        std::fs::remove_file(f.store.path()).unwrap();
        assert!(f.reconciler.tick().await.is_err());
        assert_eq!(f.reconciler.managed_ports(), vec![port]);

        f.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn bind_conflict_is_retried_on_next_tick() {
        let mut f = fixture();
        let port = free_port();
        let squatter = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
        write_slots(&f.store, &[("a", with_status(SlotStatus::Empty, port))]);

        let report = f.reconciler.tick().await.unwrap();
        assert_eq!(report.failed, vec![port]);
        assert!(f.reconciler.managed_ports().is_empty());

        drop(squatter);
        let report = f.reconciler.tick().await.unwrap();
        assert_eq!(report.started, vec![port]);
        assert_eq!(health(port).await.slot, "a");

        f.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn stuck_connection_is_cut_off_at_drain_timeout() {
        use tokio::io::AsyncWriteExt;

        let f = fixture();
        let port = free_port();
        write_slots(&f.store, &[("a", with_status(SlotStatus::Empty, port))]);
        let mut reconciler = Reconciler::new(
            f.store.clone(),
            ListenerFactory::new(f.dir.path().join("placeholders")),
            &Settings {
                drain_timeout_ms: 300,
                ..settings()
            },
        );
        reconciler.tick().await.unwrap();

        // A request whose headers never finish keeps the connection busy
        // through the graceful close.
        let mut stuck = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stuck.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        write_slots(&f.store, &[("a", with_status(SlotStatus::Stopped, port))]);
        let started = Instant::now();
        let report = reconciler.tick().await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(report.stopped, vec![port]);
        assert!(elapsed >= Duration::from_millis(250), "closed too early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3), "drain not bounded: {:?}", elapsed);
        TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
            .await
            .expect("port should be free after the abort");
        drop(stuck);
    }

    #[tokio::test]
    async fn converges_to_classified_ports_after_many_mutations() {
        let mut f = fixture();
        let ports: Vec<u16> = (0..3).map(|_| free_port()).collect();
        let site = f.dir.path().join("site");
        std::fs::create_dir_all(&site).unwrap();
        std::fs::write(site.join("index.html"), "site").unwrap();

        let states = [
            [SlotStatus::Empty, SlotStatus::Empty, SlotStatus::Empty],
            [SlotStatus::Deployed, SlotStatus::Error, SlotStatus::Stopped],
            [SlotStatus::Stopped, SlotStatus::Empty, SlotStatus::Deployed],
        ];
        for (round, statuses) in states.iter().enumerate() {
            let slots: Vec<(&str, Slot)> = ["a", "b", "c"]
                .iter()
                .zip(statuses.iter().zip(&ports))
                .map(|(id, (status, port))| {
                    let slot = if *status == SlotStatus::Deployed && round == 2 {
                        static_slot(&site, *port, false)
                    } else {
                        with_status(*status, *port)
                    };
                    (*id, slot)
                })
                .collect();
            write_slots(&f.store, &slots);
            f.reconciler.tick().await.unwrap();

            let doc = f.store.load().unwrap();
            let expected: Vec<u16> = classify::desired_entries(&doc).into_keys().collect();
            assert_eq!(f.reconciler.managed_ports(), expected, "round {}", round);
        }

        f.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn independent_reconcilers_do_not_share_state() {
        let mut one = fixture();
        let mut two = fixture();
        let (p1, p2) = (free_port(), free_port());
        write_slots(&one.store, &[("a", with_status(SlotStatus::Empty, p1))]);
        write_slots(&two.store, &[("b", with_status(SlotStatus::Empty, p2))]);

        one.reconciler.tick().await.unwrap();
        two.reconciler.tick().await.unwrap();
        assert_eq!(one.reconciler.managed_ports(), vec![p1]);
        assert_eq!(two.reconciler.managed_ports(), vec![p2]);

        one.reconciler.shutdown().await;
        assert_eq!(health(p2).await.slot, "b");
        two.reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn snapshot_tracks_managed_entries() {
        let mut f = fixture();
        let port = free_port();
        let rx = f.reconciler.subscribe();
        write_slots(&f.store, &[("c", with_status(SlotStatus::Error, port))]);

        f.reconciler.tick().await.unwrap();
        let snapshot = rx.borrow().clone();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].slot, "c");

        f.reconciler.shutdown().await;
        assert!(rx.borrow().is_empty());
        std::net::TcpListener::bind(("127.0.0.1", port)).expect("shutdown should release port");
    }

    #[tokio::test]
    async fn run_loop_ticks_on_trigger_and_stops() {
        let f = fixture();
        let port = free_port();
        write_slots(&f.store, &[("a", with_status(SlotStatus::Empty, port))]);

        let mut rx = f.reconciler.subscribe();
        let trigger = Arc::new(Notify::new());
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(f.reconciler.run(trigger.clone(), stop_rx));

        // Initial tick runs without any trigger.
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|e| e.len() == 1))
            .await
            .unwrap()
            .unwrap();

        write_slots(&f.store, &[("a", with_status(SlotStatus::Stopped, port))]);
        for _ in 0..5 {
            trigger.notify_one();
        }
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|e| e.is_empty()))
            .await
            .unwrap()
            .unwrap();

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn run_loop_retries_failed_binds_without_trigger() {
        let f = fixture();
        let port = free_port();
        let squatter = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
        write_slots(&f.store, &[("a", with_status(SlotStatus::Empty, port))]);

        let mut rx = f.reconciler.subscribe();
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(f.reconciler.run(Arc::new(Notify::new()), stop_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(squatter);
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|e| e.len() == 1))
            .await
            .unwrap()
            .unwrap();

        stop_tx.send(()).unwrap();
        task.await.unwrap();
    }
}
