//! Network reachability
//!
//! A [`PathSource`] publishes the current [`NetworkPath`]; the
//! [`ReachabilityMonitor`] classifies it into lock-free flags and calls a
//! listener on every reachable/unreachable edge.
//!
//! Only a `Satisfied` path counts as reachable. Until the first definitive
//! path arrives the network is treated as unreachable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Link type a path runs over
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Wifi,
    Cellular,
    Wired,
    Loopback,
    #[default]
    Other,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PathStatus {
    Satisfied,
    Unsatisfied,
    RequiresConnection,
    #[default]
    Unknown,
}

/// Snapshot of the route to the outside world
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkPath {
    pub status: PathStatus,
    pub interfaces: Vec<InterfaceKind>,
}

impl NetworkPath {
    pub fn satisfied(interfaces: Vec<InterfaceKind>) -> Self {
        Self {
            status: PathStatus::Satisfied,
            interfaces,
        }
    }

    pub fn unsatisfied() -> Self {
        Self {
            status: PathStatus::Unsatisfied,
            interfaces: Vec::new(),
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.status == PathStatus::Satisfied
    }

    pub fn uses(&self, kind: InterfaceKind) -> bool {
        self.interfaces.contains(&kind)
    }
}

/// Coarse classification exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Offline,
    Wifi,
    Cellular,
    Other,
}

impl Connectivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Connectivity::Offline => "offline",
            Connectivity::Wifi => "wifi",
            Connectivity::Cellular => "cellular",
            Connectivity::Other => "other",
        }
    }
}

/// Anything that can publish network path updates.
pub trait PathSource: Send + Sync {
    /// Receiver whose current value is the latest known path
    fn subscribe(&self) -> watch::Receiver<NetworkPath>;
}

/// Path source driven from outside, e.g. by a platform adapter or a test.
pub struct ManualPathSource {
    tx: watch::Sender<NetworkPath>,
}

impl ManualPathSource {
    pub fn new(initial: NetworkPath) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Publish a new path. Identical paths are not re-announced.
    pub fn set(&self, path: NetworkPath) {
        self.tx.send_if_modified(|current| {
            if *current == path {
                false
            } else {
                *current = path;
                true
            }
        });
    }
}

impl Default for ManualPathSource {
    fn default() -> Self {
        Self::new(NetworkPath::default())
    }
}

impl PathSource for ManualPathSource {
    fn subscribe(&self) -> watch::Receiver<NetworkPath> {
        self.tx.subscribe()
    }
}

/// Path source that periodically opens a TCP connection to a known host.
///
/// A successful connect reports a satisfied path over `interface`; a failure
/// or timeout reports an unsatisfied path. The probe task stops when the
/// source is dropped.
pub struct ProbePathSource {
    tx: watch::Sender<NetworkPath>,
    cancel: CancellationToken,
}

impl ProbePathSource {
    /// Start probing `host:port` every `interval`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(host: String, port: u16, interval: Duration, interface: InterfaceKind) -> Self {
        let (tx, _rx) = watch::channel(NetworkPath::default());
        let cancel = CancellationToken::new();

        let probe_tx = tx.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            let timeout = interval.min(Duration::from_secs(5));
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let path = probe(&host, port, timeout, interface).await;
                        probe_tx.send_if_modified(|current| {
                            if *current == path {
                                false
                            } else {
                                tracing::debug!(host = %host, port, status = ?path.status, "Network path changed");
                                *current = path;
                                true
                            }
                        });
                    }
                }
            }
        });

        Self { tx, cancel }
    }
}

async fn probe(host: &str, port: u16, timeout: Duration, interface: InterfaceKind) -> NetworkPath {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => NetworkPath::satisfied(vec![interface]),
        Ok(Err(e)) => {
            tracing::trace!(host, port, error = %e, "Reachability probe failed");
            NetworkPath::unsatisfied()
        }
        Err(_) => {
            tracing::trace!(host, port, "Reachability probe timed out");
            NetworkPath::unsatisfied()
        }
    }
}

impl PathSource for ProbePathSource {
    fn subscribe(&self) -> watch::Receiver<NetworkPath> {
        self.tx.subscribe()
    }
}

impl Drop for ProbePathSource {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// What the uploader needs to know before it syncs
pub trait NetworkStatus: Send + Sync {
    fn is_reachable(&self) -> bool;
    fn is_wifi(&self) -> bool;
}

/// A network that never changes
#[derive(Debug, Clone, Copy)]
pub struct FixedNetwork {
    pub reachable: bool,
    pub wifi: bool,
}

impl FixedNetwork {
    pub const WIFI: FixedNetwork = FixedNetwork {
        reachable: true,
        wifi: true,
    };
    pub const CELLULAR: FixedNetwork = FixedNetwork {
        reachable: true,
        wifi: false,
    };
    pub const OFFLINE: FixedNetwork = FixedNetwork {
        reachable: false,
        wifi: false,
    };
}

impl NetworkStatus for FixedNetwork {
    fn is_reachable(&self) -> bool {
        self.reachable
    }

    fn is_wifi(&self) -> bool {
        self.wifi
    }
}

#[derive(Default)]
struct Flags {
    reachable: AtomicBool,
    wifi: AtomicBool,
    cellular: AtomicBool,
}

impl Flags {
    /// Store the classification of `path`, returning the previous reachability
    fn apply(&self, path: &NetworkPath) -> bool {
        self.wifi
            .store(path.uses(InterfaceKind::Wifi), Ordering::Release);
        self.cellular
            .store(path.uses(InterfaceKind::Cellular), Ordering::Release);
        self.reachable
            .swap(path.is_reachable(), Ordering::AcqRel)
    }
}

struct Watcher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Classifies a [`PathSource`] and reports reachability edges.
pub struct ReachabilityMonitor {
    source: Arc<dyn PathSource>,
    flags: Arc<Flags>,
    watcher: Mutex<Option<Watcher>>,
}

impl ReachabilityMonitor {
    pub fn new(source: Arc<dyn PathSource>) -> Self {
        Self {
            source,
            flags: Arc::new(Flags::default()),
            watcher: Mutex::new(None),
        }
    }

    /// Start observing the path source.
    ///
    /// The flags reflect the source's current path as soon as this returns.
    /// `on_change(reachable)` runs on the monitor's own task, once per edge,
    /// in order. Calling this again replaces the previous listener.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_monitoring<F>(&self, on_change: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let mut watcher = self.lock_watcher();
        if let Some(previous) = watcher.take() {
            previous.cancel.cancel();
            previous.handle.abort();
        }

        let mut rx = self.source.subscribe();
        let initial = rx.borrow_and_update().clone();
        let was_reachable = self.flags.apply(&initial);
        let initial_edge = (was_reachable != initial.is_reachable()).then(|| initial.is_reachable());

        let flags = self.flags.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            if let Some(reachable) = initial_edge {
                tracing::info!(reachable, "Reachability changed");
                on_change(reachable);
            }

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            tracing::debug!("Path source closed, reachability monitor exiting");
                            break;
                        }
                        let path = rx.borrow_and_update().clone();
                        let was_reachable = flags.apply(&path);
                        let reachable = path.is_reachable();
                        if was_reachable != reachable {
                            tracing::info!(reachable, interfaces = ?path.interfaces, "Reachability changed");
                            on_change(reachable);
                        }
                    }
                }
            }
        });

        *watcher = Some(Watcher { cancel, handle });
    }

    /// Stop observing and drop the listener. Safe if never started.
    pub fn stop_monitoring(&self) {
        if let Some(watcher) = self.lock_watcher().take() {
            watcher.cancel.cancel();
            watcher.handle.abort();
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.lock_watcher().is_some()
    }

    pub fn is_reachable(&self) -> bool {
        self.flags.reachable.load(Ordering::Acquire)
    }

    pub fn is_wifi(&self) -> bool {
        self.flags.wifi.load(Ordering::Acquire)
    }

    pub fn is_cellular(&self) -> bool {
        self.flags.cellular.load(Ordering::Acquire)
    }

    pub fn connectivity(&self) -> Connectivity {
        if !self.is_reachable() {
            Connectivity::Offline
        } else if self.is_wifi() {
            Connectivity::Wifi
        } else if self.is_cellular() {
            Connectivity::Cellular
        } else {
            Connectivity::Other
        }
    }

    fn lock_watcher(&self) -> std::sync::MutexGuard<'_, Option<Watcher>> {
        self.watcher.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NetworkStatus for ReachabilityMonitor {
    fn is_reachable(&self) -> bool {
        ReachabilityMonitor::is_reachable(self)
    }

    fn is_wifi(&self) -> bool {
        ReachabilityMonitor::is_wifi(self)
    }
}

impl Drop for ReachabilityMonitor {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn monitor_with(initial: NetworkPath) -> (Arc<ManualPathSource>, ReachabilityMonitor) {
        let source = Arc::new(ManualPathSource::new(initial));
        let monitor = ReachabilityMonitor::new(source.clone());
        (source, monitor)
    }

    async fn next_edge(rx: &mut mpsc::UnboundedReceiver<bool>) -> bool {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("edge not delivered")
            .expect("listener dropped")
    }

    #[tokio::test]
    async fn test_unknown_path_is_unreachable() {
        let (_source, monitor) = monitor_with(NetworkPath::default());
        monitor.start_monitoring(|_| {});

        assert!(!monitor.is_reachable());
        assert_eq!(monitor.connectivity(), Connectivity::Offline);
    }

    #[tokio::test]
    async fn test_flags_set_on_start() {
        let (_source, monitor) = monitor_with(NetworkPath::satisfied(vec![InterfaceKind::Wifi]));
        monitor.start_monitoring(|_| {});

        assert!(monitor.is_reachable());
        assert!(monitor.is_wifi());
        assert!(!monitor.is_cellular());
        assert_eq!(monitor.connectivity(), Connectivity::Wifi);
    }

    #[tokio::test]
    async fn test_edges_only() {
        let (source, monitor) = monitor_with(NetworkPath::unsatisfied());
        let (tx, mut rx) = mpsc::unbounded_channel();
        monitor.start_monitoring(move |reachable| {
            let _ = tx.send(reachable);
        });

        source.set(NetworkPath::satisfied(vec![InterfaceKind::Wifi]));
        assert!(next_edge(&mut rx).await);

        // Interface change without a reachability change is not an edge
        source.set(NetworkPath::satisfied(vec![InterfaceKind::Cellular]));
        source.set(NetworkPath {
            status: PathStatus::RequiresConnection,
            interfaces: vec![InterfaceKind::Cellular],
        });
        assert!(!next_edge(&mut rx).await);

        source.set(NetworkPath::satisfied(vec![InterfaceKind::Cellular]));
        assert!(next_edge(&mut rx).await);
        assert!(monitor.is_cellular());
        assert_eq!(monitor.connectivity(), Connectivity::Cellular);
    }

    #[tokio::test]
    async fn test_start_replaces_listener() {
        let (source, monitor) = monitor_with(NetworkPath::unsatisfied());
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel();

        monitor.start_monitoring(move |reachable| {
            let _ = first_tx.send(reachable);
        });
        monitor.start_monitoring(move |reachable| {
            let _ = second_tx.send(reachable);
        });

        source.set(NetworkPath::satisfied(vec![InterfaceKind::Wired]));
        assert!(next_edge(&mut second_rx).await);
        // The replaced listener was dropped along with its task
        assert!(first_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_monitoring() {
        let (source, monitor) = monitor_with(NetworkPath::unsatisfied());
        monitor.stop_monitoring();

        let (tx, mut rx) = mpsc::unbounded_channel();
        monitor.start_monitoring(move |reachable| {
            let _ = tx.send(reachable);
        });
        assert!(monitor.is_monitoring());

        monitor.stop_monitoring();
        monitor.stop_monitoring();
        assert!(!monitor.is_monitoring());

        source.set(NetworkPath::satisfied(vec![InterfaceKind::Wifi]));
        assert!(rx.recv().await.is_none());
        assert!(!monitor.is_reachable());
    }

    #[tokio::test]
    async fn test_probe_source_reports_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while listener.accept().await.is_ok() {}
        });

        let source = ProbePathSource::spawn(
            "127.0.0.1".to_string(),
            port,
            Duration::from_millis(50),
            InterfaceKind::Wired,
        );
        let mut rx = source.subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|p| p.is_reachable()))
            .await
            .expect("probe never succeeded")
            .unwrap();
        assert!(rx.borrow().uses(InterfaceKind::Wired));
    }

    #[test]
    fn test_fixed_network() {
        assert!(FixedNetwork::WIFI.is_reachable());
        assert!(FixedNetwork::WIFI.is_wifi());
        assert!(!FixedNetwork::CELLULAR.is_wifi());
        assert!(!FixedNetwork::OFFLINE.is_reachable());
    }
}
