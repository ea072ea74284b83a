use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use stream_backend::{BackendAdapter, StreamSnapshot};
use sysinfo::System;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::Config;
use crate::errors::WatchdogError;
use crate::ffmpeg::{ProbeLauncher, ProbeProcess};
use crate::health::HealthThresholds;
use crate::monitor::{MonitorEvent, StreamMonitor};
use crate::switcher::Switcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Our probe is the only client left
    NoViewers,
    /// The backend no longer lists our probe as a client
    Desync,
    /// The stream is no longer active
    Gone,
    MemoryLimit,
    ProbeExited,
    Shutdown,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            StopReason::NoViewers => "no other clients",
            StopReason::Desync => "probe missing from client list",
            StopReason::Gone => "stream no longer active",
            StopReason::MemoryLimit => "memory limit exceeded",
            StopReason::ProbeExited => "probe exited",
            StopReason::Shutdown => "shutting down",
        };
        write!(f, "{}", reason)
    }
}

struct SupervisedStream {
    probe: ProbeProcess,
    display_name: Arc<RwLock<String>>,
    last_speed: Option<f64>,
    generation: u64,
    monitor: JoinHandle<()>,
}

/// Owns every supervised stream and keeps the set in line with what the
/// backend reports.
pub struct WatchdogManager {
    backend: Arc<dyn BackendAdapter>,
    switcher: Arc<Switcher>,
    launcher: ProbeLauncher,
    thresholds: HealthThresholds,
    user_agent: String,
    query_interval: Duration,
    memory_check_interval: Duration,
    stop_timeout: Duration,
    max_memory_bytes: u64,
    streams: HashMap<String, SupervisedStream>,
    next_generation: u64,
    events_tx: mpsc::UnboundedSender<MonitorEvent>,
    events_rx: mpsc::UnboundedReceiver<MonitorEvent>,
    system: System,
}

impl WatchdogManager {
    pub fn new(config: &Config, switcher: Arc<Switcher>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            backend: switcher.backend().clone(),
            switcher,
            launcher: ProbeLauncher::from_config(config),
            thresholds: HealthThresholds::from_config(config),
            user_agent: config.user_agent.clone(),
            query_interval: config.query_interval(),
            memory_check_interval: config.memory_check_interval(),
            stop_timeout: config.stop_timeout(),
            max_memory_bytes: config.max_memory_bytes(),
            streams: HashMap::new(),
            next_generation: 0,
            events_tx,
            events_rx,
            system: System::new(),
        }
    }

    pub fn is_supervised(&self, stream_id: &str) -> bool {
        self.streams.contains_key(stream_id)
    }

    pub fn supervised_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.streams.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn display_name(&self, stream_id: &str) -> Option<String> {
        match self.streams.get(stream_id) {
            Some(stream) => Some(stream.display_name.read().await.clone()),
            None => None,
        }
    }

    pub fn last_speed(&self, stream_id: &str) -> Option<f64> {
        self.streams.get(stream_id).and_then(|stream| stream.last_speed)
    }

    pub fn generation(&self, stream_id: &str) -> Option<u64> {
        self.streams.get(stream_id).map(|stream| stream.generation)
    }

    /// Run until `shutdown` resolves, then stop every probe.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut poll_timer = interval(self.query_interval);
        poll_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut memory_timer = interval(self.memory_check_interval);
        memory_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = poll_timer.tick() => self.tick().await,
                _ = memory_timer.tick() => self.sweep_memory().await,
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
            }
        }

        self.shutdown().await;
    }

    /// One poll of the backend followed by a reconciliation.
    pub async fn tick(&mut self) {
        let snapshots = self.poll().await;
        self.reconcile(&snapshots).await;
    }

    /// Active streams as the backend sees them. A failed poll counts as no
    /// active streams at all.
    pub async fn poll(&self) -> Vec<StreamSnapshot> {
        match self.backend.list_active_streams().await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                log::error!("Failed to query {}: {}", self.backend.backend_type(), e);
                Vec::new()
            }
        }
    }

    pub async fn reconcile(&mut self, snapshots: &[StreamSnapshot]) {
        for snapshot in snapshots {
            let supervised = self.is_supervised(&snapshot.id);
            let watched = snapshot.has_client(&self.user_agent);
            if !supervised && !watched {
                if let Err(e) = self.start_stream(&snapshot.id, &snapshot.name) {
                    log::error!("[{}] Failed to start probe: {}", snapshot.id, e);
                }
            } else if watched && snapshot.clients.len() == 1 {
                self.stop_stream(&snapshot.id, StopReason::NoViewers).await;
            } else if !watched && supervised {
                self.stop_stream(&snapshot.id, StopReason::Desync).await;
            }
        }

        let active: HashSet<&str> = snapshots.iter().map(|s| s.id.as_str()).collect();
        let gone: Vec<String> = self
            .streams
            .keys()
            .filter(|id| !active.contains(id.as_str()))
            .cloned()
            .collect();
        for stream_id in gone {
            self.stop_stream(&stream_id, StopReason::Gone).await;
        }

        for snapshot in snapshots {
            let Some(stream) = self.streams.get(&snapshot.id) else {
                continue;
            };
            let mut name = stream.display_name.write().await;
            if *name != snapshot.name {
                log::info!("[{}] {} is now {}", snapshot.id, *name, snapshot.name);
                *name = snapshot.name.clone();
            }
            match stream.last_speed {
                Some(speed) => log::info!("[{}] {}: speed {:.2}x", snapshot.id, *name, speed),
                None => log::info!("[{}] {}: no speed reading yet", snapshot.id, *name),
            }
        }
    }

    pub fn start_stream(
        &mut self,
        stream_id: &str,
        display_name: &str,
    ) -> Result<(), WatchdogError> {
        let url = self.backend.stream_url(stream_id);
        let (probe, stderr) = self.launcher.spawn(stream_id, &url)?;

        self.next_generation += 1;
        let generation = self.next_generation;
        let shared_name = Arc::new(RwLock::new(display_name.to_string()));
        let monitor = StreamMonitor::new(
            stream_id,
            generation,
            shared_name.clone(),
            self.thresholds.clone(),
            self.switcher.clone(),
            self.events_tx.clone(),
        )
        .spawn(stderr);

        log::info!("[{}] Started watching {} ({})", stream_id, display_name, url);
        self.streams.insert(
            stream_id.to_string(),
            SupervisedStream {
                probe,
                display_name: shared_name,
                last_speed: None,
                generation,
                monitor,
            },
        );
        Ok(())
    }

    /// Stop and forget a stream. Returns false when it was not supervised.
    pub async fn stop_stream(&mut self, stream_id: &str, reason: StopReason) -> bool {
        let Some(mut stream) = self.streams.remove(stream_id) else {
            return false;
        };
        let name = stream.display_name.read().await.clone();
        match reason {
            StopReason::Desync | StopReason::MemoryLimit | StopReason::ProbeExited => {
                log::warn!("[{}] Stopping {}: {}", stream_id, name, reason);
            }
            _ => log::info!("[{}] Stopping {}: {}", stream_id, name, reason),
        }

        stream.probe.stop(self.stop_timeout).await;
        // the monitor ends at EOF but may still be waiting on a switch request
        if tokio::time::timeout(self.stop_timeout, &mut stream.monitor)
            .await
            .is_err()
        {
            stream.monitor.abort();
        }
        true
    }

    /// Restart every probe above the memory ceiling.
    pub async fn sweep_memory(&mut self) {
        let mut offenders = Vec::new();
        for (stream_id, stream) in self.streams.iter_mut() {
            if let Some(bytes) = stream.probe.memory_bytes(&mut self.system) {
                if bytes > self.max_memory_bytes {
                    offenders.push((stream_id.clone(), bytes));
                }
            }
        }

        for (stream_id, bytes) in offenders {
            let Some(name) = self.display_name(&stream_id).await else {
                continue;
            };
            log::warn!(
                "[{}] Probe uses {} MB, limit is {} MB",
                stream_id,
                bytes / 1024 / 1024,
                self.max_memory_bytes / 1024 / 1024
            );
            self.stop_stream(&stream_id, StopReason::MemoryLimit).await;
            if let Err(e) = self.start_stream(&stream_id, &name) {
                log::error!("[{}] Failed to restart probe: {}", stream_id, e);
            }
        }
    }

    pub async fn handle_event(&mut self, event: MonitorEvent) {
        match event {
            MonitorEvent::Speed {
                stream_id,
                generation,
                ratio,
            } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    if stream.generation == generation {
                        stream.last_speed = Some(ratio);
                    }
                }
            }
            MonitorEvent::Exited {
                stream_id,
                generation,
            } => {
                if self.generation(&stream_id) == Some(generation) {
                    self.stop_stream(&stream_id, StopReason::ProbeExited).await;
                }
            }
        }
    }

    pub async fn shutdown(&mut self) {
        for stream_id in self.supervised_ids() {
            self.stop_stream(&stream_id, StopReason::Shutdown).await;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    use crate::ffmpeg::tests::fake_ffmpeg;
    use crate::switcher::tests::FakeBackend;

    const UA: &str = "Buffer Watchdog";

    fn manager(backend: Arc<FakeBackend>, max_memory_mb: u64) -> WatchdogManager {
        let config = Config {
            server_url: Some("http://fake:7095".to_string()),
            ffmpeg_path: fake_ffmpeg(),
            stop_timeout: 2,
            max_memory_mb,
            ..Default::default()
        };
        WatchdogManager::new(&config, Arc::new(Switcher::new(backend, None)))
    }

    fn stream(id: &str, name: &str, clients: &[&str]) -> StreamSnapshot {
        StreamSnapshot::new(id, name, clients.iter().copied())
    }

    #[tokio::test]
    async fn test_starts_only_unwatched_streams() {
        let backend = FakeBackend::new(vec![
            stream("A", "News", &[]),
            stream("B", "Sports", &[UA]),
        ]);
        let mut manager = manager(backend, 150);

        manager.tick().await;
        assert_eq!(manager.supervised_ids(), vec!["A"]);
        assert_eq!(manager.display_name("A").await.as_deref(), Some("News"));

        manager.shutdown().await;
        assert!(manager.supervised_ids().is_empty());
    }

    #[tokio::test]
    async fn test_absent_stream_is_stopped() {
        let backend = FakeBackend::new(vec![stream("C", "Movies", &["VLC"])]);
        let mut manager = manager(backend.clone(), 150);
        manager.tick().await;
        assert!(manager.is_supervised("C"));

        backend.set_streams(vec![]);
        manager.tick().await;
        assert!(!manager.is_supervised("C"));
    }

    #[tokio::test]
    async fn test_sole_client_is_stopped() {
        let mut manager = manager(FakeBackend::new(vec![]), 150);
        manager.reconcile(&[stream("A", "News", &["VLC"])]).await;
        assert!(manager.is_supervised("A"));

        manager.reconcile(&[stream("A", "News", &[UA])]).await;
        assert!(!manager.is_supervised("A"));
    }

    #[tokio::test]
    async fn test_desync_is_stopped() {
        let mut manager = manager(FakeBackend::new(vec![]), 150);
        manager.reconcile(&[stream("A", "News", &["VLC"])]).await;
        manager.reconcile(&[stream("A", "News", &["VLC", UA])]).await;
        assert!(manager.is_supervised("A"));

        manager.reconcile(&[stream("A", "News", &["VLC", "Kodi"])]).await;
        assert!(!manager.is_supervised("A"));
    }

    #[tokio::test]
    async fn test_failed_poll_stops_everything() {
        let backend = FakeBackend::new(vec![
            stream("A", "News", &["VLC"]),
            stream("B", "Sports", &["Kodi"]),
        ]);
        let mut manager = manager(backend.clone(), 150);
        manager.tick().await;
        assert_eq!(manager.supervised_ids(), vec!["A", "B"]);

        backend.fail_polls();
        manager.tick().await;
        assert!(manager.supervised_ids().is_empty());
    }

    #[tokio::test]
    async fn test_stop_twice_is_noop() {
        let mut manager = manager(FakeBackend::new(vec![]), 150);
        manager.start_stream("A", "News").unwrap();
        assert!(manager.stop_stream("A", StopReason::Gone).await);
        assert!(!manager.stop_stream("A", StopReason::Gone).await);
    }

    #[tokio::test]
    async fn test_names_follow_backend() {
        let mut manager = manager(FakeBackend::new(vec![]), 150);
        manager.reconcile(&[stream("A", "News [1]", &["VLC"])]).await;
        manager.reconcile(&[stream("A", "News [2]", &["VLC", UA])]).await;
        assert_eq!(manager.display_name("A").await.as_deref(), Some("News [2]"));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_events_are_ignored() {
        let mut manager = manager(FakeBackend::new(vec![]), 150);
        manager.start_stream("A", "News").unwrap();
        let generation = manager.generation("A").unwrap();

        manager
            .handle_event(MonitorEvent::Speed {
                stream_id: "A".to_string(),
                generation,
                ratio: 0.8,
            })
            .await;
        manager
            .handle_event(MonitorEvent::Speed {
                stream_id: "A".to_string(),
                generation: generation + 1,
                ratio: 3.0,
            })
            .await;
        assert_eq!(manager.last_speed("A"), Some(0.8));

        manager
            .handle_event(MonitorEvent::Exited {
                stream_id: "A".to_string(),
                generation: generation + 1,
            })
            .await;
        assert!(manager.is_supervised("A"));

        manager
            .handle_event(MonitorEvent::Exited {
                stream_id: "A".to_string(),
                generation,
            })
            .await;
        assert!(!manager.is_supervised("A"));
    }

    #[tokio::test]
    async fn test_memory_sweep_restarts_offenders() {
        let mut manager = manager(FakeBackend::new(vec![]), 0);
        manager.start_stream("A", "News").unwrap();
        let generation = manager.generation("A").unwrap();

        manager.sweep_memory().await;
        assert!(manager.is_supervised("A"));
        assert!(manager.generation("A").unwrap() > generation);
        assert_eq!(manager.display_name("A").await.as_deref(), Some("News"));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_stops_probes_on_shutdown() {
        let backend = FakeBackend::new(vec![stream("A", "News", &["VLC"])]);
        let mut manager = manager(backend.clone(), 150);

        manager
            .run(tokio::time::sleep(Duration::from_millis(300)))
            .await;
        assert!(manager.supervised_ids().is_empty());
    }
}
