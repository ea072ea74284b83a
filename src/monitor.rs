use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::ffmpeg::classifier::{classify, DecodeErrorKind, ProbeSignal};
use crate::health::{ErrorVerdict, HealthThresholds, SpeedVerdict, StreamHealth};
use crate::switcher::{SwitchOutcome, SwitchReason, Switcher};

/// Reports from a monitor task back to the manager that owns the stream
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Speed {
        stream_id: String,
        generation: u64,
        ratio: f64,
    },
    /// The probe output ended, so the probe is gone or about to be
    Exited { stream_id: String, generation: u64 },
}

/// Follows the diagnostic output of one probe and acts on what it sees.
pub struct StreamMonitor {
    stream_id: String,
    generation: u64,
    display_name: Arc<RwLock<String>>,
    health: StreamHealth,
    switcher: Arc<Switcher>,
    events: mpsc::UnboundedSender<MonitorEvent>,
}

impl StreamMonitor {
    pub fn new(
        stream_id: &str,
        generation: u64,
        display_name: Arc<RwLock<String>>,
        thresholds: HealthThresholds,
        switcher: Arc<Switcher>,
        events: mpsc::UnboundedSender<MonitorEvent>,
    ) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            generation,
            display_name,
            health: StreamHealth::new(thresholds),
            switcher,
            events,
        }
    }

    pub fn spawn<R>(self, output: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(self.run(output))
    }

    pub async fn run<R>(mut self, output: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(output);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    log::warn!("[{}] Failed to read probe output: {}", self.stream_id, e);
                    break;
                }
            }
            // stats lines are separated by bare carriage returns
            let text = String::from_utf8_lossy(&buf);
            for line in text.split('\r') {
                let line = line.trim();
                if !line.is_empty() {
                    self.handle_line(line).await;
                }
            }
        }

        log::debug!("[{}] Probe output closed", self.stream_id);
        let _ = self.events.send(MonitorEvent::Exited {
            stream_id: self.stream_id.clone(),
            generation: self.generation,
        });
    }

    async fn handle_line(&mut self, line: &str) {
        match classify(line) {
            ProbeSignal::Speed(ratio) => {
                let _ = self.events.send(MonitorEvent::Speed {
                    stream_id: self.stream_id.clone(),
                    generation: self.generation,
                    ratio,
                });
                self.on_speed(ratio).await;
            }
            ProbeSignal::Error(kind) => {
                if self.health.error_tracking_enabled() {
                    log::debug!("[{}] {}: {}", self.stream_id, kind, line);
                    self.on_error(kind).await;
                }
            }
            ProbeSignal::Ignored => {}
        }
    }

    async fn on_speed(&mut self, ratio: f64) {
        let name = self.display_name.read().await.clone();
        match self.health.on_speed(ratio, Instant::now()) {
            SpeedVerdict::Unchanged => {}
            SpeedVerdict::BufferingStarted => {
                log::warn!(
                    "[{}] Buffering detected on {} (speed {:.2}x)",
                    self.stream_id,
                    name,
                    ratio
                );
            }
            SpeedVerdict::SwitchRequested { buffering_for } => {
                log::warn!(
                    "[{}] {} has been buffering for {}s",
                    self.stream_id,
                    name,
                    buffering_for.as_secs()
                );
                let switched = self.switch(SwitchReason::Buffering).await;
                self.health.on_buffer_switch(switched, Instant::now());
            }
            SpeedVerdict::Recovered { buffered_for } => {
                log::info!(
                    "[{}] {} recovered after {}s of buffering",
                    self.stream_id,
                    name,
                    buffered_for.as_secs()
                );
            }
        }
    }

    async fn on_error(&mut self, kind: DecodeErrorKind) {
        match self.health.on_error(Instant::now()) {
            ErrorVerdict::Disabled | ErrorVerdict::Counted { .. } => {}
            ErrorVerdict::CooldownActive { count } => {
                log::info!(
                    "[{}] {} decoder errors ({}), switch on cooldown",
                    self.stream_id,
                    count,
                    kind
                );
            }
            ErrorVerdict::SwitchRequested { count } => {
                log::warn!(
                    "[{}] {} decoder errors ({}), switching",
                    self.stream_id,
                    count,
                    kind
                );
                let switched = self.switch(SwitchReason::DecoderErrors).await;
                self.health.on_error_switch(switched, Instant::now());
            }
        }
    }

    async fn switch(&mut self, reason: SwitchReason) -> bool {
        match self.switcher.try_switch(&self.stream_id, reason).await {
            SwitchOutcome::Switched { display_name } => {
                if let Some(name) = display_name {
                    *self.display_name.write().await = name;
                }
                true
            }
            SwitchOutcome::Failed => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use stream_backend::StreamSnapshot;

    use crate::switcher::tests::FakeBackend;

    fn fast_thresholds(error_threshold: u32) -> HealthThresholds {
        HealthThresholds {
            buffer_time_threshold: Duration::ZERO,
            error_threshold,
            ..Default::default()
        }
    }

    async fn run_monitor(
        output: &'static [u8],
        thresholds: HealthThresholds,
        backend: Arc<FakeBackend>,
    ) -> (Arc<RwLock<String>>, Vec<MonitorEvent>) {
        let name = Arc::new(RwLock::new("Sports 1 [A]".to_string()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let switcher = Arc::new(Switcher::new(backend, None));
        StreamMonitor::new("12", 7, name.clone(), thresholds, switcher, tx)
            .run(output)
            .await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (name, events)
    }

    #[tokio::test]
    async fn test_buffering_switches_once_and_renames() {
        let backend = FakeBackend::new(vec![StreamSnapshot::new("12", "Sports 1 [A]", ["VLC"])]);
        backend.rename_on_switch("Sports 1 [B]");

        let (name, events) = run_monitor(
            b"speed=0.5x\nspeed=0.4x\nspeed=0.4x\n",
            fast_thresholds(0),
            backend.clone(),
        )
        .await;

        assert_eq!(backend.switch_calls(), vec!["12"]);
        assert_eq!(*name.read().await, "Sports 1 [B]");
        assert_eq!(events.len(), 4);
        assert_eq!(
            events.last(),
            Some(&MonitorEvent::Exited {
                stream_id: "12".to_string(),
                generation: 7
            })
        );
    }

    #[tokio::test]
    async fn test_carriage_return_separated_stats() {
        let backend = FakeBackend::new(vec![]);
        let (_, events) = run_monitor(
            b"frame=1 speed=1.2x\rframe=2 speed=0.9x\r\n",
            HealthThresholds::default(),
            backend,
        )
        .await;
        let ratios: Vec<f64> = events
            .iter()
            .filter_map(|event| match event {
                MonitorEvent::Speed { ratio, .. } => Some(*ratio),
                _ => None,
            })
            .collect();
        assert_eq!(ratios, vec![1.2, 0.9]);
    }

    #[tokio::test]
    async fn test_decoder_errors_switch_when_enabled() {
        let backend = FakeBackend::new(vec![]);
        run_monitor(
            b"[h264 @ 0x1] corrupt decoded frame\n[h264 @ 0x1] error while decoding MB 1 2\n[h264 @ 0x1] corrupt decoded frame\n",
            fast_thresholds(2),
            backend.clone(),
        )
        .await;
        // the counter starts over after a successful switch
        assert_eq!(backend.switch_calls(), vec!["12"]);
    }

    #[tokio::test]
    async fn test_decoder_errors_ignored_when_disabled() {
        let backend = FakeBackend::new(vec![]);
        run_monitor(
            b"corrupt decoded frame\ncorrupt decoded frame\ncorrupt decoded frame\n",
            fast_thresholds(0),
            backend.clone(),
        )
        .await;
        assert!(backend.switch_calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_switch_keeps_name() {
        let backend = FakeBackend::new(vec![]);
        backend.set_switch_result(Ok(false));
        let (name, _) = run_monitor(b"speed=0.5x\nspeed=0.5x\n", fast_thresholds(0), backend.clone())
            .await;
        assert_eq!(backend.switch_calls(), vec!["12"]);
        assert_eq!(*name.read().await, "Sports 1 [A]");
    }
}
