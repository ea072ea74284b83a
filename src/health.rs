use std::time::{Duration, Instant};

use crate::config::Config;

#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    pub speed_threshold: f64,
    pub buffer_time_threshold: Duration,
    /// Grace window added after a buffering switch before another is considered
    pub buffer_extension: Duration,
    /// 0 disables decoder error tracking
    pub error_threshold: u32,
    pub error_reset_window: Duration,
    pub error_switch_cooldown: Duration,
}

impl HealthThresholds {
    pub fn from_config(config: &Config) -> Self {
        Self {
            speed_threshold: config.buffer_speed_threshold,
            buffer_time_threshold: Duration::from_secs(config.buffer_time_threshold),
            buffer_extension: Duration::from_secs(config.buffer_extension_time),
            error_threshold: config.error_threshold,
            error_reset_window: Duration::from_secs(config.error_reset_time),
            error_switch_cooldown: Duration::from_secs(config.error_switch_cooldown),
        }
    }
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Buffering,
    SwitchPending,
}

/// What the caller has to do after feeding a speed reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpeedVerdict {
    Unchanged,
    BufferingStarted,
    /// Buffering outlasted the threshold; `buffering_for` covers the whole episode
    SwitchRequested { buffering_for: Duration },
    Recovered { buffered_for: Duration },
}

/// What the caller has to do after feeding a decoder error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorVerdict {
    Disabled,
    Counted { count: u32 },
    CooldownActive { count: u32 },
    SwitchRequested { count: u32 },
}

/// Buffering and decoder-error bookkeeping for one stream.
///
/// Owned by the stream's monitor task; time is always passed in so the
/// machine stays deterministic.
#[derive(Debug, Clone)]
pub struct StreamHealth {
    thresholds: HealthThresholds,
    state: HealthState,
    last_speed: Option<f64>,
    /// Start of the window the buffering threshold is measured against;
    /// restarted by every successful switch
    buffer_started_at: Option<Instant>,
    /// Extra time added to the threshold after a switch
    grace: Duration,
    /// Start of the buffering episode as observed, for reporting only
    episode_started_at: Option<Instant>,
    switch_in_flight: bool,
    last_switch_at: Option<Instant>,
    error_count: u32,
    error_window_started_at: Option<Instant>,
}

impl StreamHealth {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            thresholds,
            state: HealthState::Healthy,
            last_speed: None,
            buffer_started_at: None,
            grace: Duration::ZERO,
            episode_started_at: None,
            switch_in_flight: false,
            last_switch_at: None,
            error_count: 0,
            error_window_started_at: None,
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn last_speed(&self) -> Option<f64> {
        self.last_speed
    }

    pub fn is_buffering(&self) -> bool {
        self.buffer_started_at.is_some()
    }

    pub fn switch_in_flight(&self) -> bool {
        self.switch_in_flight
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn error_tracking_enabled(&self) -> bool {
        self.thresholds.error_threshold > 0
    }

    pub fn on_speed(&mut self, ratio: f64, now: Instant) -> SpeedVerdict {
        self.last_speed = Some(ratio);

        if ratio >= self.thresholds.speed_threshold {
            self.state = HealthState::Healthy;
            self.switch_in_flight = false;
            self.grace = Duration::ZERO;
            if self.buffer_started_at.take().is_none() {
                return SpeedVerdict::Unchanged;
            }
            let buffered_for = self
                .episode_started_at
                .take()
                .map(|start| now.saturating_duration_since(start))
                .unwrap_or_default();
            return SpeedVerdict::Recovered { buffered_for };
        }

        let Some(buffer_started_at) = self.buffer_started_at else {
            self.buffer_started_at = Some(now);
            self.episode_started_at = Some(now);
            self.state = HealthState::Buffering;
            return SpeedVerdict::BufferingStarted;
        };

        let limit = self.thresholds.buffer_time_threshold.saturating_add(self.grace);
        if now.saturating_duration_since(buffer_started_at) < limit {
            return SpeedVerdict::Unchanged;
        }

        self.state = HealthState::SwitchPending;
        let buffering_for = self
            .episode_started_at
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default();
        SpeedVerdict::SwitchRequested { buffering_for }
    }

    /// Record the outcome of a switch requested by [`StreamHealth::on_speed`].
    pub fn on_buffer_switch(&mut self, switched: bool, now: Instant) {
        if switched {
            self.switch_in_flight = true;
            self.last_switch_at = Some(now);
            self.buffer_started_at = Some(now);
            self.grace = self.thresholds.buffer_extension;
        }
        if self.buffer_started_at.is_some() {
            self.state = HealthState::Buffering;
        }
    }

    pub fn on_error(&mut self, now: Instant) -> ErrorVerdict {
        if !self.error_tracking_enabled() {
            return ErrorVerdict::Disabled;
        }

        self.error_count += 1;
        let window_start = *self.error_window_started_at.get_or_insert(now);
        if now.saturating_duration_since(window_start) > self.thresholds.error_reset_window {
            // too far apart to count as one burst
            self.error_count = 1;
            self.error_window_started_at = Some(now);
        }

        let count = self.error_count;
        if count < self.thresholds.error_threshold {
            return ErrorVerdict::Counted { count };
        }
        let cooling_down = self.last_switch_at.is_some_and(|last| {
            now.saturating_duration_since(last) < self.thresholds.error_switch_cooldown
        });
        if cooling_down {
            ErrorVerdict::CooldownActive { count }
        } else {
            ErrorVerdict::SwitchRequested { count }
        }
    }

    /// Record the outcome of a switch requested by [`StreamHealth::on_error`].
    /// A failed switch keeps the counters so the next error retries.
    pub fn on_error_switch(&mut self, switched: bool, now: Instant) {
        if switched {
            self.error_count = 0;
            self.last_switch_at = Some(now);
        }
    }
}
