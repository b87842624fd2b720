// src/detection/state_machine.rs
//
// Warning episode timing. An episode opens on the first qualifying frame
// and closes on whichever comes first:
//   - detection window: no qualifying frame for `detection_window_secs`
//   - duration cap: the episode has lasted `warning_duration_secs`
// Both checks run on every frame while the episode is active. The window
// is checked before a trigger is applied: a qualifying frame that arrives
// after the window has lapsed only closes the old episode, and the next
// qualifying frame opens a new one.

use serde::Serialize;
use tracing::{info, warn};

pub const DEFAULT_WARNING_DURATION_SECS: f64 = 15.0;
pub const DEFAULT_DETECTION_WINDOW_SECS: f64 = 30.0;
const REMINDER_INTERVAL_SECS: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningState {
    Idle,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearReason {
    DetectionWindowExpired,
    WarningDurationExceeded,
}

impl ClearReason {
    pub fn message(&self) -> &'static str {
        match self {
            Self::DetectionWindowExpired => "Warning cleared: Detection window time exceeded",
            Self::WarningDurationExceeded => "Warning cleared: Warning duration exceeded",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub warning_duration_secs: f64,
    pub detection_window_secs: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            warning_duration_secs: DEFAULT_WARNING_DURATION_SECS,
            detection_window_secs: DEFAULT_DETECTION_WINDOW_SECS,
        }
    }
}

/// What a single `observe` call did to the episode.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WarningUpdate {
    pub started: bool,
    pub refreshed: bool,
    pub cleared: Option<ClearReason>,
}

#[derive(Debug, Clone)]
pub struct WarningEpisode {
    pub active: bool,
    pub episode_start: f64,
    pub last_trigger: f64,
    pub message: String,
}

pub struct WarningStateMachine {
    config: Config,
    episode: WarningEpisode,
    last_reminder: f64,
}

impl WarningStateMachine {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            episode: WarningEpisode {
                active: false,
                episode_start: 0.0,
                last_trigger: 0.0,
                message: String::new(),
            },
            last_reminder: 0.0,
        }
    }

    pub fn state(&self) -> WarningState {
        if self.episode.active {
            WarningState::Active
        } else {
            WarningState::Idle
        }
    }

    pub fn is_active(&self) -> bool {
        self.episode.active
    }

    pub fn episode(&self) -> &WarningEpisode {
        &self.episode
    }

    /// Feed one frame. `now` is wall-clock seconds.
    pub fn observe(&mut self, qualifying: bool, ratio: f32, now: f64) -> WarningUpdate {
        let mut update = WarningUpdate::default();

        if let Some(reason) = self.expire_lapsed(now) {
            update.cleared = Some(reason);
            return update;
        }

        if qualifying {
            self.episode.last_trigger = now;
            if self.episode.active {
                update.refreshed = true;
            } else {
                self.episode.active = true;
                self.episode.episode_start = now;
                self.episode.message = format!(
                    "Warning: Drowning danger detected! Overlap ratio: {:.2}",
                    ratio
                );
                self.last_reminder = now;
                warn!("🚨 {}", self.episode.message);
                update.started = true;
            }
        }

        if self.episode.active {
            if now - self.last_reminder >= REMINDER_INTERVAL_SECS {
                warn!("🚨 {}", self.episode.message);
                self.last_reminder = now;
            }

            if now - self.episode.episode_start > self.config.warning_duration_secs {
                update.cleared = Some(self.clear(ClearReason::WarningDurationExceeded));
            }
        }

        update
    }

    /// Close the episode if no qualifying frame arrived within the window.
    pub fn expire_lapsed(&mut self, now: f64) -> Option<ClearReason> {
        if self.episode.active && now - self.episode.last_trigger > self.config.detection_window_secs {
            Some(self.clear(ClearReason::DetectionWindowExpired))
        } else {
            None
        }
    }

    fn clear(&mut self, reason: ClearReason) -> ClearReason {
        self.episode.active = false;
        self.episode.message = reason.message().to_string();
        info!("✓ {}", self.episode.message);
        reason
    }
}
