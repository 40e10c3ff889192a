use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Deadline applied to a `send_listen` call when none is given.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay presets a handler may ask for between two attempts of the same command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaitDelay {
    ExtraSlow,
    SuperSlow,
    Slow,
    Normal,
    Fast,
    SuperFast,
    ExtraFast,
}

impl WaitDelay {
    pub const fn as_duration(self) -> Duration {
        match self {
            Self::ExtraSlow => Duration::from_secs(30),
            Self::SuperSlow => Duration::from_secs(10),
            Self::Slow => Duration::from_secs(5),
            Self::Normal => Duration::from_secs(3),
            Self::Fast => Duration::from_secs(1),
            Self::SuperFast => Duration::from_millis(500),
            Self::ExtraFast => Duration::from_millis(100),
        }
    }
}

impl Default for WaitDelay {
    fn default() -> Self {
        Self::Normal
    }
}

/// Per-call options accepted by `send` and `send_listen`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandOptions {
    pub timeout: Option<Duration>,
    pub wait_delay: Option<WaitDelay>,
    pub wait_max_count: Option<u32>,
}

impl CommandOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    /// The effective deadline, falling back to `default`.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }
}
