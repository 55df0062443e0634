//! Periodic "is the served face still here" check.
//!
//! The frame loop alone cannot end a session whose user walked away while the
//! camera stalled, so this runs on its own clock and forces the `face_lost`
//! transition from the outside.

use crate::session::SessionController;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct LivenessConfig {
    pub tick_interval: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self { tick_interval: Duration::from_secs(1) }
    }
}

pub struct LivenessMonitor {
    config: LivenessConfig,
    controller: Arc<SessionController>,
}

impl LivenessMonitor {
    pub fn new(config: LivenessConfig, controller: Arc<SessionController>) -> Self {
        Self { config, controller }
    }

    /// How often [`tick`](Self::tick) should be driven.
    pub fn interval(&self) -> Duration {
        self.config.tick_interval
    }

    /// One check. Returns true if the served user was declared lost.
    pub fn tick(&self, now: Instant) -> bool {
        let lost = self.controller.check_liveness(now);
        if lost {
            tracing::debug!("liveness tick ended tracking");
        }
        lost
    }
}
