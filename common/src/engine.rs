use chrono::{DateTime, FixedOffset};

use crate::{config::SupervisorConfig, schedule::Schedule};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    Inactivity,
    UpdateInstalled,
}

impl RestartReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inactivity => "inactivity",
            Self::UpdateInstalled => "update installed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineAction {
    FeedWatchdog,
    SetRelay(bool),
    CheckUpdate,
    Restart(RestartReason),
}

/// Decides what the supervisor loop does next. The platform feeds it time and
/// executes the returned actions in order.
#[derive(Debug, Clone)]
pub struct ControlEngine {
    pub config: SupervisorConfig,
    update_recheck_ms: Option<u64>,

    relay_on: bool,
    last_tick_ms: Option<u64>,
    last_feed_ms: Option<u64>,
    last_activity_ms: u64,
    last_update_check_ms: u64,
    schedule_dirty: bool,
    restart_requested: Option<RestartReason>,
}

impl ControlEngine {
    /// `update_recheck_secs` of 0 leaves update checks to the boot sequence.
    pub fn new(mut config: SupervisorConfig, update_recheck_secs: u64, now_ms: u64) -> Self {
        config.sanitize();
        Self {
            config,
            update_recheck_ms: (update_recheck_secs > 0)
                .then(|| update_recheck_secs.saturating_mul(1_000)),
            relay_on: false,
            last_tick_ms: None,
            last_feed_ms: None,
            last_activity_ms: now_ms,
            last_update_check_ms: now_ms,
            schedule_dirty: false,
            restart_requested: None,
        }
    }

    pub fn relay_on(&self) -> bool {
        self.relay_on
    }

    pub fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_activity_ms)
    }

    pub fn restart_requested(&self) -> Option<RestartReason> {
        self.restart_requested
    }

    /// An accepted API request resets the inactivity timer.
    pub fn note_activity(&mut self, now_ms: u64) {
        self.last_activity_ms = now_ms;
    }

    /// Re-evaluate on the next poll instead of waiting for the tick.
    pub fn schedule_changed(&mut self) {
        self.schedule_dirty = true;
    }

    pub fn poll(
        &mut self,
        now_ms: u64,
        local: Option<DateTime<FixedOffset>>,
        schedule: &Schedule,
    ) -> Vec<EngineAction> {
        let mut actions = Vec::new();

        if self.restart_requested.is_some() {
            // Keep the watchdog quiet while the platform is going down.
            self.feed_if_due(now_ms, &mut actions);
            return actions;
        }

        if self.tick_due(now_ms) {
            self.maintenance(now_ms, local, schedule, &mut actions);
        } else {
            self.feed_if_due(now_ms, &mut actions);
        }

        if let Some(interval) = self.update_recheck_ms {
            if now_ms.saturating_sub(self.last_update_check_ms) >= interval {
                self.last_update_check_ms = now_ms;
                actions.push(EngineAction::CheckUpdate);
            }
        }

        actions
    }

    fn tick_due(&self, now_ms: u64) -> bool {
        self.schedule_dirty
            || self
                .last_tick_ms
                .map_or(true, |last| now_ms.saturating_sub(last) >= self.config.tick_interval_ms)
    }

    fn feed_if_due(&mut self, now_ms: u64, actions: &mut Vec<EngineAction>) {
        let due = self.last_feed_ms.map_or(true, |last| {
            now_ms.saturating_sub(last) >= self.config.watchdog_feed_interval_ms
        });
        if due {
            self.feed(now_ms, actions);
        }
    }

    fn feed(&mut self, now_ms: u64, actions: &mut Vec<EngineAction>) {
        self.last_feed_ms = Some(now_ms);
        actions.push(EngineAction::FeedWatchdog);
    }

    // Feed first so a slow evaluation cannot starve the watchdog this tick.
    fn maintenance(
        &mut self,
        now_ms: u64,
        local: Option<DateTime<FixedOffset>>,
        schedule: &Schedule,
        actions: &mut Vec<EngineAction>,
    ) {
        self.last_tick_ms = Some(now_ms);
        self.schedule_dirty = false;
        self.feed(now_ms, actions);
        self.evaluate_schedule(local, schedule, actions);
        self.check_inactivity(now_ms, actions);
    }

    fn evaluate_schedule(
        &mut self,
        local: Option<DateTime<FixedOffset>>,
        schedule: &Schedule,
        actions: &mut Vec<EngineAction>,
    ) {
        let Some(local) = local else {
            return;
        };
        if let Some(on) = schedule.relay_state(&local) {
            self.relay_on = on;
            actions.push(EngineAction::SetRelay(on));
        }
    }

    fn check_inactivity(&mut self, now_ms: u64, actions: &mut Vec<EngineAction>) {
        let limit_ms = self.config.inactivity_timeout_secs.saturating_mul(1_000);
        if self.idle_ms(now_ms) >= limit_ms {
            self.relay_on = false;
            self.restart_requested = Some(RestartReason::Inactivity);
            actions.push(EngineAction::SetRelay(false));
            actions.push(EngineAction::Restart(RestartReason::Inactivity));
        }
    }
}
