// Presence reconciliation: a background loop that periodically offers
// presence rewards to recently active users and prunes stale ones.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::chat::{announcement_channels, ChatBoundary};
use crate::gateway::{ActionKind, Backend, RewardOutcome};
use crate::ledger::{ActivityLedger, ActivityRecord};
use crate::metrics;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(900);
pub const DEFAULT_ELIGIBILITY_WINDOW: Duration = Duration::from_secs(1020);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(3600);
pub const DEFAULT_ANNOUNCEMENT_CHANNEL: &str = "general";

/// Slack added on top of the interval when a configured window is too short.
const MISSED_TICK_BUFFER: Duration = Duration::from_secs(120);

/// Reward requests in flight at once during a scan.
const MAX_IN_FLIGHT: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceSettings {
    pub interval: Duration,
    /// Users seen more recently than this are offered a reward.
    pub eligibility_window: Duration,
    /// Users not seen for longer than this leave the ledger.
    pub stale_after: Duration,
    pub announcement_channel: String,
}

impl PresenceSettings {
    /// Build settings, widening the eligibility window past the interval if needed
    /// so that a user active just after one scan is still eligible at the next.
    pub fn new(
        interval: Duration,
        eligibility_window: Duration,
        stale_after: Duration,
        announcement_channel: &str,
    ) -> Self {
        let eligibility_window = if eligibility_window <= interval {
            let widened = interval + MISSED_TICK_BUFFER;
            tracing::warn!(
                "Eligibility window {}s is not above the {}s interval, using {}s",
                eligibility_window.as_secs(),
                interval.as_secs(),
                widened.as_secs()
            );
            widened
        } else {
            eligibility_window
        };
        Self {
            interval,
            eligibility_window,
            stale_after,
            announcement_channel: announcement_channel.to_string(),
        }
    }
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self::new(
            DEFAULT_INTERVAL,
            DEFAULT_ELIGIBILITY_WINDOW,
            DEFAULT_STALE_AFTER,
            DEFAULT_ANNOUNCEMENT_CHANNEL,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPhase {
    Idle,
    Sleeping,
    Scanning,
}

/// Counts from one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub eligible: usize,
    pub granted: usize,
    pub leveled_up: usize,
    pub unreachable: usize,
    pub evicted: usize,
}

pub struct PresenceScheduler {
    ledger: ActivityLedger,
    backend: Arc<dyn Backend>,
    chat: Arc<dyn ChatBoundary>,
    settings: PresenceSettings,
    phase: Mutex<SchedulerPhase>,
}

impl PresenceScheduler {
    pub fn new(
        ledger: ActivityLedger,
        backend: Arc<dyn Backend>,
        chat: Arc<dyn ChatBoundary>,
        settings: PresenceSettings,
    ) -> Self {
        Self {
            ledger,
            backend,
            chat,
            settings,
            phase: Mutex::new(SchedulerPhase::Idle),
        }
    }

    pub fn settings(&self) -> &PresenceSettings {
        &self.settings
    }

    pub fn phase(&self) -> SchedulerPhase {
        *self.phase.lock().unwrap()
    }

    fn set_phase(&self, phase: SchedulerPhase) {
        *self.phase.lock().unwrap() = phase;
    }

    pub fn is_eligible(&self, record: &ActivityRecord, now: DateTime<Utc>) -> bool {
        record.age(now) < self.settings.eligibility_window
    }

    /// Run one reconciliation pass as of `now`.
    ///
    /// Stale users are evicted; every eligible user from the snapshot gets a
    /// presence reward request. Backend calls happen outside the ledger lock.
    pub async fn scan_once(&self, now: DateTime<Utc>) -> ScanReport {
        self.set_phase(SchedulerPhase::Scanning);

        let snapshot = self.ledger.snapshot();
        let evicted = self
            .ledger
            .evict_older_than(now, self.settings.stale_after);
        let eligible: Vec<ActivityRecord> = snapshot
            .into_iter()
            .filter(|r| self.is_eligible(r, now))
            .collect();

        let mut report = ScanReport {
            eligible: eligible.len(),
            evicted: evicted.len(),
            ..Default::default()
        };

        let backend = Arc::clone(&self.backend);
        let outcomes: Vec<(ActivityRecord, RewardOutcome)> = stream::iter(eligible)
            .map(move |record| {
                let backend = Arc::clone(&backend);
                async move {
                    let outcome = backend
                        .request_reward(
                            ActionKind::PresenceActivity,
                            record.user_id,
                            &record.display_name,
                        )
                        .await;
                    (record, outcome)
                }
            })
            .buffer_unordered(MAX_IN_FLIGHT)
            .collect()
            .await;

        let mut announcements = Vec::new();
        for (record, outcome) in outcomes {
            match outcome {
                RewardOutcome::Granted {
                    leveled_up,
                    announce_text,
                    ..
                } => {
                    report.granted += 1;
                    if leveled_up {
                        report.leveled_up += 1;
                        announcements.push(announce_text.unwrap_or_else(|| {
                            format!("🎉 {} leveled up!", record.display_name)
                        }));
                    }
                }
                RewardOutcome::Unreachable => report.unreachable += 1,
                RewardOutcome::OnCooldown { remaining_seconds } => {
                    tracing::debug!("{} on cooldown for {remaining_seconds}s", record.user_id);
                }
                RewardOutcome::Denied { reason } => {
                    tracing::debug!("Presence reward for {} denied: {reason}", record.user_id);
                }
            }
        }

        if !announcements.is_empty() {
            let channels =
                announcement_channels(&*self.chat, &self.settings.announcement_channel).await;
            for text in &announcements {
                for &channel in &channels {
                    if let Err(e) = self.chat.send_text(channel, text).await {
                        tracing::debug!("Level-up announcement to {channel} failed: {e}");
                    }
                }
            }
        }

        metrics::PRESENCE_SCANS_TOTAL.inc();
        tracing::info!(
            "Presence scan: {} eligible, {} granted, {} leveled up, {} unreachable, {} evicted",
            report.eligible,
            report.granted,
            report.leveled_up,
            report.unreachable,
            report.evicted
        );
        self.set_phase(SchedulerPhase::Idle);
        report
    }

    /// Spawn the scan loop. It stops at the next sleep once `shutdown` turns true;
    /// a scan already running is allowed to finish.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                "Presence scheduler started: every {}s, window {}s",
                self.settings.interval.as_secs(),
                self.settings.eligibility_window.as_secs()
            );
            loop {
                if *shutdown.borrow() {
                    break;
                }
                self.set_phase(SchedulerPhase::Sleeping);
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.interval) => {}
                    _ = shutdown.changed() => break,
                }
                self.scan_once(Utc::now()).await;
            }
            self.set_phase(SchedulerPhase::Idle);
            tracing::info!("Presence scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = PresenceSettings::default();
        assert_eq!(settings.interval, Duration::from_secs(900));
        assert_eq!(settings.eligibility_window, Duration::from_secs(1020));
        assert_eq!(settings.stale_after, Duration::from_secs(3600));
        assert_eq!(settings.announcement_channel, "general");
    }

    #[test]
    fn test_short_window_is_widened() {
        let settings = PresenceSettings::new(
            Duration::from_secs(600),
            Duration::from_secs(600),
            Duration::from_secs(3600),
            "general",
        );
        assert_eq!(settings.eligibility_window, Duration::from_secs(720));
    }
}
