//! Launch guard
//!
//! Prevents a second agent process for an issue. A launch is denied when
//! any of these says "busy":
//! - the cooldown since the last recorded launch has not elapsed
//! - the issue's registered pid is still alive
//! - the issue's agent log was written recently
//!
//! The liveness checks cover processes started outside the guard (manual
//! restarts), so they win over a stale cooldown record.
//!
//! [`try_claim`](LaunchGuard::try_claim) only holds a pending claim while the
//! launcher runs. Cooldown records are written by
//! [`record_launch`](LaunchGuard::record_launch) alone, which also settles
//! the claim.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use crate::process::Liveness;
use crate::store::LaunchRegistry;

/// Log writes newer than this mean an agent is still working
pub const LOG_ACTIVITY_WINDOW: Duration = Duration::from_secs(120);

/// Why a launch was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    Cooldown { agent_type: String, remaining_secs: u64 },
    LaunchInProgress { agent_type: String },
    ProcessAlive { pid: u32 },
    RecentLogActivity { age_secs: u64 },
}

impl std::fmt::Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Denial::Cooldown {
                agent_type,
                remaining_secs,
            } => write!(
                f,
                "@{} launched recently ({}s of cooldown left)",
                agent_type, remaining_secs
            ),
            Denial::LaunchInProgress { agent_type } => {
                write!(f, "launch of @{} is already in progress", agent_type)
            }
            Denial::ProcessAlive { pid } => write!(f, "agent process {} is still running", pid),
            Denial::RecentLogActivity { age_secs } => {
                write!(f, "agent log was written {}s ago", age_secs)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct LaunchRecord {
    agent_type: String,
    at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Slots {
    /// Last recorded launch per issue
    launches: HashMap<String, LaunchRecord>,
    /// Claims for launches still in flight
    claims: HashMap<String, LaunchRecord>,
}

/// Cooldown plus liveness gate in front of every launch
pub struct LaunchGuard {
    cooldown: Duration,
    log_window: Duration,
    liveness: Arc<dyn Liveness>,
    slots: Mutex<Slots>,
}

impl LaunchGuard {
    pub fn new(cooldown: Duration, liveness: Arc<dyn Liveness>) -> Self {
        Self {
            cooldown,
            log_window: LOG_ACTIVITY_WINDOW,
            liveness,
            slots: Mutex::new(Slots::default()),
        }
    }

    /// Carry cooldowns over from the persisted registry, e.g. after a restart
    pub fn seed_from_registry(&self, registry: &LaunchRegistry) {
        let mut slots = self.lock();
        for (issue, entry) in registry.entries() {
            slots.launches.insert(
                issue,
                LaunchRecord {
                    agent_type: entry.agent_type,
                    at: entry.timestamp,
                },
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        // A poisoned map only means another thread panicked mid-insert
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn elapsed(record: &LaunchRecord, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(record.at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    fn evaluate(&self, slots: &Slots, issue: &str, now: DateTime<Utc>) -> Option<Denial> {
        // A claim that outlives the cooldown belongs to a launch that never reported back
        if let Some(claim) = slots.claims.get(issue) {
            if Self::elapsed(claim, now) < self.cooldown {
                return Some(Denial::LaunchInProgress {
                    agent_type: claim.agent_type.clone(),
                });
            }
        }

        if let Some(record) = slots.launches.get(issue) {
            let elapsed = Self::elapsed(record, now);
            if elapsed < self.cooldown {
                return Some(Denial::Cooldown {
                    agent_type: record.agent_type.clone(),
                    remaining_secs: (self.cooldown - elapsed).as_secs(),
                });
            }
        }

        if let Some(pid) = self.liveness.running_pid(issue) {
            return Some(Denial::ProcessAlive { pid });
        }

        if let Some(modified) = self.liveness.last_log_activity(issue) {
            let age = now
                .signed_duration_since(modified)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age < self.log_window {
                return Some(Denial::RecentLogActivity {
                    age_secs: age.as_secs(),
                });
            }
        }

        None
    }

    /// Reason the launch would be refused at `now`, if any
    pub fn check_at(&self, issue: &str, agent_type: &str, now: DateTime<Utc>) -> Option<Denial> {
        let denial = self.evaluate(&self.lock(), issue, now);
        if let Some(reason) = &denial {
            debug!("Launch of @{} for issue #{} denied: {}", agent_type, issue, reason);
        }
        denial
    }

    pub fn can_launch_at(&self, issue: &str, agent_type: &str, now: DateTime<Utc>) -> bool {
        self.check_at(issue, agent_type, now).is_none()
    }

    pub fn can_launch(&self, issue: &str, agent_type: &str) -> bool {
        self.can_launch_at(issue, agent_type, Utc::now())
    }

    /// Check and claim in a single critical section. The claim blocks other
    /// launches until [`record_launch`](Self::record_launch) settles it,
    /// [`clear`](Self::clear) drops it, or the cooldown runs out. It is not a
    /// cooldown record.
    pub fn try_claim(&self, issue: &str, agent_type: &str) -> Result<(), Denial> {
        let now = Utc::now();
        let mut slots = self.lock();
        if let Some(denial) = self.evaluate(&slots, issue, now) {
            debug!("Launch of @{} for issue #{} denied: {}", agent_type, issue, denial);
            return Err(denial);
        }
        slots.claims.insert(
            issue.to_string(),
            LaunchRecord {
                agent_type: agent_type.to_string(),
                at: now,
            },
        );
        Ok(())
    }

    pub fn record_launch_at(&self, issue: &str, agent_type: &str, pid: u32, at: DateTime<Utc>) {
        debug!("Recorded launch of @{} (pid {}) for issue #{}", agent_type, pid, issue);
        let mut slots = self.lock();
        slots.claims.remove(issue);
        slots.launches.insert(
            issue.to_string(),
            LaunchRecord {
                agent_type: agent_type.to_string(),
                at,
            },
        );
    }

    /// Record a successful launch
    pub fn record_launch(&self, issue: &str, agent_type: &str, pid: u32) {
        self.record_launch_at(issue, agent_type, pid, Utc::now());
    }

    /// Forget the cooldown and any pending claim for an issue
    pub fn clear(&self, issue: &str) {
        let mut slots = self.lock();
        slots.claims.remove(issue);
        slots.launches.remove(issue);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeLiveness {
        pid: Option<u32>,
        log_at: Option<DateTime<Utc>>,
    }

    impl Liveness for FakeLiveness {
        fn running_pid(&self, _issue: &str) -> Option<u32> {
            self.pid
        }

        fn last_log_activity(&self, _issue: &str) -> Option<DateTime<Utc>> {
            self.log_at
        }
    }

    fn guard(liveness: FakeLiveness) -> LaunchGuard {
        LaunchGuard::new(Duration::from_secs(120), Arc::new(liveness))
    }

    #[test]
    fn test_cooldown_window() {
        let guard = guard(FakeLiveness::default());
        let t = Utc::now();
        assert!(guard.can_launch_at("100", "Triage", t));

        guard.record_launch_at("100", "Triage", 4242, t);
        for secs in [1, 60, 119] {
            let at = t + chrono::Duration::seconds(secs);
            assert!(!guard.can_launch_at("100", "Triage", at), "T+{}s", secs);
        }
        assert!(guard.can_launch_at("100", "Triage", t + chrono::Duration::seconds(121)));

        // Other issues are unaffected
        assert!(guard.can_launch_at("101", "Triage", t + chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_live_process_denies_without_record() {
        let guard = guard(FakeLiveness {
            pid: Some(77),
            log_at: None,
        });
        assert_eq!(
            guard.check_at("5", "Design", Utc::now()),
            Some(Denial::ProcessAlive { pid: 77 })
        );
    }

    #[test]
    fn test_recent_log_denies() {
        let now = Utc::now();
        let guard = guard(FakeLiveness {
            pid: None,
            log_at: Some(now - chrono::Duration::seconds(30)),
        });
        assert!(matches!(
            guard.check_at("5", "Design", now),
            Some(Denial::RecentLogActivity { age_secs: 30 })
        ));
        assert!(guard.can_launch_at("5", "Design", now + chrono::Duration::seconds(200)));
    }

    #[test]
    fn test_try_claim_blocks_second_claim() {
        let guard = guard(FakeLiveness::default());
        assert!(guard.try_claim("9", "Implement").is_ok());
        assert!(matches!(
            guard.try_claim("9", "Implement"),
            Err(Denial::LaunchInProgress { .. })
        ));

        guard.clear("9");
        assert!(guard.try_claim("9", "Implement").is_ok());
    }

    #[test]
    fn test_claim_is_settled_by_record_launch() {
        let guard = guard(FakeLiveness::default());
        let t = Utc::now();
        guard.try_claim("12", "Design").unwrap();
        assert!(matches!(
            guard.check_at("12", "Design", t),
            Some(Denial::LaunchInProgress { .. })
        ));

        guard.record_launch_at("12", "Design", 99, t);
        assert!(matches!(
            guard.check_at("12", "Design", t + chrono::Duration::seconds(1)),
            Some(Denial::Cooldown { .. })
        ));
        assert!(guard.can_launch_at("12", "Design", t + chrono::Duration::seconds(121)));
    }

    #[test]
    fn test_stale_claim_expires() {
        let guard = guard(FakeLiveness::default());
        guard.try_claim("13", "Design").unwrap();
        assert!(guard.can_launch_at("13", "Design", Utc::now() + chrono::Duration::seconds(121)));
    }
}
