//! Pure stall classification for running sessions.
//!
//! The supervisor thread samples a [`ProgressProbe`] every check interval and
//! feeds it to a [`StallDetector`]. The detector only looks at what changed
//! since the previous sample, so it is deterministic given a probe sequence.

use std::collections::HashSet;
use std::fmt;

/// Snapshot of a session's observable activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressProbe {
    /// Monotonic count of events seen on the session stream.
    pub event_count: u64,
    /// Most recent tool invocations, oldest first.
    pub recent_tools: Vec<String>,
    /// Set when the session announced it cannot continue.
    pub blocked: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StallReason {
    Idle { checks: u32 },
    Blocked(String),
    Looping { window: usize, unique: usize },
    /// A suspicion the stall analyzer agreed with.
    Confirmed {
        suspicion: Box<StallReason>,
        analysis: String,
    },
}

impl fmt::Display for StallReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StallReason::Idle { checks } => {
                write!(f, "no session activity for {checks} consecutive checks")
            }
            StallReason::Blocked(reason) => write!(f, "session reported blocked: {reason}"),
            StallReason::Looping { window, unique } => write!(
                f,
                "repeating tool calls: last {window} calls use only {unique} distinct signatures"
            ),
            StallReason::Confirmed {
                suspicion,
                analysis,
            } => write!(f, "{suspicion}; analyzer: {analysis}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Productive,
    IdleButPlausible { idle_checks: u32 },
    Stalled(StallReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallPolicy {
    /// Consecutive idle checks before a session counts as stalled (>= 1).
    pub stall_after_idle_checks: u32,
    /// Number of recent tool calls inspected for repetition.
    pub loop_window: usize,
    /// A full window with at most this many distinct calls is a loop.
    pub loop_max_unique: usize,
}

impl Default for StallPolicy {
    fn default() -> Self {
        Self {
            stall_after_idle_checks: 3,
            loop_window: 10,
            loop_max_unique: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StallDetector {
    policy: StallPolicy,
    last_event_count: u64,
    idle_checks: u32,
    /// Loop detection is off until the event count reaches this.
    loop_excused_until: u64,
}

impl StallDetector {
    pub fn new(policy: StallPolicy) -> Self {
        Self {
            policy,
            last_event_count: 0,
            idle_checks: 0,
            loop_excused_until: 0,
        }
    }

    /// Accept the current tool pattern: no loop is reported again until
    /// another `loop_window` events have arrived.
    pub fn excuse_loop(&mut self, probe: &ProgressProbe) {
        self.loop_excused_until = probe.event_count + self.policy.loop_window as u64;
    }

    pub fn observe(&mut self, probe: &ProgressProbe) -> Classification {
        if let Some(reason) = &probe.blocked {
            return Classification::Stalled(StallReason::Blocked(reason.clone()));
        }

        if probe.event_count > self.last_event_count {
            self.last_event_count = probe.event_count;
            self.idle_checks = 0;
            if probe.event_count >= self.loop_excused_until
                && let Some(unique) = self.looping(&probe.recent_tools)
            {
                return Classification::Stalled(StallReason::Looping {
                    window: self.policy.loop_window,
                    unique,
                });
            }
            return Classification::Productive;
        }

        self.idle_checks += 1;
        if self.idle_checks >= self.policy.stall_after_idle_checks {
            Classification::Stalled(StallReason::Idle {
                checks: self.idle_checks,
            })
        } else {
            Classification::IdleButPlausible {
                idle_checks: self.idle_checks,
            }
        }
    }

    fn looping(&self, tools: &[String]) -> Option<usize> {
        let window = self.policy.loop_window;
        if window == 0 || tools.len() < window {
            return None;
        }
        let unique: HashSet<&str> = tools[tools.len() - window..]
            .iter()
            .map(String::as_str)
            .collect();
        (unique.len() <= self.policy.loop_max_unique).then_some(unique.len())
    }
}
