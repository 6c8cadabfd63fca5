//! Background supervisor for a running session.
//!
//! One thread per session samples [`SessionProgress`] every check interval
//! and reports a stall once. A suspected loop is first put to the configured
//! [`StallAnalyzer`], if any. The control loop owns the decision to cancel.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

use crate::core::monitor::{Classification, StallDetector, StallPolicy, StallReason};
use crate::io::analyzer::{Analysis, AnalysisRequest, StallAnalyzer};
use crate::io::config::PlanConfig;
use crate::io::session::SessionProgress;

/// Assistant output shown to the analyzer.
const TRANSCRIPT_FOR_ANALYSIS: usize = 4 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub check_interval: Duration,
    pub policy: StallPolicy,
}

impl MonitorConfig {
    pub fn from_config(config: &PlanConfig) -> Self {
        Self {
            check_interval: config.monitor.check_interval(),
            policy: config.monitor.stall_policy(),
        }
    }
}

/// What the supervisor saw over the life of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub checks: u32,
    pub stall: Option<StallReason>,
}

/// Who to ask before cancelling a suspected loop.
#[derive(Debug, Clone)]
pub struct Escalation {
    pub analyzer: Arc<dyn StallAnalyzer>,
    pub workdir: PathBuf,
    pub description: String,
}

pub struct MonitorHandle {
    stop_tx: Sender<()>,
    stall_rx: Receiver<StallReason>,
    thread: JoinHandle<MonitorReport>,
}

/// Start supervising `progress` on a background thread.
pub fn spawn_monitor(
    progress: Arc<SessionProgress>,
    config: MonitorConfig,
    task_id: &str,
    escalation: Option<Escalation>,
) -> Result<MonitorHandle> {
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let (stall_tx, stall_rx) = mpsc::channel::<StallReason>();
    let task_id = task_id.to_string();
    let thread = thread::Builder::new()
        .name(format!("planloop-monitor-{task_id}"))
        .spawn(move || {
            supervise(
                &progress,
                config,
                &task_id,
                escalation.as_ref(),
                &stop_rx,
                &stall_tx,
            )
        })
        .context("spawn monitor thread")?;
    Ok(MonitorHandle {
        stop_tx,
        stall_rx,
        thread,
    })
}

impl MonitorHandle {
    /// A stall reported since the last call, if any.
    pub fn intervention(&self) -> Option<StallReason> {
        self.stall_rx.try_recv().ok()
    }

    /// Stop the supervisor and wait for it to exit.
    pub fn stop(self) -> Result<MonitorReport> {
        // The thread may already be gone after reporting a stall.
        let _ = self.stop_tx.send(());
        self.thread
            .join()
            .map_err(|_| anyhow!("monitor thread panicked"))
    }
}

fn supervise(
    progress: &SessionProgress,
    config: MonitorConfig,
    task_id: &str,
    escalation: Option<&Escalation>,
    stop_rx: &Receiver<()>,
    stall_tx: &Sender<StallReason>,
) -> MonitorReport {
    let started = Instant::now();
    let mut detector = StallDetector::new(config.policy);
    let mut report = MonitorReport::default();
    loop {
        match stop_rx.recv_timeout(config.check_interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return report,
            Err(RecvTimeoutError::Timeout) => {}
        }
        report.checks += 1;
        let probe = progress.probe();
        match detector.observe(&probe) {
            Classification::Productive => debug!(task_id, "session productive"),
            Classification::IdleButPlausible { idle_checks } => {
                info!(task_id, idle_checks, "session idle");
            }
            Classification::Stalled(reason) => {
                let reason = match (escalation, reason) {
                    (Some(escalation), suspicion @ StallReason::Looping { .. }) => {
                        let transcript = progress.recent_transcript(TRANSCRIPT_FOR_ANALYSIS);
                        let request = AnalysisRequest {
                            workdir: &escalation.workdir,
                            task_id,
                            description: &escalation.description,
                            elapsed: started.elapsed(),
                            checks: report.checks,
                            suspicion: &suspicion,
                            recent_tools: &probe.recent_tools,
                            transcript_tail: &transcript,
                        };
                        let Some(analysis) = second_opinion(escalation.analyzer.as_ref(), &request)
                        else {
                            detector.excuse_loop(&probe);
                            continue;
                        };
                        StallReason::Confirmed {
                            suspicion: Box::new(suspicion),
                            analysis,
                        }
                    }
                    (_, reason) => reason,
                };
                warn!(task_id, reason = %reason, "session stalled");
                report.stall = Some(reason.clone());
                let _ = stall_tx.send(reason);
                return report;
            }
        }
    }
}

/// `Some(analysis)` when the analyzer wants the session stopped.
fn second_opinion(analyzer: &dyn StallAnalyzer, request: &AnalysisRequest<'_>) -> Option<String> {
    match analyzer.analyze(request) {
        Ok(Analysis::Intervene { reason, suggestion }) => Some(match suggestion {
            Some(suggestion) => format!("{reason} (suggestion: {suggestion})"),
            None => reason,
        }),
        Ok(Analysis::Continue { reason }) => {
            info!(task_id = request.task_id, reason = %reason, "analyzer let the session continue");
            None
        }
        Err(err) => {
            warn!(
                task_id = request.task_id,
                err = %format!("{err:#}"),
                "stall analysis failed, letting the session continue"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedAnalyzer;

    fn fast_config(idle: u32) -> MonitorConfig {
        MonitorConfig {
            check_interval: Duration::from_millis(10),
            policy: StallPolicy {
                stall_after_idle_checks: idle,
                ..StallPolicy::default()
            },
        }
    }

    fn wait_for_intervention(handle: &MonitorHandle) -> StallReason {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(reason) = handle.intervention() {
                return reason;
            }
            assert!(Instant::now() < deadline, "no intervention");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn silent_session_is_reported_idle() {
        let progress = Arc::new(SessionProgress::new());
        let handle =
            spawn_monitor(Arc::clone(&progress), fast_config(2), "1", None).expect("spawn");

        assert_eq!(wait_for_intervention(&handle), StallReason::Idle { checks: 2 });
        let report = handle.stop().expect("stop");
        assert_eq!(report.checks, 2);
        assert_eq!(report.stall, Some(StallReason::Idle { checks: 2 }));
    }

    #[test]
    fn blocked_marker_is_reported() {
        let progress = Arc::new(SessionProgress::new());
        progress.record_line("TASK_BLOCKED: missing credentials");
        let handle =
            spawn_monitor(Arc::clone(&progress), fast_config(100), "1", None).expect("spawn");

        assert_eq!(
            wait_for_intervention(&handle),
            StallReason::Blocked("missing credentials".to_string())
        );
        handle.stop().expect("stop");
    }

    #[test]
    fn stop_before_first_check_reports_nothing() {
        let progress = Arc::new(SessionProgress::new());
        let config = MonitorConfig {
            check_interval: Duration::from_secs(60),
            policy: StallPolicy::default(),
        };
        let handle = spawn_monitor(progress, config, "1", None).expect("spawn");

        let report = handle.stop().expect("stop");
        assert_eq!(report, MonitorReport::default());
    }

    fn looping_progress() -> Arc<SessionProgress> {
        let progress = Arc::new(SessionProgress::new());
        for _ in 0..10 {
            progress.record_line(
                r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"cargo test"}}]}}"#,
            );
        }
        progress
    }

    fn escalation(analyzer: &Arc<ScriptedAnalyzer>) -> Escalation {
        Escalation {
            analyzer: Arc::clone(analyzer) as Arc<dyn StallAnalyzer>,
            workdir: PathBuf::from("."),
            description: "task 1".to_string(),
        }
    }

    #[test]
    fn analyzer_confirms_suspected_loop() {
        let analyzer = Arc::new(ScriptedAnalyzer::new(vec![Analysis::Intervene {
            reason: "same test over and over".to_string(),
            suggestion: None,
        }]));
        let handle = spawn_monitor(
            looping_progress(),
            fast_config(100),
            "1",
            Some(escalation(&analyzer)),
        )
        .expect("spawn");

        let reason = wait_for_intervention(&handle);
        handle.stop().expect("stop");

        assert!(matches!(
            &reason,
            StallReason::Confirmed { suspicion, analysis }
                if matches!(**suspicion, StallReason::Looping { unique: 1, .. })
                    && analysis == "same test over and over"
        ));
        assert_eq!(analyzer.calls(), 1);
    }

    /// Verifies a loop the analyzer accepts keeps running and is not
    /// re-analyzed without new activity.
    #[test]
    fn analyzer_can_let_a_loop_continue() {
        let analyzer = Arc::new(ScriptedAnalyzer::new(vec![Analysis::Continue {
            reason: "test output is changing".to_string(),
        }]));
        let progress = looping_progress();
        let handle = spawn_monitor(
            Arc::clone(&progress),
            fast_config(1000),
            "1",
            Some(escalation(&analyzer)),
        )
        .expect("spawn");

        let deadline = Instant::now() + Duration::from_secs(10);
        while analyzer.calls() == 0 {
            assert!(Instant::now() < deadline, "analyzer never asked");
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(100));

        assert_eq!(handle.intervention(), None);
        let report = handle.stop().expect("stop");
        assert_eq!(report.stall, None);
        assert_eq!(analyzer.calls(), 1);
    }
}
