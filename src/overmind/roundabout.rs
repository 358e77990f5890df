//! Roundabout: bounded monitoring loop over a running worker.
//!
//! The supervisor agent does not block on a worker; it enters the roundabout,
//! which polls the [`WorkerJob`] and the worker's tool-event stream on a
//! fixed cadence and makes a heuristic decision each tick:
//!
//! 1. worker reached a terminal status → **EXIT** with the completion result;
//! 2. the last completed tool output looks like a final answer → **EXIT**
//!    early with the partial result;
//! 3. the current operation has been stuck past the cancel threshold →
//!    **CANCEL** the job;
//! 4. too many consecutive polls without a single new tool event →
//!    **CANCEL**;
//! 5. otherwise → **WAIT**.
//!
//! The **PEEK** decision (drill down instead of exiting) is defined and has a
//! result shape, but the v1 heuristic never produces it;
//! [`make_heuristic_decision`] is the seam a future LLM-based policy
//! replaces.
//!
//! A monitor timeout ends only the monitor: the worker keeps running and the
//! result says so (`worker_still_running`).

use crate::overmind::agent_runner::is_critical_error;
use crate::overmind::event_bus::{listener, EventBus, EventKind, SubscriptionId};
use crate::overmind::models::{Id, WorkerJob, WorkerStatus};
use crate::overmind::store::Store;
use crate::overmind::worker_store::WorkerArtifactStore;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Cap on the activity entries carried into decision contexts.
const ACTIVITY_LOG_MAX: usize = 50;
/// Cap on the captured last-tool-output preview.
const OUTPUT_PREVIEW_MAX: usize = 500;

/// Tuning knobs, injectable so tests run in milliseconds.
#[derive(Debug, Clone)]
pub struct RoundaboutParams {
    pub check_interval: Duration,
    pub monitor_timeout: Duration,
    /// Past this, the current operation is flagged slow.
    pub slow_threshold: Duration,
    /// Past this, a stuck operation cancels the job.
    pub cancel_stuck_threshold: Duration,
    /// Consecutive no-progress polls before cancelling.
    pub no_progress_polls: u32,
}

impl Default for RoundaboutParams {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            monitor_timeout: Duration::from_secs(300),
            slow_threshold: Duration::from_secs(30),
            cancel_stuck_threshold: Duration::from_secs(60),
            no_progress_polls: 6,
        }
    }
}

/// Decision options for the monitoring loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundaboutDecision {
    /// Continue monitoring (default).
    Wait,
    /// Saw enough, return with current findings.
    Exit,
    /// Something is wrong, abort the worker.
    Cancel,
    /// Need more details, return a drill-down pointer.
    Peek,
}

/// Record of one tool call observed during worker execution.
#[derive(Debug, Clone)]
pub struct ToolActivity {
    pub tool_name: String,
    /// `"started"`, `"completed"`, `"failed"`.
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
}

/// Inputs to one heuristic decision.
#[derive(Debug, Clone)]
pub struct DecisionContext {
    pub job_id: Id,
    pub worker_id: Option<String>,
    pub status: WorkerStatus,
    pub elapsed: Duration,
    pub tool_activities: Vec<ToolActivity>,
    pub current_operation: Option<ToolActivity>,
    pub is_stuck: bool,
    pub stuck_for: Duration,
    pub polls_without_progress: u32,
    pub last_tool_output: Option<String>,
}

/// Final result handed back to the supervisor.
#[derive(Debug, Clone)]
pub struct RoundaboutResult {
    /// `complete | failed | monitor_timeout | early_exit | cancelled | peek`.
    pub status: &'static str,
    pub job_id: Id,
    pub worker_id: Option<String>,
    pub duration: Duration,
    /// True when the monitor gave up but the worker keeps going.
    pub worker_still_running: bool,
    pub result: Option<String>,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub exit_reason: Option<String>,
    pub activity_summary: Value,
    pub decision: Option<RoundaboutDecision>,
    /// For `peek`: what to read next.
    pub drill_down_hint: Option<String>,
}

/// The v1 rule-based policy. Pure so it unit-tests without a live worker.
pub fn make_heuristic_decision(
    ctx: &DecisionContext,
    params: &RoundaboutParams,
) -> (RoundaboutDecision, String) {
    // Priority 1: worker terminal.
    if ctx.status.is_terminal() {
        return (
            RoundaboutDecision::Exit,
            format!("Worker status changed to {}", ctx.status.as_str()),
        );
    }

    // Priority 2: final-answer pattern in the last completed tool output.
    if let Some(output) = &ctx.last_tool_output {
        if let Some(pattern) = final_answer_pattern(output) {
            return (
                RoundaboutDecision::Exit,
                format!("Final answer pattern detected: {}", pattern),
            );
        }
    }

    // Priority 3: stuck operation past the cancel threshold.
    if ctx.is_stuck && ctx.stuck_for > params.cancel_stuck_threshold {
        return (
            RoundaboutDecision::Cancel,
            format!(
                "Operation stuck for {}s (threshold: {}s)",
                ctx.stuck_for.as_secs(),
                params.cancel_stuck_threshold.as_secs()
            ),
        );
    }

    // Priority 4: no progress across too many polls.
    if ctx.polls_without_progress >= params.no_progress_polls {
        return (
            RoundaboutDecision::Cancel,
            format!(
                "No progress for {} consecutive polls",
                ctx.polls_without_progress
            ),
        );
    }

    // Slow but not cancel-worthy: keep waiting, just note it.
    if ctx.is_stuck && ctx.stuck_for > params.slow_threshold {
        log::debug!(
            "job {} operation slow ({}s) but not cancel-worthy yet",
            ctx.job_id,
            ctx.stuck_for.as_secs()
        );
    }

    (RoundaboutDecision::Wait, "Continuing to monitor".to_string())
}

/// Case-insensitive final-answer matching. `Result:`/`Summary:` anchor at
/// the start of the output; the phrase patterns match anywhere.
fn final_answer_pattern(output: &str) -> Option<&'static str> {
    let lowered = output.trim_start().to_lowercase();
    if lowered.starts_with("result:") {
        return Some("^Result:");
    }
    if lowered.starts_with("summary:") {
        return Some("^Summary:");
    }
    if lowered.contains("completed successfully") {
        return Some("Completed successfully");
    }
    if lowered.contains("task complete") {
        return Some("Task complete");
    }
    if lowered.contains("done.") {
        return Some("Done.");
    }
    None
}

#[derive(Default)]
struct ActivityLog {
    activities: Vec<ToolActivity>,
    last_tool_output: Option<String>,
}

/// Monitors one worker job with periodic status checks.
pub struct RoundaboutMonitor {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    artifacts: Arc<WorkerArtifactStore>,
    job_id: Id,
    owner_id: Id,
    params: RoundaboutParams,
    log: Arc<Mutex<ActivityLog>>,
}

impl RoundaboutMonitor {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        artifacts: Arc<WorkerArtifactStore>,
        job_id: Id,
        owner_id: Id,
        params: RoundaboutParams,
    ) -> Self {
        Self {
            store,
            bus,
            artifacts,
            job_id,
            owner_id,
            params,
            log: Arc::new(Mutex::new(ActivityLog::default())),
        }
    }

    /// Enter the roundabout and poll until a decision ends it.
    pub async fn wait_for_completion(&self) -> RoundaboutResult {
        let start = Utc::now();
        log::info!("entering roundabout for job {}", self.job_id);

        let worker_id = self
            .store
            .get_worker_job(self.job_id)
            .await
            .ok()
            .and_then(|j| j.worker_id);
        let subscriptions = self.subscribe_to_tool_events(worker_id.clone()).await;

        let mut check_count: u32 = 0;
        let mut polls_without_progress: u32 = 0;
        let mut last_activity_count = 0usize;

        let result = loop {
            check_count += 1;
            let elapsed = (Utc::now() - start).to_std().unwrap_or_default();

            if elapsed > self.params.monitor_timeout {
                let job = self.store.get_worker_job(self.job_id).await.ok();
                let still_running = job
                    .as_ref()
                    .map(|j| !j.status.is_terminal())
                    .unwrap_or(false);
                log::warn!(
                    "roundabout monitor timeout for job {} after {}s (worker may still be running)",
                    self.job_id,
                    elapsed.as_secs()
                );
                break self.timeout_result(
                    job.as_ref().and_then(|j| j.worker_id.clone()),
                    still_running,
                    elapsed,
                    check_count,
                );
            }

            let job = match self.store.get_worker_job(self.job_id).await {
                Ok(job) => job,
                Err(_) => {
                    break self.missing_job_result(elapsed, check_count);
                }
            };

            self.log_monitoring_check(&job, elapsed, check_count);

            if job.status.is_terminal() {
                log::info!(
                    "roundabout exit for job {}: {} after {}s",
                    self.job_id,
                    job.status.as_str(),
                    elapsed.as_secs()
                );
                break self.completion_result(&job, elapsed, check_count);
            }

            let ctx = self.build_decision_context(&job, elapsed, polls_without_progress);
            let (decision, reason) = make_heuristic_decision(&ctx, &self.params);

            match decision {
                RoundaboutDecision::Exit => {
                    log::info!("roundabout early exit for job {}: {}", self.job_id, reason);
                    break self.early_exit_result(&job, reason, elapsed, check_count);
                }
                RoundaboutDecision::Cancel => {
                    log::warn!("roundabout cancelling job {}: {}", self.job_id, reason);
                    break self
                        .cancel_result(&job, reason, elapsed, check_count, polls_without_progress)
                        .await;
                }
                RoundaboutDecision::Peek => {
                    break self.peek_result(&job, reason, elapsed, check_count);
                }
                RoundaboutDecision::Wait => {}
            }

            let current_count = self.log.lock().unwrap().activities.len();
            if current_count > last_activity_count {
                polls_without_progress = 0;
                last_activity_count = current_count;
            } else {
                polls_without_progress += 1;
            }

            tokio::time::sleep(self.params.check_interval).await;
        };

        for (kind, id) in subscriptions {
            self.bus.unsubscribe(kind, id).await;
        }
        result
    }

    async fn subscribe_to_tool_events(
        &self,
        worker_id: Option<String>,
    ) -> Vec<(EventKind, SubscriptionId)> {
        let mut subscriptions = Vec::new();
        for kind in [
            EventKind::WorkerToolStarted,
            EventKind::WorkerToolCompleted,
            EventKind::WorkerToolFailed,
        ] {
            let log = Arc::clone(&self.log);
            let worker_id = worker_id.clone();
            let id = self
                .bus
                .subscribe(
                    kind,
                    listener(move |payload| {
                        let log = Arc::clone(&log);
                        let worker_id = worker_id.clone();
                        async move {
                            let event_worker =
                                payload.get("worker_id").and_then(|v| v.as_str());
                            if worker_id.as_deref() != event_worker {
                                return Ok(());
                            }
                            record_tool_activity(&log, kind, &payload);
                            Ok(())
                        }
                    }),
                )
                .await;
            subscriptions.push((kind, id));
        }
        subscriptions
    }

    fn build_decision_context(
        &self,
        job: &WorkerJob,
        elapsed: Duration,
        polls_without_progress: u32,
    ) -> DecisionContext {
        let log = self.log.lock().unwrap();
        let mut current_operation = None;
        let mut is_stuck = false;
        let mut stuck_for = Duration::default();

        if let Some(last) = log.activities.last() {
            if last.status == "started" {
                current_operation = Some(last.clone());
                stuck_for = (Utc::now() - last.timestamp).to_std().unwrap_or_default();
                is_stuck = stuck_for > self.params.slow_threshold;
            }
        }

        let skip = log.activities.len().saturating_sub(ACTIVITY_LOG_MAX);
        DecisionContext {
            job_id: self.job_id,
            worker_id: job.worker_id.clone(),
            status: job.status,
            elapsed,
            tool_activities: log.activities[skip..].to_vec(),
            current_operation,
            is_stuck,
            stuck_for,
            polls_without_progress,
            last_tool_output: log.last_tool_output.clone(),
        }
    }

    // -- Result builders ---------------------------------------------------

    fn activity_counts(&self) -> (usize, usize, usize, Vec<String>) {
        let log = self.log.lock().unwrap();
        let completed = log
            .activities
            .iter()
            .filter(|a| a.status == "completed")
            .count();
        let failed = log.activities.iter().filter(|a| a.status == "failed").count();
        let names: BTreeSet<String> = log
            .activities
            .iter()
            .map(|a| a.tool_name.clone())
            .collect();
        (log.activities.len(), completed, failed, names.into_iter().collect())
    }

    fn completion_result(
        &self,
        job: &WorkerJob,
        elapsed: Duration,
        checks: u32,
    ) -> RoundaboutResult {
        let (total, completed, failed, names) = self.activity_counts();
        let result_text = job
            .worker_id
            .as_ref()
            .and_then(|wid| self.artifacts.get_worker_result(wid, Some(self.owner_id)).ok());
        let summary = job.worker_id.as_ref().and_then(|wid| {
            self.artifacts
                .get_worker_metadata(wid, Some(self.owner_id))
                .ok()
                .and_then(|m| m.get("summary").and_then(|s| s.as_str()).map(String::from))
        });

        // A worker that failed fast on a critical tool error is an early
        // exit from the supervisor's point of view: the run ended by
        // decision, not by crash, and the reason is the formatted error.
        let critical_exit = job.status == WorkerStatus::Failed
            && job
                .error
                .as_deref()
                .map(|e| is_critical_error(e, None))
                .unwrap_or(false);

        let (status, exit_reason) = if job.status == WorkerStatus::Success {
            ("complete", None)
        } else if critical_exit {
            ("early_exit", job.error.clone())
        } else {
            ("failed", None)
        };

        RoundaboutResult {
            status,
            job_id: self.job_id,
            worker_id: job.worker_id.clone(),
            duration: elapsed,
            worker_still_running: false,
            result: result_text,
            summary,
            error: if job.status == WorkerStatus::Failed {
                job.error.clone()
            } else {
                None
            },
            exit_reason,
            activity_summary: json!({
                "tool_calls_total": total,
                "tool_calls_completed": completed,
                "tool_calls_failed": failed,
                "tools_used": names,
                "monitoring_checks": checks,
            }),
            decision: Some(RoundaboutDecision::Exit),
            drill_down_hint: None,
        }
    }

    fn early_exit_result(
        &self,
        job: &WorkerJob,
        reason: String,
        elapsed: Duration,
        checks: u32,
    ) -> RoundaboutResult {
        let (total, completed, failed, names) = self.activity_counts();
        let partial = job
            .worker_id
            .as_ref()
            .and_then(|wid| self.artifacts.get_worker_result(wid, Some(self.owner_id)).ok())
            .filter(|r| !r.is_empty());

        RoundaboutResult {
            status: "early_exit",
            job_id: self.job_id,
            worker_id: job.worker_id.clone(),
            duration: elapsed,
            worker_still_running: !job.status.is_terminal(),
            result: partial,
            summary: Some(format!("Early exit: {}", reason)),
            error: None,
            exit_reason: Some(reason),
            activity_summary: json!({
                "tool_calls_total": total,
                "tool_calls_completed": completed,
                "tool_calls_failed": failed,
                "tools_used": names,
                "monitoring_checks": checks,
            }),
            decision: Some(RoundaboutDecision::Exit),
            drill_down_hint: None,
        }
    }

    async fn cancel_result(
        &self,
        job: &WorkerJob,
        reason: String,
        elapsed: Duration,
        checks: u32,
        polls_without_progress: u32,
    ) -> RoundaboutResult {
        // Soft cancel: mark the job; the run loop observes status elsewhere.
        if let Err(e) = self
            .store
            .update_worker_job(
                self.job_id,
                Some(WorkerStatus::Cancelled),
                None,
                Some(format!("Cancelled by roundabout: {}", reason)),
            )
            .await
        {
            log::warn!("failed to mark job {} cancelled: {}", self.job_id, e);
        }

        let (total, _completed, _failed, names) = self.activity_counts();
        RoundaboutResult {
            status: "cancelled",
            job_id: self.job_id,
            worker_id: job.worker_id.clone(),
            duration: elapsed,
            worker_still_running: false,
            result: None,
            summary: None,
            error: Some(reason.clone()),
            exit_reason: Some(reason),
            activity_summary: json!({
                "tool_calls_total": total,
                "tools_used": names,
                "monitoring_checks": checks,
                "polls_without_progress": polls_without_progress,
            }),
            decision: Some(RoundaboutDecision::Cancel),
            drill_down_hint: None,
        }
    }

    fn peek_result(
        &self,
        job: &WorkerJob,
        reason: String,
        elapsed: Duration,
        checks: u32,
    ) -> RoundaboutResult {
        let (total, _, _, _) = self.activity_counts();
        RoundaboutResult {
            status: "peek",
            job_id: self.job_id,
            worker_id: job.worker_id.clone(),
            duration: elapsed,
            worker_still_running: !job.status.is_terminal(),
            result: None,
            summary: Some(format!("Peek requested: {}", reason)),
            error: None,
            exit_reason: Some(reason),
            activity_summary: json!({
                "tool_calls_total": total,
                "monitoring_checks": checks,
            }),
            decision: Some(RoundaboutDecision::Peek),
            drill_down_hint: job.worker_id.as_ref().map(|wid| {
                format!(
                    "For more details, read 'thread.jsonl' or the result of worker {}",
                    wid
                )
            }),
        }
    }

    fn timeout_result(
        &self,
        worker_id: Option<String>,
        worker_still_running: bool,
        elapsed: Duration,
        checks: u32,
    ) -> RoundaboutResult {
        let (total, _, _, _) = self.activity_counts();
        RoundaboutResult {
            status: "monitor_timeout",
            job_id: self.job_id,
            worker_id,
            duration: elapsed,
            worker_still_running,
            result: None,
            summary: None,
            error: Some(format!(
                "Monitor timeout after {}s (worker may still be running)",
                elapsed.as_secs()
            )),
            exit_reason: None,
            activity_summary: json!({
                "tool_calls_total": total,
                "monitoring_checks": checks,
            }),
            decision: None,
            drill_down_hint: None,
        }
    }

    fn missing_job_result(&self, elapsed: Duration, checks: u32) -> RoundaboutResult {
        RoundaboutResult {
            status: "failed",
            job_id: self.job_id,
            worker_id: None,
            duration: elapsed,
            worker_still_running: false,
            result: None,
            summary: None,
            error: Some("Job not found".to_string()),
            exit_reason: None,
            activity_summary: json!({ "monitoring_checks": checks }),
            decision: None,
            drill_down_hint: None,
        }
    }

    fn log_monitoring_check(&self, job: &WorkerJob, elapsed: Duration, checks: u32) {
        let worker_id = match &job.worker_id {
            Some(wid) => wid.clone(),
            None => return,
        };
        let (total, _, _, names) = self.activity_counts();
        let snapshot = json!({
            "check_number": checks,
            "elapsed_seconds": elapsed.as_secs(),
            "timestamp": Utc::now().to_rfc3339(),
            "job_status": job.status.as_str(),
            "tool_activities": total,
            "tool_names": names,
        });
        if let Err(e) = self
            .artifacts
            .save_monitoring_check(&worker_id, elapsed.as_secs(), &snapshot)
        {
            log::debug!("failed to log monitoring check: {}", e);
        }
    }
}

fn record_tool_activity(log: &Arc<Mutex<ActivityLog>>, kind: EventKind, payload: &Value) {
    let tool_name = payload
        .get("tool_name")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let mut log = log.lock().unwrap();

    match kind {
        EventKind::WorkerToolStarted => {
            log.activities.push(ToolActivity {
                tool_name,
                status: "started",
                timestamp: Utc::now(),
                error: None,
            });
        }
        EventKind::WorkerToolCompleted | EventKind::WorkerToolFailed => {
            let failed = kind == EventKind::WorkerToolFailed;
            for activity in log.activities.iter_mut().rev() {
                if activity.tool_name == tool_name && activity.status == "started" {
                    activity.status = if failed { "failed" } else { "completed" };
                    if failed {
                        activity.error = payload
                            .get("error")
                            .and_then(|v| v.as_str())
                            .map(String::from);
                    }
                    break;
                }
            }
            if !failed {
                if let Some(result) = payload.get("result") {
                    let preview = match result {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    log.last_tool_output =
                        Some(preview.chars().take(OUTPUT_PREVIEW_MAX).collect());
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(status: WorkerStatus) -> DecisionContext {
        DecisionContext {
            job_id: 1,
            worker_id: Some("w".to_string()),
            status,
            elapsed: Duration::from_secs(10),
            tool_activities: Vec::new(),
            current_operation: None,
            is_stuck: false,
            stuck_for: Duration::default(),
            polls_without_progress: 0,
            last_tool_output: None,
        }
    }

    #[test]
    fn test_terminal_status_exits() {
        let params = RoundaboutParams::default();
        let (decision, reason) = make_heuristic_decision(&ctx(WorkerStatus::Success), &params);
        assert_eq!(decision, RoundaboutDecision::Exit);
        assert!(reason.contains("success"));
        let (decision, _) = make_heuristic_decision(&ctx(WorkerStatus::Failed), &params);
        assert_eq!(decision, RoundaboutDecision::Exit);
    }

    #[test]
    fn test_final_answer_patterns_exit_early() {
        let params = RoundaboutParams::default();
        for output in [
            "Result: 42",
            "summary: all good",
            "The task Completed Successfully.",
            "task complete",
            "All Done.",
        ] {
            let mut c = ctx(WorkerStatus::Running);
            c.last_tool_output = Some(output.to_string());
            let (decision, _) = make_heuristic_decision(&c, &params);
            assert_eq!(decision, RoundaboutDecision::Exit, "output: {}", output);
        }
        // "Result" mid-sentence does not anchor.
        let mut c = ctx(WorkerStatus::Running);
        c.last_tool_output = Some("intermediate result: pending".to_string());
        let (decision, _) = make_heuristic_decision(&c, &params);
        assert_eq!(decision, RoundaboutDecision::Wait);
    }

    #[test]
    fn test_stuck_operation_cancels() {
        let params = RoundaboutParams::default();
        let mut c = ctx(WorkerStatus::Running);
        c.is_stuck = true;
        c.stuck_for = Duration::from_secs(61);
        let (decision, reason) = make_heuristic_decision(&c, &params);
        assert_eq!(decision, RoundaboutDecision::Cancel);
        assert!(reason.contains("stuck"));
    }

    #[test]
    fn test_no_progress_cancels() {
        let params = RoundaboutParams::default();
        let mut c = ctx(WorkerStatus::Running);
        c.polls_without_progress = 6;
        let (decision, reason) = make_heuristic_decision(&c, &params);
        assert_eq!(decision, RoundaboutDecision::Cancel);
        assert!(reason.contains("6 consecutive polls"));
    }

    #[test]
    fn test_default_is_wait() {
        let params = RoundaboutParams::default();
        let (decision, _) = make_heuristic_decision(&ctx(WorkerStatus::Running), &params);
        assert_eq!(decision, RoundaboutDecision::Wait);
    }

    #[test]
    fn test_slow_but_not_stuck_waits() {
        let params = RoundaboutParams::default();
        let mut c = ctx(WorkerStatus::Running);
        c.is_stuck = true;
        c.stuck_for = Duration::from_secs(45);
        let (decision, _) = make_heuristic_decision(&c, &params);
        assert_eq!(decision, RoundaboutDecision::Wait);
    }
}
