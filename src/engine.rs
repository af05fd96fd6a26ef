//! Extraction orchestration.
//!
//! One run attaches to the browser, drives the plan-act-observe loop for each
//! requested task under step and time budgets, retries failed attempts with
//! exponential backoff, and releases the session on every exit path.

use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::brain::Planner;
use crate::error::{PlanningError, RunError, SchemaViolation, TaskFailure};
use crate::hands::BrowserAdapter;
use crate::storage::StorageSink;
use crate::tasks::{Budgets, Task};
use crate::types::{
    Action, AttemptOutcome, CombinedResult, EngineState, ExtractionAttempt, HistoryEntry,
    Observation, PlanResult, PortfolioRecord, RawResult, RunMode, Session, StepOutcome, TaskKind,
};
use crate::validator;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per task, including the first.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Fraction of the backoff randomized in either direction.
    pub jitter: f64,
    /// Same-step retries for transient planning errors.
    pub max_transient_retries: u32,
    pub transient_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            jitter: 0.2,
            max_transient_retries: 3,
            transient_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failed_attempt`-th attempt (1-based).
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let exp = failed_attempt.saturating_sub(1).min(16);
        let delay = self
            .base_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + self.jitter * (rand::random::<f64>() * 2.0 - 1.0);
        delay.mul_f64(factor.max(0.0))
    }
}

/// Usable output of one finished task.
#[derive(Debug, Clone)]
enum TaskValue {
    Raw(RawResult),
    Structured(PortfolioRecord),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StorageStatus {
    Disabled,
    Written,
    Failed { error: String },
}

/// What a successful run hands back to its caller.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub mode: RunMode,
    pub result: CombinedResult,
    /// Tasks that exhausted their attempts while another task succeeded.
    pub failures: Vec<TaskFailure>,
    pub attempts: Vec<ExtractionAttempt>,
    /// Reported separately; never changes the run outcome.
    pub storage: StorageStatus,
}

struct TaskRun {
    attempts: Vec<ExtractionAttempt>,
    outcome: Result<TaskValue, TaskFailure>,
}

enum PlanStep {
    Planned(Result<PlanResult, PlanningError>),
    OutOfTime,
    Cancelled,
}

/// Releases the session when a run future is dropped before it completes.
struct SessionGuard {
    browser: Arc<dyn BrowserAdapter>,
    session: Option<Session>,
}

impl SessionGuard {
    fn new(browser: Arc<dyn BrowserAdapter>, session: Session) -> Self {
        Self {
            browser,
            session: Some(session),
        }
    }

    async fn release(mut self) {
        if let Some(session) = self.session.take() {
            self.browser.release(&session).await;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(page = %session.target_id, "Run dropped mid-flight, releasing session");
                let browser = self.browser.clone();
                handle.spawn(async move { browser.release(&session).await });
            }
            Err(_) => error!(
                page = %session.target_id,
                "Run dropped outside a runtime, session left attached"
            ),
        }
    }
}

/// Drives extraction runs against injected browser, planner and sink.
pub struct Orchestrator {
    browser: Arc<dyn BrowserAdapter>,
    planner: Arc<dyn Planner>,
    sink: Option<Arc<dyn StorageSink>>,
    portfolio_url: String,
    budgets: Budgets,
    policy: RetryPolicy,
    series: String,
    cancel: CancellationToken,
    /// Every attempt of the latest run, kept even when the run fails.
    journal: Mutex<Vec<ExtractionAttempt>>,
}

impl Orchestrator {
    pub fn new(
        browser: Arc<dyn BrowserAdapter>,
        planner: Arc<dyn Planner>,
        portfolio_url: impl Into<String>,
    ) -> Self {
        Self {
            browser,
            planner,
            sink: None,
            portfolio_url: portfolio_url.into(),
            budgets: Budgets::default(),
            policy: RetryPolicy::default(),
            series: crate::config::DEFAULT_SERIES.to_string(),
            cancel: CancellationToken::new(),
            journal: Mutex::new(Vec::new()),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn StorageSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_budgets(mut self, budgets: Budgets) -> Self {
        self.budgets = budgets;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_series(mut self, series: impl Into<String>) -> Self {
        self.series = series.into();
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Attempts recorded by the latest run, whatever its outcome.
    pub fn recorded_attempts(&self) -> Vec<ExtractionAttempt> {
        self.journal
            .lock()
            .map(|journal| journal.clone())
            .unwrap_or_default()
    }

    fn record(&self, attempt: &ExtractionAttempt) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(attempt.clone());
        }
    }

    /// Run the requested extraction(s) and store the combined result.
    pub async fn run(&self, mode: RunMode) -> Result<RunReport, RunError> {
        if let Ok(mut journal) = self.journal.lock() {
            journal.clear();
        }
        if self.cancel.is_cancelled() {
            return Err(RunError::Cancelled {
                task: None,
                attempts: 0,
                last_state: EngineState::Idle,
            });
        }

        info!(?mode, url = %self.portfolio_url, "Fetching portfolio data");
        let session = self
            .browser
            .acquire()
            .await
            .map_err(|e| RunError::SessionUnavailable {
                reason: e.to_string(),
                task: None,
                attempts: 0,
                last_state: EngineState::Idle,
            })?;
        debug!(page = %session.target_id, "Session acquired");

        let guard = SessionGuard::new(self.browser.clone(), session.clone());
        let runs = self.run_tasks(&session, mode).await;
        guard.release().await;
        let runs = runs?;

        let mut result = CombinedResult::default();
        let mut failures = Vec::new();
        let mut attempts = Vec::new();
        for run in runs {
            attempts.extend(run.attempts);
            match run.outcome {
                Ok(TaskValue::Raw(raw)) => result.raw = Some(raw),
                Ok(TaskValue::Structured(record)) => result.structured = Some(record),
                Err(failure) => failures.push(failure),
            }
        }

        if result.is_empty() {
            return Err(RunError::Exhausted { failures });
        }
        for failure in &failures {
            warn!(task = %failure.kind, attempts = failure.attempts, "Partial result: {}", failure.reason);
        }

        let storage = self.store(&result).await;
        Ok(RunReport {
            mode,
            result,
            failures,
            attempts,
            storage,
        })
    }

    async fn store(&self, result: &CombinedResult) -> StorageStatus {
        let Some(sink) = &self.sink else {
            return StorageStatus::Disabled;
        };
        match sink.write(&self.series, result, Utc::now()).await {
            Ok(()) => StorageStatus::Written,
            Err(e) => {
                error!("Failed to write portfolio data: {}", e);
                StorageStatus::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn run_tasks(&self, session: &Session, mode: RunMode) -> Result<Vec<TaskRun>, RunError> {
        let mut runs = Vec::new();
        for &kind in mode.kinds() {
            let task = Task::for_kind(kind, &self.portfolio_url, &self.budgets);
            let run = self
                .run_task(session, &task)
                .instrument(info_span!("task", task = %kind))
                .await?;
            runs.push(run);
        }
        Ok(runs)
    }

    /// Retry attempts for one task until it yields a value or runs out.
    async fn run_task(&self, session: &Session, task: &Task) -> Result<TaskRun, RunError> {
        let mut attempts: Vec<ExtractionAttempt> = Vec::new();

        for index in 1..=self.policy.max_attempts {
            let (attempt, value) = self
                .run_attempt(session, task, index)
                .instrument(info_span!("attempt", attempt = index))
                .await;
            let last_state = attempt.last_state;
            let outcome = attempt.outcome.clone();
            debug!(state = %attempt.state(), stopped_in = %last_state, "Attempt ended");
            self.record(&attempt);
            attempts.push(attempt);

            if let Some(value) = value {
                info!("{} portfolio data fetched successfully", task.kind);
                return Ok(TaskRun {
                    attempts,
                    outcome: Ok(value),
                });
            }

            match outcome {
                Some(AttemptOutcome::Fatal { reason }) => {
                    return Err(RunError::SessionUnavailable {
                        reason,
                        task: Some(task.kind),
                        attempts: index,
                        last_state,
                    });
                }
                Some(AttemptOutcome::Cancelled) => {
                    return Err(RunError::Cancelled {
                        task: Some(task.kind),
                        attempts: index,
                        last_state,
                    });
                }
                Some(other) => warn!("Attempt {} failed: {}", index, other),
                None => warn!("Attempt {} ended without an outcome", index),
            }

            if index < self.policy.max_attempts {
                let delay = self.policy.backoff(index);
                info!(?delay, "Backing off before next attempt");
                if !self.pause(delay).await {
                    return Err(RunError::Cancelled {
                        task: Some(task.kind),
                        attempts: index,
                        last_state,
                    });
                }
            }
        }

        let failure = TaskFailure {
            kind: task.kind,
            attempts: attempts.len() as u32,
            last_state: attempts
                .last()
                .map(|a| a.last_state)
                .unwrap_or(EngineState::SessionAcquired),
            reason: attempts
                .last()
                .and_then(|a| a.outcome.as_ref())
                .map(ToString::to_string)
                .unwrap_or_else(|| "no attempts configured".to_string()),
        };
        error!(attempts = failure.attempts, "Error fetching {} portfolio data: {}", task.kind, failure.reason);
        Ok(TaskRun {
            attempts,
            outcome: Err(failure),
        })
    }

    /// One bounded plan-act-observe loop.
    async fn run_attempt(
        &self,
        session: &Session,
        task: &Task,
        index: u32,
    ) -> (ExtractionAttempt, Option<TaskValue>) {
        let mut attempt = ExtractionAttempt::begin(task.kind, index);
        let started = Instant::now();
        let deadline = started + task.time_budget;
        let out_of_time = |attempt: ExtractionAttempt| {
            warn!("Time budget of {:?} exceeded", task.time_budget);
            attempt.finalize(AttemptOutcome::TimeBudgetExceeded {
                elapsed_ms: started.elapsed().as_millis() as u64,
            })
        };

        if self.cancel.is_cancelled() {
            return (attempt.finalize(AttemptOutcome::Cancelled), None);
        }

        attempt.last_state = EngineState::Acting;
        let landing = Action::Navigate {
            url: task.target_url.clone(),
        };
        match bounded(deadline, self.browser.act(session, &landing)).await {
            None => return (out_of_time(attempt), None),
            Some(Ok(())) => {}
            Some(Err(e)) if e.is_fatal() => {
                return (fatal(attempt, e.to_string()), None);
            }
            Some(Err(e)) => warn!("Initial navigation failed: {}", e),
        }

        let mut step = 0;
        loop {
            if self.cancel.is_cancelled() {
                return (attempt.finalize(AttemptOutcome::Cancelled), None);
            }
            if step >= task.step_budget {
                warn!("Step limit reached ({})", task.step_budget);
                return (
                    attempt.finalize(AttemptOutcome::StepBudgetExceeded { steps: step }),
                    None,
                );
            }
            step += 1;

            attempt.last_state = EngineState::Observing;
            let observation = match bounded(deadline, self.browser.observe(session)).await {
                None => return (out_of_time(attempt), None),
                Some(Ok(observation)) => observation,
                Some(Err(e)) if e.is_fatal() => return (fatal(attempt, e.to_string()), None),
                Some(Err(e)) => {
                    warn!(step, "{}; re-observing", e);
                    continue;
                }
            };

            attempt.last_state = EngineState::Planning;
            debug!(step, url = %observation.url, "Asking planner for next step");
            let planned = match self
                .plan_step(task, &observation, &attempt.history, deadline)
                .await
            {
                PlanStep::Planned(planned) => planned,
                PlanStep::OutOfTime => return (out_of_time(attempt), None),
                PlanStep::Cancelled => {
                    return (attempt.finalize(AttemptOutcome::Cancelled), None);
                }
            };

            match planned {
                Err(e) => {
                    warn!(step, "Planner error: {}", e);
                    attempt.history.push(HistoryEntry {
                        step,
                        observation,
                        outcome: StepOutcome::PlanningFailed {
                            reason: e.detail().to_string(),
                        },
                    });
                }
                Ok(PlanResult::Finish(answer)) => {
                    info!(step, "Task complete");
                    attempt.history.push(HistoryEntry {
                        step,
                        observation,
                        outcome: StepOutcome::Finished {
                            answer: answer.clone(),
                        },
                    });
                    return match accept(task.kind, &answer) {
                        Ok(value) => (
                            attempt.finalize(AttemptOutcome::Answer { text: answer }),
                            Some(value),
                        ),
                        Err(violation) => {
                            warn!("Answer rejected: {}", violation);
                            (
                                attempt.finalize(AttemptOutcome::Rejected {
                                    answer,
                                    field: violation.field,
                                    reason: violation.reason,
                                }),
                                None,
                            )
                        }
                    };
                }
                Ok(PlanResult::Act(action)) => {
                    if self.cancel.is_cancelled() {
                        return (attempt.finalize(AttemptOutcome::Cancelled), None);
                    }
                    attempt.last_state = EngineState::Acting;
                    debug!(step, ?action, "Executing step");
                    let acted = bounded(deadline, self.browser.act(session, &action)).await;
                    let timed_out = acted.is_none();
                    let (outcome, fatal_reason) = match acted {
                        None => (
                            StepOutcome::ActionFailed {
                                action,
                                reason: "time budget exhausted".to_string(),
                            },
                            None,
                        ),
                        Some(Ok(())) => (StepOutcome::Acted { action }, None),
                        Some(Err(e)) => {
                            warn!(step, "Step error: {}", e);
                            let fatal = e.is_fatal().then(|| e.to_string());
                            (
                                StepOutcome::ActionFailed {
                                    action,
                                    reason: e.detail(),
                                },
                                fatal,
                            )
                        }
                    };
                    attempt.history.push(HistoryEntry {
                        step,
                        observation,
                        outcome,
                    });
                    if let Some(reason) = fatal_reason {
                        return (fatal(attempt, reason), None);
                    }
                    if timed_out {
                        return (out_of_time(attempt), None);
                    }
                }
            }
        }
    }

    /// Ask the planner, retrying transient errors without spending a step.
    async fn plan_step(
        &self,
        task: &Task,
        observation: &Observation,
        history: &[HistoryEntry],
        deadline: Instant,
    ) -> PlanStep {
        let mut retries = 0;
        loop {
            if self.cancel.is_cancelled() {
                return PlanStep::Cancelled;
            }
            match bounded(deadline, self.planner.plan(task, observation, history)).await {
                None => return PlanStep::OutOfTime,
                Some(Err(PlanningError::Transient(msg)))
                    if retries < self.policy.max_transient_retries =>
                {
                    retries += 1;
                    warn!(retries, "Transient planner error, retrying: {}", msg);
                    if !self.pause(self.policy.transient_delay).await {
                        return PlanStep::Cancelled;
                    }
                }
                Some(planned) => return PlanStep::Planned(planned),
            }
        }
    }

    /// Sleep unless cancelled first. Returns `false` on cancellation.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Await `fut` within what is left before `deadline`; `None` when out of time.
async fn bounded<F: Future>(deadline: Instant, fut: F) -> Option<F::Output> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return None;
    }
    tokio::time::timeout(remaining, fut).await.ok()
}

fn fatal(attempt: ExtractionAttempt, reason: String) -> ExtractionAttempt {
    error!("Session lost: {}", reason);
    attempt.finalize(AttemptOutcome::Fatal { reason })
}

fn accept(kind: TaskKind, answer: &str) -> Result<TaskValue, SchemaViolation> {
    match kind {
        TaskKind::Raw => RawResult::new(answer)
            .map(TaskValue::Raw)
            .ok_or_else(|| SchemaViolation::new("text", "empty answer")),
        TaskKind::Structured => validator::validate(answer).map(TaskValue::Structured),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(10),
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(4), Duration::from_secs(10));
        assert_eq!(policy.backoff(40), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            base_backoff: Duration::from_secs(4),
            jitter: 0.25,
            ..RetryPolicy::default()
        };
        for _ in 0..100 {
            let delay = policy.backoff(1);
            assert!(delay >= Duration::from_secs(3), "{delay:?}");
            assert!(delay <= Duration::from_secs(5), "{delay:?}");
        }
    }

    #[test]
    fn raw_answers_must_not_be_blank() {
        assert!(matches!(accept(TaskKind::Raw, "# Report"), Ok(TaskValue::Raw(_))));
        let err = accept(TaskKind::Raw, "  ").unwrap_err();
        assert_eq!(err.field, "text");
    }

    #[test]
    fn structured_answers_go_through_the_validator() {
        assert!(matches!(
            accept(TaskKind::Structured, r#"{"net_worth": 10}"#),
            Ok(TaskValue::Structured(_))
        ));
        assert_eq!(
            accept(TaskKind::Structured, r#"{"net_worth": -1}"#)
                .unwrap_err()
                .field,
            "net_worth"
        );
    }
}
