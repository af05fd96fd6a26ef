#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use portfolio_scraper::{
    Action, BrowserAdapter, BrowserError, CombinedResult, HistoryEntry, Observation, PlanResult,
    Planner, PlanningError, RetryPolicy, Session, StorageError, StorageSink, Task,
};

pub const URL: &str = "https://dash.example/portfolio";

pub fn page(title: &str) -> Observation {
    Observation {
        url: URL.to_string(),
        title: title.to_string(),
        elements: vec!["[e1] <button> Overview".to_string()],
        text: vec!["Net Worth $15,234.50".to_string()],
    }
}

/// No waiting between attempts or transient retries.
pub fn instant_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
        jitter: 0.0,
        max_transient_retries: 3,
        transient_delay: Duration::ZERO,
    }
}

/// Browser fake fed from queues; falls back to a healthy page once they drain.
#[derive(Default)]
pub struct ScriptedBrowser {
    pub acquire_error: Option<BrowserError>,
    pub observations: Mutex<VecDeque<Result<Observation, BrowserError>>>,
    /// Results for planned actions; landing navigations always succeed.
    pub action_results: Mutex<VecDeque<Result<(), BrowserError>>>,
    pub observe_delay: Duration,
    pub acquires: AtomicUsize,
    pub landings: AtomicUsize,
    pub releases: AtomicUsize,
    pub actions: Mutex<Vec<Action>>,
}

impl ScriptedBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observations(
        self,
        observations: impl IntoIterator<Item = Result<Observation, BrowserError>>,
    ) -> Self {
        *self.observations.lock().unwrap() = observations.into_iter().collect();
        self
    }

    pub fn with_action_results(
        self,
        results: impl IntoIterator<Item = Result<(), BrowserError>>,
    ) -> Self {
        *self.action_results.lock().unwrap() = results.into_iter().collect();
        self
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn actions(&self) -> Vec<Action> {
        self.actions.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrowserAdapter for ScriptedBrowser {
    async fn acquire(&self) -> Result<Session, BrowserError> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.acquire_error {
            return Err(err.clone());
        }
        Ok(Session {
            endpoint: "http://127.0.0.1:9222".to_string(),
            target_id: "page-1".to_string(),
            headless: true,
        })
    }

    async fn observe(&self, _session: &Session) -> Result<Observation, BrowserError> {
        if !self.observe_delay.is_zero() {
            tokio::time::sleep(self.observe_delay).await;
        }
        let next = self.observations.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(page("Portfolio")))
    }

    async fn act(&self, _session: &Session, action: &Action) -> Result<(), BrowserError> {
        if matches!(action, Action::Navigate { url } if url == URL) {
            self.landings.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
        self.actions.lock().unwrap().push(action.clone());
        let next = self.action_results.lock().unwrap().pop_front();
        next.unwrap_or(Ok(()))
    }

    async fn release(&self, _session: &Session) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Planner backed by a closure over the task and the history so far.
pub struct FnPlanner<F> {
    decide: F,
    pub calls: AtomicUsize,
}

impl<F> FnPlanner<F> {
    pub fn new(decide: F) -> Self
    where
        F: Fn(&Task, &[HistoryEntry]) -> Result<PlanResult, PlanningError> + Send + Sync,
    {
        Self {
            decide,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F> Planner for FnPlanner<F>
where
    F: Fn(&Task, &[HistoryEntry]) -> Result<PlanResult, PlanningError> + Send + Sync,
{
    async fn plan(
        &self,
        task: &Task,
        _observation: &Observation,
        history: &[HistoryEntry],
    ) -> Result<PlanResult, PlanningError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.decide)(task, history)
    }
}

/// Planner that replies from a fixed script, then keeps scrolling.
pub struct ScriptedPlanner {
    replies: Mutex<VecDeque<Result<PlanResult, PlanningError>>>,
    pub calls: AtomicUsize,
}

impl ScriptedPlanner {
    pub fn new(replies: impl IntoIterator<Item = Result<PlanResult, PlanningError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(
        &self,
        _task: &Task,
        _observation: &Observation,
        _history: &[HistoryEntry],
    ) -> Result<PlanResult, PlanningError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.replies.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(scroll()))
    }
}

pub fn scroll() -> PlanResult {
    PlanResult::Act(Action::Scroll {
        direction: portfolio_scraper::types::ScrollDirection::Down,
    })
}

#[derive(Default)]
pub struct RecordingSink {
    pub writes: Mutex<Vec<(String, CombinedResult, DateTime<Utc>)>>,
}

impl RecordingSink {
    pub fn writes(&self) -> Vec<(String, CombinedResult, DateTime<Utc>)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl StorageSink for RecordingSink {
    async fn write(
        &self,
        series: &str,
        result: &CombinedResult,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.writes
            .lock()
            .unwrap()
            .push((series.to_string(), result.clone(), at));
        Ok(())
    }
}

pub struct FailingSink;

#[async_trait]
impl StorageSink for FailingSink {
    async fn write(
        &self,
        _series: &str,
        _result: &CombinedResult,
        _at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        Err(StorageError::Rejected {
            status: 401,
            body: "unauthorized".to_string(),
        })
    }
}
