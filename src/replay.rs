//! Re-drive a recorded attempt without a browser or an LLM.
//!
//! [`ReplayBrowser`] serves the recorded observations in order and reproduces
//! recorded action failures; [`ReplayPlanner`] returns the recorded decisions.
//! Running the engine against the pair reproduces the attempt's final answer.

use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::brain::Planner;
use crate::error::{BrowserError, PlanningError};
use crate::hands::BrowserAdapter;
use crate::tasks::Task;
use crate::types::{
    Action, ExtractionAttempt, HistoryEntry, Observation, PlanResult, Session, StepOutcome,
};

pub struct ReplayBrowser {
    entries: Vec<HistoryEntry>,
    /// Index of the entry whose observation was served last.
    cursor: Mutex<Option<usize>>,
    released: AtomicUsize,
}

impl ReplayBrowser {
    pub fn new(attempt: &ExtractionAttempt) -> Self {
        Self {
            entries: attempt.history.clone(),
            cursor: Mutex::new(None),
            released: AtomicUsize::new(0),
        }
    }

    pub fn releases(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserAdapter for ReplayBrowser {
    async fn acquire(&self) -> Result<Session, BrowserError> {
        Ok(Session {
            endpoint: "replay://".to_string(),
            target_id: "replay".to_string(),
            headless: true,
        })
    }

    async fn observe(&self, _session: &Session) -> Result<Observation, BrowserError> {
        let mut cursor = self
            .cursor
            .lock()
            .map_err(|_| BrowserError::SessionUnavailable("replay cursor poisoned".into()))?;
        let next = cursor.map_or(0, |i| i + 1);
        let entry = self.entries.get(next).ok_or_else(|| {
            BrowserError::SessionUnavailable("recorded history exhausted".into())
        })?;
        *cursor = Some(next);
        Ok(entry.observation.clone())
    }

    async fn act(&self, _session: &Session, _action: &Action) -> Result<(), BrowserError> {
        let cursor = *self
            .cursor
            .lock()
            .map_err(|_| BrowserError::SessionUnavailable("replay cursor poisoned".into()))?;
        // Before the first observation the engine is only landing on the page.
        let Some(index) = cursor else {
            return Ok(());
        };
        match self.entries.get(index).map(|e| &e.outcome) {
            Some(StepOutcome::ActionFailed { reason, .. }) => {
                Err(BrowserError::action_failed(reason.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn release(&self, _session: &Session) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct ReplayPlanner {
    entries: Vec<HistoryEntry>,
    next: AtomicUsize,
}

impl ReplayPlanner {
    pub fn new(attempt: &ExtractionAttempt) -> Self {
        Self {
            entries: attempt.history.clone(),
            next: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Planner for ReplayPlanner {
    async fn plan(
        &self,
        _task: &Task,
        observation: &Observation,
        _history: &[HistoryEntry],
    ) -> Result<PlanResult, PlanningError> {
        let index = self.next.fetch_add(1, Ordering::SeqCst);
        let entry = self
            .entries
            .get(index)
            .ok_or_else(|| PlanningError::Permanent("recorded history exhausted".into()))?;
        if entry.observation != *observation {
            return Err(PlanningError::Permanent(format!(
                "observation diverged from recording at step {}",
                entry.step
            )));
        }
        match &entry.outcome {
            StepOutcome::Acted { action } | StepOutcome::ActionFailed { action, .. } => {
                Ok(PlanResult::Act(action.clone()))
            }
            StepOutcome::PlanningFailed { reason } => Err(PlanningError::Permanent(reason.clone())),
            StepOutcome::Finished { answer } => Ok(PlanResult::Finish(answer.clone())),
        }
    }
}
