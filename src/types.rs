use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which extraction a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Raw,
    Structured,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Raw => f.write_str("raw"),
            TaskKind::Structured => f.write_str("structured"),
        }
    }
}

/// What a single invocation should extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Raw,
    Structured,
    Both,
}

impl RunMode {
    /// Tasks in the order they run against the session.
    pub fn kinds(self) -> &'static [TaskKind] {
        match self {
            RunMode::Raw => &[TaskKind::Raw],
            RunMode::Structured => &[TaskKind::Structured],
            RunMode::Both => &[TaskKind::Raw, TaskKind::Structured],
        }
    }
}

impl From<TaskKind> for RunMode {
    fn from(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Raw => RunMode::Raw,
            TaskKind::Structured => RunMode::Structured,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
}

/// A single atomic browser instruction the planner asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum Action {
    Navigate { url: String },
    Click { element: String },
    TypeInto { element: String, text: String },
    Scroll { direction: ScrollDirection },
    Wait { ms: u64 },
    PressKey { key: String },
}

/// What the planner decided for one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PlanResult {
    Act(Action),
    Finish(String),
}

/// Snapshot of the page taken before a planning step.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Observation {
    pub url: String,
    pub title: String,
    /// Interactive elements, each prefixed with its `[eN]` reference.
    pub elements: Vec<String>,
    /// Visible leaf text in document order.
    pub text: Vec<String>,
}

impl Observation {
    /// Text form handed to the planner.
    pub fn render(&self) -> String {
        let mut out = format!("Page URL: {}\nTitle: {}\n", self.url, self.title);
        out.push_str("\nInteractive elements:\n");
        if self.elements.is_empty() {
            out.push_str("  (none)\n");
        }
        for element in &self.elements {
            out.push_str("  ");
            out.push_str(element);
            out.push('\n');
        }
        out.push_str("\nVisible text:\n");
        for line in &self.text {
            out.push_str("  ");
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

/// An attached browser context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub endpoint: String,
    pub target_id: String,
    pub headless: bool,
}

/// Engine states, recorded so failures can report where they stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    SessionAcquired,
    Planning,
    Acting,
    Observing,
    Finished,
    Failed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::SessionAcquired => "session_acquired",
            EngineState::Planning => "planning",
            EngineState::Acting => "acting",
            EngineState::Observing => "observing",
            EngineState::Finished => "finished",
            EngineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How one plan-act-observe step ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Acted { action: Action },
    ActionFailed { action: Action, reason: String },
    PlanningFailed { reason: String },
    Finished { answer: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step: usize,
    pub observation: Observation,
    pub outcome: StepOutcome,
}

impl HistoryEntry {
    pub fn action(&self) -> Option<&Action> {
        match &self.outcome {
            StepOutcome::Acted { action } | StepOutcome::ActionFailed { action, .. } => {
                Some(action)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Answer { text: String },
    Rejected { answer: String, field: String, reason: String },
    StepBudgetExceeded { steps: usize },
    TimeBudgetExceeded { elapsed_ms: u64 },
    Fatal { reason: String },
    Cancelled,
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Answer { .. } => f.write_str("answer"),
            AttemptOutcome::Rejected { field, reason, .. } => {
                write!(f, "answer rejected ({field}: {reason})")
            }
            AttemptOutcome::StepBudgetExceeded { steps } => {
                write!(f, "step budget exceeded after {steps} steps")
            }
            AttemptOutcome::TimeBudgetExceeded { elapsed_ms } => {
                write!(f, "time budget exceeded after {elapsed_ms}ms")
            }
            AttemptOutcome::Fatal { reason } => write!(f, "fatal: {reason}"),
            AttemptOutcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// One bounded run of the plan-act-observe loop for a single task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionAttempt {
    pub kind: TaskKind,
    pub index: u32,
    pub history: Vec<HistoryEntry>,
    /// `None` while the loop is still running.
    pub outcome: Option<AttemptOutcome>,
    pub last_state: EngineState,
    pub started_at: DateTime<Utc>,
}

impl ExtractionAttempt {
    pub fn begin(kind: TaskKind, index: u32) -> Self {
        Self {
            kind,
            index,
            history: Vec::new(),
            outcome: None,
            last_state: EngineState::SessionAcquired,
            started_at: Utc::now(),
        }
    }

    /// Failed attempts keep the state they stopped in as `last_state`.
    pub fn finalize(mut self, outcome: AttemptOutcome) -> Self {
        if matches!(outcome, AttemptOutcome::Answer { .. }) {
            self.last_state = EngineState::Finished;
        }
        self.outcome = Some(outcome);
        self
    }

    /// Terminal state once an outcome is set: `Finished` for an answer,
    /// `Failed` for anything else.
    pub fn state(&self) -> EngineState {
        match &self.outcome {
            Some(AttemptOutcome::Answer { .. }) => EngineState::Finished,
            Some(_) => EngineState::Failed,
            None => self.last_state,
        }
    }

    /// The final answer text if the planner produced one.
    pub fn final_answer(&self) -> Option<&str> {
        self.history.iter().rev().find_map(|entry| match &entry.outcome {
            StepOutcome::Finished { answer } => Some(answer.as_str()),
            _ => None,
        })
    }
}

/// A named position in the top-N lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding {
    pub name: String,
    pub value: Decimal,
    pub percentage: Option<Decimal>,
}

/// Validated structured extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortfolioRecord {
    /// `None` when the dashboard did not show a net worth.
    pub net_worth: Option<Decimal>,
    pub sol_equivalent: Option<Decimal>,
    pub top_assets: Vec<Holding>,
    pub top_platforms: Vec<Holding>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawResult {
    pub text: String,
    pub captured_at: DateTime<Utc>,
}

impl RawResult {
    /// Returns `None` for blank text.
    pub fn new(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        Some(Self {
            text: text.to_string(),
            captured_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CombinedResult {
    pub raw: Option<RawResult>,
    pub structured: Option<PortfolioRecord>,
}

impl CombinedResult {
    pub fn is_empty(&self) -> bool {
        self.raw.is_none() && self.structured.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_is_tagged_by_action_field() {
        let action: Action =
            serde_json::from_str(r#"{"action":"TypeInto","element":"e3","text":"hello"}"#)
                .unwrap();
        assert_eq!(
            action,
            Action::TypeInto {
                element: "e3".into(),
                text: "hello".into()
            }
        );

        let scroll: Action =
            serde_json::from_str(r#"{"action":"Scroll","direction":"down"}"#).unwrap();
        assert_eq!(
            scroll,
            Action::Scroll {
                direction: ScrollDirection::Down
            }
        );
    }

    #[test]
    fn raw_result_rejects_blank_text() {
        assert!(RawResult::new("   \n").is_none());
        assert_eq!(RawResult::new("  # Report \n").unwrap().text, "# Report");
    }

    #[test]
    fn both_mode_runs_raw_first() {
        assert_eq!(
            RunMode::Both.kinds(),
            &[TaskKind::Raw, TaskKind::Structured]
        );
    }

    #[test]
    fn final_answer_comes_from_last_finished_step() {
        let mut attempt = ExtractionAttempt::begin(TaskKind::Raw, 1);
        attempt.history.push(HistoryEntry {
            step: 1,
            observation: Observation::default(),
            outcome: StepOutcome::Acted {
                action: Action::Wait { ms: 10 },
            },
        });
        assert_eq!(attempt.final_answer(), None);
        attempt.history.push(HistoryEntry {
            step: 2,
            observation: Observation::default(),
            outcome: StepOutcome::Finished {
                answer: "done".into(),
            },
        });
        let attempt = attempt.finalize(AttemptOutcome::Answer {
            text: "done".into(),
        });
        assert_eq!(attempt.final_answer(), Some("done"));
        assert_eq!(attempt.last_state, EngineState::Finished);
        assert_eq!(attempt.state(), EngineState::Finished);
    }

    #[test]
    fn failed_attempt_is_terminal_but_remembers_where_it_stopped() {
        let mut attempt = ExtractionAttempt::begin(TaskKind::Structured, 2);
        attempt.last_state = EngineState::Planning;
        assert_eq!(attempt.state(), EngineState::Planning);

        let attempt = attempt.finalize(AttemptOutcome::StepBudgetExceeded { steps: 40 });
        assert_eq!(attempt.state(), EngineState::Failed);
        assert_eq!(attempt.last_state, EngineState::Planning);
        assert_eq!(attempt.state().to_string(), "failed");
    }
}
