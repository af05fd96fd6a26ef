//! LLM-driven extraction of portfolio data from a live dashboard.
//!
//! The [`engine::Orchestrator`] attaches to a running Chrome through a
//! [`hands::BrowserAdapter`], lets a [`brain::Planner`] pick one browser action
//! per step until it produces an answer, validates that answer and hands the
//! combined result to a [`storage::StorageSink`].

pub mod brain;
pub mod config;
pub mod dom;
pub mod engine;
pub mod error;
pub mod hands;
pub mod replay;
pub mod storage;
pub mod tasks;
pub mod types;
pub mod validator;

pub use brain::{Brain, Planner, Provider, ProviderConfig};
pub use config::Config;
pub use engine::{Orchestrator, RetryPolicy, RunReport, StorageStatus};
pub use error::{
    BrowserError, ConfigError, PlanningError, RunError, SchemaViolation, StorageError, TaskFailure,
};
pub use hands::{BrowserAdapter, ChromeAdapter, ChromeOptions};
pub use storage::{InfluxConfig, InfluxSink, StorageSink};
pub use tasks::{Budgets, Task};
pub use types::{
    Action, AttemptOutcome, CombinedResult, EngineState, ExtractionAttempt, HistoryEntry, Holding,
    Observation, PlanResult, PortfolioRecord, RawResult, RunMode, Session, StepOutcome, TaskKind,
};
