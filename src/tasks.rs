use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::TaskKind;

/// One extraction job, built once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub kind: TaskKind,
    pub prompt: String,
    /// Persona prepended to the planner's system prompt.
    pub context: Option<String>,
    pub target_url: String,
    pub step_budget: usize,
    pub time_budget: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budgets {
    pub raw_steps: usize,
    pub structured_steps: usize,
    pub time_budget: Duration,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            raw_steps: 40,
            structured_steps: 25,
            time_budget: Duration::from_secs(300),
        }
    }
}

impl Task {
    pub fn for_kind(kind: TaskKind, url: &str, budgets: &Budgets) -> Self {
        match kind {
            TaskKind::Raw => Self::raw(url, budgets.raw_steps, budgets.time_budget),
            TaskKind::Structured => {
                Self::structured(url, budgets.structured_steps, budgets.time_budget)
            }
        }
    }

    /// Free-form markdown report of the whole dashboard.
    pub fn raw(url: &str, step_budget: usize, time_budget: Duration) -> Self {
        Self {
            kind: TaskKind::Raw,
            prompt: raw_prompt(url),
            context: Some(RAW_CONTEXT.to_string()),
            target_url: url.to_string(),
            step_budget,
            time_budget,
        }
    }

    /// Net worth plus top-5 assets and platforms as JSON.
    pub fn structured(url: &str, step_budget: usize, time_budget: Duration) -> Self {
        Self {
            kind: TaskKind::Structured,
            prompt: structured_prompt(url),
            context: None,
            target_url: url.to_string(),
            step_budget,
            time_budget,
        }
    }
}

const RAW_CONTEXT: &str = "You are a crypto portfolio expert with a focus on Solana DeFi and Spot investments. \
Your role is to provide a thorough and accurate analysis of the portfolio for strategic decision-making. \
Capture all relevant details, including platform-specific strategies (lending, leverage, farming), asset allocations and stablecoin exposure. \
Structure the output for executive-level reading: clear, complete and actionable.";

fn raw_prompt(url: &str) -> String {
    format!(
        "Go to the following URL: {url}. \
This page contains data on a Solana-based crypto portfolio, including DeFi and Spot positions across multiple wallets. \
Extract all portfolio information and write it as a detailed markdown report.\n\
1. Load the page and wait for all dynamic content to render (portfolio values, platform positions, asset holdings).\n\
2. Scroll to the bottom so all lazy-loaded content is visible.\n\
3. Extract:\n\
   - Net worth (in USD and SOL equivalent).\n\
   - Number of wallets.\n\
   - Positions by platform (e.g. Kamino, Drift, Holdings) with values and categories (Lending, Leverage, Staked).\n\
   - Asset holdings (e.g. USDC, wSOL, JitoSOL) with values and type (stablecoin or not).\n\
   - Stablecoin vs. non-stablecoin ratio.\n\
4. Open modals or tooltips if they hide data.\n\
5. Consolidate positions below $10 into an 'Other' category with notes.\n\
6. Finish with a summary section of key metrics (net worth, stablecoin ratio, top platforms and assets).\n\
Put the whole markdown report in the Done answer as a string. Do not invent values that are not on the page."
    )
}

fn structured_prompt(url: &str) -> String {
    format!(
        "Go to the following URL: {url}. \
Grab the net worth information. \
Grab the top 5 platforms from the chart. \
Click on the 'Assets' switcher. \
Grab the top 5 assets from the chart, not from the holdings list. \
Finish with Done whose answer is a JSON object of exactly this shape:\n\
{{\"net_worth\": {{\"net_worth\": 1234.56, \"sol_equivalent\": 7.89}}, \
\"top_5_holdings\": [{{\"asset\": \"SOL\", \"value\": 100.0, \"percentage\": 12.5}}], \
\"top_5_platforms\": [{{\"platform\": \"Kamino\", \"value\": 100.0, \"percentage\": 12.5}}]}}\n\
Use plain numbers in USD without currency symbols. \
Use null for net_worth or sol_equivalent when the page does not show it. \
Leave out any asset or platform whose value the page does not show; every listed entry needs a numeric value."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_embed_the_target_url() {
        let budgets = Budgets::default();
        let raw = Task::for_kind(TaskKind::Raw, "https://dash.example/p/1", &budgets);
        let structured = Task::for_kind(TaskKind::Structured, "https://dash.example/p/1", &budgets);

        assert!(raw.prompt.contains("https://dash.example/p/1"));
        assert!(structured.prompt.contains("https://dash.example/p/1"));
        assert_eq!(raw.step_budget, 40);
        assert_eq!(structured.step_budget, 25);
        assert!(raw.context.is_some());
        assert!(structured.context.is_none());
    }

    #[test]
    fn structured_prompt_spells_out_the_schema() {
        let task = Task::structured("u", 5, Duration::from_secs(1));
        assert!(task.prompt.contains("\"top_5_holdings\""));
        assert!(task.prompt.contains("\"top_5_platforms\""));
        assert!(task.prompt.contains("'Assets' switcher"));
    }

    #[test]
    fn structured_prompt_only_allows_null_where_the_validator_does() {
        let task = Task::structured("u", 5, Duration::from_secs(1));
        assert!(!task.prompt.contains("Use null for a value"));
        assert!(task.prompt.contains("null for net_worth or sol_equivalent"));
        assert!(task.prompt.contains("Leave out any asset or platform"));

        let following_the_prompt = r#"{"net_worth": {"net_worth": null, "sol_equivalent": null},
            "top_5_holdings": [{"asset": "SOL", "value": 12.5, "percentage": 100}],
            "top_5_platforms": []}"#;
        let record = crate::validator::validate(following_the_prompt).unwrap();
        assert_eq!(record.net_worth, None);
        assert_eq!(record.top_assets.len(), 1);

        let null_holding = r#"{"top_5_holdings": [{"asset": "SOL", "value": null}]}"#;
        assert!(crate::validator::validate(null_holding).is_err());
    }
}
