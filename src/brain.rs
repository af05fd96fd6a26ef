use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::PlanningError;
use crate::tasks::Task;
use crate::types::{Action, HistoryEntry, Observation, PlanResult, StepOutcome};

const SYSTEM_PROMPT: &str = r#"You are a browser automation agent. You control a real Chrome browser by issuing ONE step at a time as JSON.

Available actions:
- {"action":"Navigate","url":"https://..."}
- {"action":"Click","element":"e0"}
- {"action":"TypeInto","element":"e0","text":"search query"}
- {"action":"PressKey","key":"Enter"}
- {"action":"Scroll","direction":"down"}
- {"action":"Wait","ms":2000}
- {"action":"Done","answer":"the final answer"}

Rules:
1. Return ONLY a single JSON object per response. No markdown, no explanation.
2. Target elements by the [eN] ids from the current page snapshot, written as "eN".
3. After each step you receive a fresh snapshot. Element ids change after navigation.
4. When the task is accomplished, use Done with the requested answer.
5. If a step fails, try an alternative approach instead of repeating it.
6. Keep steps minimal. Do not over-navigate."#;

/// Entries older than this are summarized as a count.
const HISTORY_WINDOW: usize = 12;

/// A message in the conversation sent to the LLM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn user(content: String) -> Self {
        Self {
            role: "user".to_string(),
            content,
        }
    }

    fn assistant(content: String) -> Self {
        Self {
            role: "assistant".to_string(),
            content,
        }
    }
}

/// Decides the next step for a task given what the browser shows.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        task: &Task,
        observation: &Observation,
        history: &[HistoryEntry],
    ) -> Result<PlanResult, PlanningError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Ollama,
    Google,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Ollama => "ollama",
            Provider::Google => "google",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "anthropic" => Ok(Provider::Anthropic),
            "ollama" => Ok(Provider::Ollama),
            "google" | "gemini" => Ok(Provider::Google),
            other => Err(format!("unknown LLM provider '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider: Provider,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: String,
    pub timeout: Duration,
    /// Ollama context window.
    pub num_ctx: Option<u32>,
}

/// Chat-completion planner over one of the supported providers.
pub struct Brain {
    client: Client,
    config: ProviderConfig,
}

impl Brain {
    pub fn new(config: ProviderConfig) -> Result<Self, PlanningError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PlanningError::Permanent(format!("http client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn provider(&self) -> Provider {
        self.config.provider
    }

    fn api_key(&self) -> &str {
        self.config.api_key.as_deref().unwrap_or_default()
    }

    fn build_request(&self, system: &str, messages: &[ChatMessage]) -> reqwest::RequestBuilder {
        let base = self.config.base_url.trim_end_matches('/');
        let model = &self.config.model;

        match self.config.provider {
            Provider::OpenAi => {
                let mut all = vec![json!({"role": "system", "content": system})];
                all.extend(
                    messages
                        .iter()
                        .map(|m| json!({"role": m.role, "content": m.content})),
                );
                self.client
                    .post(format!("{base}/v1/chat/completions"))
                    .bearer_auth(self.api_key())
                    .json(&json!({ "model": model, "messages": all }))
            }
            Provider::Anthropic => self
                .client
                .post(format!("{base}/v1/messages"))
                .header("x-api-key", self.api_key())
                .header("anthropic-version", "2023-06-01")
                .json(&json!({
                    "model": model,
                    "max_tokens": 4096,
                    "temperature": 0.0,
                    "system": system,
                    "messages": messages,
                })),
            Provider::Ollama => {
                let mut all = vec![json!({"role": "system", "content": system})];
                all.extend(
                    messages
                        .iter()
                        .map(|m| json!({"role": m.role, "content": m.content})),
                );
                let mut options = json!({ "temperature": 0.0 });
                if let Some(num_ctx) = self.config.num_ctx {
                    options["num_ctx"] = json!(num_ctx);
                }
                self.client.post(format!("{base}/api/chat")).json(&json!({
                    "model": model,
                    "messages": all,
                    "stream": false,
                    "options": options,
                }))
            }
            Provider::Google => {
                let contents: Vec<Value> = messages
                    .iter()
                    .map(|m| {
                        let role = if m.role == "assistant" { "model" } else { "user" };
                        json!({"role": role, "parts": [{"text": m.content}]})
                    })
                    .collect();
                self.client
                    .post(format!("{base}/v1beta/models/{model}:generateContent"))
                    .header("x-goog-api-key", self.api_key())
                    .json(&json!({
                        "systemInstruction": {"parts": [{"text": system}]},
                        "contents": contents,
                        "generationConfig": {"temperature": 0.0},
                    }))
            }
        }
    }
}

#[async_trait]
impl Planner for Brain {
    async fn plan(
        &self,
        task: &Task,
        observation: &Observation,
        history: &[HistoryEntry],
    ) -> Result<PlanResult, PlanningError> {
        let system = system_prompt(task);
        let messages = build_messages(task, observation, history);
        let response = self
            .build_request(&system, &messages)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let body = response.text().await.map_err(classify_transport)?;

        if !status.is_success() {
            let detail: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
            let message = detail["error"]["message"]
                .as_str()
                .or_else(|| detail["error"].as_str())
                .unwrap_or("Unknown API error");
            warn!(provider = %self.config.provider, %status, "API error: {}", message);
            return Err(classify_status(status, message));
        }

        let json_resp: Value = serde_json::from_str(&body)
            .map_err(|e| PlanningError::Permanent(format!("response is not JSON: {e}")))?;
        let content = extract_content(self.config.provider, &json_resp).ok_or_else(|| {
            PlanningError::Permanent(format!("no content in LLM response: {json_resp}"))
        })?;

        debug!(provider = %self.config.provider, "LLM says: {}", content);
        parse_step(content)
    }
}

fn system_prompt(task: &Task) -> String {
    match &task.context {
        Some(context) => format!("{context}\n\n{SYSTEM_PROMPT}"),
        None => SYSTEM_PROMPT.to_string(),
    }
}

/// Rebuild the conversation from the task, prior steps and the fresh snapshot.
pub fn build_messages(
    task: &Task,
    observation: &Observation,
    history: &[HistoryEntry],
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::user(format!(
        "Task: {}\n\nYou have at most {} steps.",
        task.prompt, task.step_budget
    ))];

    let skipped = history.len().saturating_sub(HISTORY_WINDOW);
    if skipped > 0 {
        messages.push(ChatMessage::user(format!(
            "({skipped} earlier steps omitted)"
        )));
    }

    for entry in &history[skipped..] {
        let (reply, feedback) = match &entry.outcome {
            StepOutcome::Acted { action } => (action_json(action), None),
            StepOutcome::ActionFailed { action, reason } => {
                (action_json(action), Some(format!("ERROR from last step: {reason}")))
            }
            StepOutcome::PlanningFailed { reason } => (
                "(invalid response)".to_string(),
                Some(format!("Your last response was rejected: {reason}")),
            ),
            StepOutcome::Finished { answer } => (answer.clone(), None),
        };
        messages.push(ChatMessage::user(format!(
            "Step {} on {} ({})",
            entry.step, entry.observation.url, entry.observation.title
        )));
        messages.push(ChatMessage::assistant(reply));
        if let Some(feedback) = feedback {
            messages.push(ChatMessage::user(feedback));
        }
    }

    messages.push(ChatMessage::user(format!(
        "{}\nWhat is your next step?",
        observation.render()
    )));
    messages
}

fn action_json(action: &Action) -> String {
    serde_json::to_string(action).unwrap_or_else(|_| format!("{action:?}"))
}

fn extract_content(provider: Provider, body: &Value) -> Option<&str> {
    match provider {
        Provider::OpenAi => body["choices"][0]["message"]["content"].as_str(),
        Provider::Anthropic => body["content"][0]["text"].as_str(),
        Provider::Ollama => body["message"]["content"].as_str(),
        Provider::Google => body["candidates"][0]["content"]["parts"][0]["text"].as_str(),
    }
}

fn classify_transport(e: reqwest::Error) -> PlanningError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        PlanningError::Transient(e.to_string())
    } else {
        PlanningError::Permanent(e.to_string())
    }
}

fn classify_status(status: StatusCode, message: &str) -> PlanningError {
    let detail = format!("API error ({status}): {message}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        PlanningError::Transient(detail)
    } else {
        PlanningError::Permanent(detail)
    }
}

/// Parse one LLM reply into an action or a final answer.
pub fn parse_step(content: &str) -> Result<PlanResult, PlanningError> {
    let cleaned = strip_fences(content);
    let object = outermost_object(cleaned).unwrap_or(cleaned);

    let value: Value = serde_json::from_str(object).map_err(|e| {
        PlanningError::Permanent(format!("failed to parse LLM response: {e}"))
    })?;

    if value["action"].as_str() == Some("Done") {
        let answer = match &value["answer"] {
            Value::String(text) => text.clone(),
            Value::Null => match &value["summary"] {
                Value::String(text) => text.clone(),
                _ => {
                    return Err(PlanningError::Permanent(
                        "Done without an answer".to_string(),
                    ));
                }
            },
            other => other.to_string(),
        };
        return Ok(PlanResult::Finish(answer));
    }

    let action: Action = serde_json::from_value(value)
        .map_err(|e| PlanningError::Permanent(format!("unknown or malformed action: {e}")))?;
    Ok(PlanResult::Act(action))
}

/// Strip possible markdown fences the LLM might add.
pub(crate) fn strip_fences(content: &str) -> &str {
    content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

pub(crate) fn outermost_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScrollDirection;

    fn task() -> Task {
        Task::structured("https://dash.example", 10, Duration::from_secs(60))
    }

    #[test]
    fn parses_fenced_action() {
        let reply = "```json\n{\"action\":\"Click\",\"element\":\"e4\"}\n```";
        assert_eq!(
            parse_step(reply).unwrap(),
            PlanResult::Act(Action::Click {
                element: "e4".into()
            })
        );
    }

    #[test]
    fn done_with_object_answer_is_serialized() {
        let reply = r#"Here you go: {"action":"Done","answer":{"net_worth":12}}"#;
        match parse_step(reply).unwrap() {
            PlanResult::Finish(text) => {
                let v: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(v["net_worth"], 12);
            }
            other => panic!("expected finish, got {other:?}"),
        }
    }

    #[test]
    fn garbage_is_permanent() {
        assert!(matches!(
            parse_step("I think I should click the button"),
            Err(PlanningError::Permanent(_))
        ));
        assert!(matches!(
            parse_step(r#"{"action":"Teleport"}"#),
            Err(PlanningError::Permanent(_))
        ));
        assert!(matches!(
            parse_step(r#"{"action":"Done"}"#),
            Err(PlanningError::Permanent(_))
        ));
    }

    #[test]
    fn rate_limits_and_server_errors_are_transient() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            PlanningError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "upstream"),
            PlanningError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "bad key"),
            PlanningError::Permanent(_)
        ));
    }

    #[test]
    fn provider_names_parse() {
        assert_eq!("OpenAI".parse::<Provider>().unwrap(), Provider::OpenAi);
        assert_eq!("gemini".parse::<Provider>().unwrap(), Provider::Google);
        assert!("mistral".parse::<Provider>().is_err());
    }

    #[test]
    fn content_is_read_per_provider() {
        let openai = json!({"choices":[{"message":{"content":"a"}}]});
        let anthropic = json!({"content":[{"type":"text","text":"b"}]});
        let ollama = json!({"message":{"role":"assistant","content":"c"}});
        let google = json!({"candidates":[{"content":{"parts":[{"text":"d"}]}}]});
        assert_eq!(extract_content(Provider::OpenAi, &openai), Some("a"));
        assert_eq!(extract_content(Provider::Anthropic, &anthropic), Some("b"));
        assert_eq!(extract_content(Provider::Ollama, &ollama), Some("c"));
        assert_eq!(extract_content(Provider::Google, &google), Some("d"));
        assert_eq!(extract_content(Provider::Google, &openai), None);
    }

    #[test]
    fn messages_carry_history_errors_and_current_page() {
        let obs = Observation {
            url: "https://dash.example".into(),
            title: "Dash".into(),
            elements: vec!["[e0] button \"Assets\"".into()],
            text: vec!["Net Worth".into()],
        };
        let history = vec![
            HistoryEntry {
                step: 1,
                observation: obs.clone(),
                outcome: StepOutcome::ActionFailed {
                    action: Action::Click {
                        element: "e9".into(),
                    },
                    reason: "element not found".into(),
                },
            },
            HistoryEntry {
                step: 2,
                observation: obs.clone(),
                outcome: StepOutcome::Acted {
                    action: Action::Scroll {
                        direction: ScrollDirection::Down,
                    },
                },
            },
        ];

        let messages = build_messages(&task(), &obs, &history);
        assert!(messages[0].content.contains("Task: Go to the following URL"));
        assert!(
            messages
                .iter()
                .any(|m| m.content == "ERROR from last step: element not found")
        );
        assert!(
            messages
                .iter()
                .any(|m| m.role == "assistant" && m.content.contains("\"Scroll\""))
        );
        let last = messages.last().unwrap();
        assert!(last.content.contains("[e0] button \"Assets\""));
        assert!(last.content.ends_with("What is your next step?"));
    }

    #[test]
    fn long_history_is_windowed() {
        let obs = Observation::default();
        let history: Vec<HistoryEntry> = (1..=HISTORY_WINDOW + 5)
            .map(|step| HistoryEntry {
                step,
                observation: obs.clone(),
                outcome: StepOutcome::Acted {
                    action: Action::Wait { ms: 100 },
                },
            })
            .collect();
        let messages = build_messages(&task(), &obs, &history);
        assert_eq!(messages[1].content, "(5 earlier steps omitted)");
        assert_eq!(messages.len(), 2 + HISTORY_WINDOW * 2 + 1);
    }
}
