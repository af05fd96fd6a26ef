use async_trait::async_trait;
use headless_chrome::{Browser, Tab};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dom;
use crate::error::BrowserError;
use crate::types::{Action, Observation, ScrollDirection, Session};

/// Narrow capability over an externally launched browser.
///
/// The engine is the only caller and never issues two calls against the same
/// session concurrently.
#[async_trait]
pub trait BrowserAdapter: Send + Sync {
    async fn acquire(&self) -> Result<Session, BrowserError>;
    async fn observe(&self, session: &Session) -> Result<Observation, BrowserError>;
    async fn act(&self, session: &Session, action: &Action) -> Result<(), BrowserError>;
    /// Detach from the page. Safe to call more than once.
    async fn release(&self, session: &Session);
}

#[derive(Debug, Clone)]
pub struct ChromeOptions {
    pub endpoint: String,
    pub headless: bool,
    pub connect_timeout: Duration,
    pub settle_timeout: Duration,
    pub min_settle: Duration,
    pub action_timeout: Duration,
    pub max_wait: Duration,
    /// How long the CDP connection may sit idle while the planner thinks.
    pub idle_timeout: Duration,
}

impl Default for ChromeOptions {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9222".to_string(),
            headless: true,
            connect_timeout: Duration::from_secs(10),
            settle_timeout: Duration::from_secs(10),
            min_settle: Duration::from_secs(1),
            action_timeout: Duration::from_secs(20),
            max_wait: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    #[serde(rename = "Browser", default)]
    browser: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    ws_url: String,
}

struct Attached {
    _browser: Browser,
    tab: Arc<Tab>,
    target_id: String,
}

/// One blocking tab operation at a time.
///
/// The permit moves into the blocking closure, so a call whose caller timed
/// out still holds the tab until its thread returns.
#[derive(Clone, Default)]
struct TabGate(Arc<tokio::sync::Mutex<()>>);

impl TabGate {
    async fn run<F, T>(&self, work: F) -> Result<T, tokio::task::JoinError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.0.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            work()
        })
        .await
    }

    /// Wait for in-flight work to finish, up to `limit`.
    async fn drain(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.0.lock()).await.is_ok()
    }
}

/// Attaches to a Chrome started with `--remote-debugging-port`.
pub struct ChromeAdapter {
    options: ChromeOptions,
    http: reqwest::Client,
    attached: Mutex<Option<Attached>>,
    gate: TabGate,
}

impl ChromeAdapter {
    pub fn new(options: ChromeOptions) -> Self {
        Self {
            options,
            http: reqwest::Client::new(),
            attached: Mutex::new(None),
            gate: TabGate::default(),
        }
    }

    /// Liveness check against `/json/version`.
    async fn version_info(&self) -> Result<VersionInfo, BrowserError> {
        let url = format!("{}/json/version", self.options.endpoint.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .timeout(self.options.connect_timeout)
            .send()
            .await
            .map_err(|e| {
                BrowserError::SessionUnavailable(format!(
                    "could not reach Chrome debug port at {}: {e}",
                    self.options.endpoint
                ))
            })?;

        if !response.status().is_success() {
            return Err(BrowserError::SessionUnavailable(format!(
                "Chrome debug port returned status {}",
                response.status()
            )));
        }

        response.json::<VersionInfo>().await.map_err(|e| {
            BrowserError::SessionUnavailable(format!("unreadable /json/version payload: {e}"))
        })
    }

    fn attached_tab(&self, session: &Session) -> Result<Arc<Tab>, BrowserError> {
        let guard = self
            .attached
            .lock()
            .map_err(|_| BrowserError::SessionUnavailable("session lock poisoned".into()))?;
        match guard.as_ref() {
            Some(attached) if attached.target_id == session.target_id => {
                Ok(attached.tab.clone())
            }
            Some(_) => Err(BrowserError::SessionUnavailable(format!(
                "session {} is not the attached target",
                session.target_id
            ))),
            None => Err(BrowserError::SessionUnavailable(
                "session already released".into(),
            )),
        }
    }

    /// Distinguish a slow page from a dead browser after a failed call.
    async fn classify_failure(&self, fallback: BrowserError) -> BrowserError {
        match self.version_info().await {
            Ok(_) => fallback,
            Err(dead) => dead,
        }
    }
}

#[async_trait]
impl BrowserAdapter for ChromeAdapter {
    async fn acquire(&self) -> Result<Session, BrowserError> {
        let version = self.version_info().await?;
        info!(browser = %version.browser, "Connected to Chrome debug instance");

        let ws_url = version.ws_url.clone();
        let idle = self.options.idle_timeout;
        let connect = tokio::task::spawn_blocking(move || -> anyhow::Result<Attached> {
            let browser = Browser::connect_with_timeout(ws_url, idle)?;
            let existing = {
                let tabs = browser
                    .get_tabs()
                    .lock()
                    .map_err(|_| anyhow::anyhow!("tab list lock poisoned"))?;
                tabs.first().cloned()
            };
            let tab = match existing {
                Some(tab) => {
                    debug!("Using existing tab");
                    tab
                }
                None => {
                    debug!("No tabs found, creating new one");
                    browser.new_tab()?
                }
            };
            let target_id = tab.get_target_id().to_string();
            Ok(Attached {
                _browser: browser,
                tab,
                target_id,
            })
        });

        let attached = match tokio::time::timeout(self.options.connect_timeout, connect).await {
            Ok(Ok(Ok(attached))) => attached,
            Ok(Ok(Err(e))) => {
                return Err(BrowserError::SessionUnavailable(format!(
                    "no attachable page: {e:#}"
                )));
            }
            Ok(Err(e)) => {
                return Err(BrowserError::SessionUnavailable(format!(
                    "attach task panicked: {e}"
                )));
            }
            Err(_) => {
                return Err(BrowserError::SessionUnavailable(format!(
                    "attach timed out after {:?}",
                    self.options.connect_timeout
                )));
            }
        };

        let session = Session {
            endpoint: self.options.endpoint.clone(),
            target_id: attached.target_id.clone(),
            headless: self.options.headless,
        };

        let mut guard = self
            .attached
            .lock()
            .map_err(|_| BrowserError::SessionUnavailable("session lock poisoned".into()))?;
        *guard = Some(attached);
        info!(page = %session.target_id, "Attached to page");
        Ok(session)
    }

    async fn observe(&self, session: &Session) -> Result<Observation, BrowserError> {
        let tab = self.attached_tab(session)?;
        let settle = self.options.settle_timeout;
        let min_settle = self.options.min_settle;

        let capture = self
            .gate
            .run(move || -> anyhow::Result<Option<Observation>> {
                let deadline = std::time::Instant::now() + settle;
                while !dom::page_ready(&tab)? {
                    if std::time::Instant::now() >= deadline {
                        return Ok(None);
                    }
                    std::thread::sleep(Duration::from_millis(250));
                }
                std::thread::sleep(min_settle);
                Ok(Some(dom::capture_observation(&tab)?))
            });

        match tokio::time::timeout(settle + min_settle + Duration::from_secs(5), capture).await {
            Ok(Ok(Ok(Some(observation)))) => Ok(observation),
            Ok(Ok(Ok(None))) | Err(_) => Err(BrowserError::ObservationTimeout(settle)),
            Ok(Ok(Err(e))) => {
                warn!("Snapshot failed: {:#}", e);
                Err(self
                    .classify_failure(BrowserError::ObservationTimeout(settle))
                    .await)
            }
            Ok(Err(e)) => {
                warn!("Snapshot task panicked: {}", e);
                Err(BrowserError::ObservationTimeout(settle))
            }
        }
    }

    async fn act(&self, session: &Session, action: &Action) -> Result<(), BrowserError> {
        let tab = self.attached_tab(session)?;
        let action_clone = action.clone();
        let max_wait = self.options.max_wait;
        let run = self
            .gate
            .run(move || execute_action(&tab, &action_clone, max_wait));

        match tokio::time::timeout(self.options.action_timeout, run).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(self
                .classify_failure(BrowserError::action_failed(format!("{e:#}")))
                .await),
            Ok(Err(e)) => Err(BrowserError::action_failed(format!("action task panicked: {e}"))),
            Err(_) => Err(BrowserError::action_failed(format!(
                "timed out after {:?}",
                self.options.action_timeout
            ))),
        }
    }

    async fn release(&self, session: &Session) {
        let taken = match self.attached.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        match taken {
            // Dropping the handle closes our websocket only; the browser keeps running.
            Some(attached) => {
                let limit = self.options.action_timeout + self.options.settle_timeout;
                if !self.gate.drain(limit).await {
                    warn!(
                        page = %session.target_id,
                        "Tab still busy after {:?}, detaching anyway", limit
                    );
                }
                let _ = tokio::task::spawn_blocking(move || drop(attached)).await;
                info!(page = %session.target_id, "Browser connection released");
            }
            None => debug!(page = %session.target_id, "Release on detached session"),
        }
    }
}

/// Execute an action on the tab (blocking; run inside `spawn_blocking`).
fn execute_action(tab: &Arc<Tab>, action: &Action, max_wait: Duration) -> anyhow::Result<()> {
    match action {
        Action::Navigate { url } => {
            tab.navigate_to(url)?;
            tab.wait_until_navigated()?;
        }
        Action::Click { element } => {
            let el = tab.find_element(&dom::selector_for(element))?;
            el.click()?;
            std::thread::sleep(Duration::from_millis(1000));
        }
        Action::TypeInto { element, text } => {
            let selector = dom::selector_for(element);
            let el = tab.find_element(&selector)?;
            el.click()?;
            let js_sel = selector.replace('\'', "\\'");
            tab.evaluate(
                &format!("document.querySelector('{js_sel}').value = ''"),
                false,
            )?;
            tab.type_str(text)?;
        }
        Action::Scroll { direction } => {
            let sign = match direction {
                ScrollDirection::Up => "-",
                ScrollDirection::Down => "",
            };
            tab.evaluate(
                &format!("window.scrollBy(0, {sign}Math.round(window.innerHeight * 0.8))"),
                false,
            )?;
            std::thread::sleep(Duration::from_millis(500));
        }
        Action::PressKey { key } => {
            tab.press_key(key)?;
            std::thread::sleep(Duration::from_millis(1000));
        }
        Action::Wait { ms } => {
            std::thread::sleep(Duration::from_millis(*ms).min(max_wait));
        }
    }

    Ok(())
}
