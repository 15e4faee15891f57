use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{Result, ReviewError};
use crate::transport::{extract_envelope, Conversation, ExchangeRequest, Reply, RequestKind, Transport};

const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";
const ENTER_KEY: &str = "\u{E007}";

/// Selectors tried in order when locating the composer.
const COMPOSER_SELECTORS: &[&str] = &["textarea", "div[contenteditable='true']"];

/// Selector for assistant message blocks.
const ASSISTANT_SELECTOR: &str = "div[data-message-author-role='assistant']";

/// Reply is considered complete once its text has been stable this long.
const STREAM_IDLE: Duration = Duration::from_secs(2);

/// Poll cadence while waiting for the composer or a streaming reply.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Phrases the page uses to ask whether to keep going; answered with
/// "continue" when the run is in auto mode.
const CONTINUE_MARKERS: &[&str] = &["reply continue", "say continue", "shall i continue"];

const MAX_CONTINUATIONS: u32 = 5;

/// Exclusive lock on the browser profile directory. A second orchestrator
/// reusing the same user-data dir fails fast instead of corrupting it.
#[derive(Debug)]
pub struct ProfileLock {
    path: PathBuf,
}

impl ProfileLock {
    pub fn acquire(profile_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(profile_dir)?;
        let path = profile_dir.join(".autoreview.lock");

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                use std::io::Write;
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(ReviewError::ResourceInUse(profile_dir.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for ProfileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Browser transport: drives an interactive chat page through a local
/// WebDriver endpoint (chromedriver). The page session itself holds the
/// conversation, so only the current prompt is typed; the system prompt is
/// prepended to the very first message.
pub struct BrowserTransport {
    http: reqwest::Client,
    webdriver_url: String,
    chat_url: String,
    ui_wait: Duration,
    auto: bool,
    session: Mutex<BrowserSession>,
    _lock: ProfileLock,
}

#[derive(Debug, Default)]
struct BrowserSession {
    id: Option<String>,
    sent_system: bool,
}

impl BrowserTransport {
    pub async fn connect(
        webdriver_url: &str,
        chat_url: &str,
        profile_dir: &Path,
        headless: bool,
        ui_wait: Duration,
        auto: bool,
    ) -> Result<Self> {
        let lock = ProfileLock::acquire(profile_dir)?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        let transport = Self {
            http,
            webdriver_url: webdriver_url.trim_end_matches('/').to_string(),
            chat_url: chat_url.to_string(),
            ui_wait,
            auto,
            session: Mutex::new(BrowserSession::default()),
            _lock: lock,
        };

        let session_id = transport.create_session(profile_dir, headless).await?;
        transport.navigate(&session_id, chat_url).await?;
        transport.session.lock().await.id = Some(session_id);
        info!("browser session established at {chat_url}");
        Ok(transport)
    }

    async fn wd(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}{path}", self.webdriver_url);
        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ReviewError::TransportUiFailure(format!("webdriver unreachable: {e}")))?;
        let status = response.status();
        let value: Value = response
            .json()
            .await
            .map_err(|e| ReviewError::TransportUiFailure(format!("webdriver reply: {e}")))?;

        if !status.is_success() {
            let message = value
                .pointer("/value/message")
                .and_then(Value::as_str)
                .unwrap_or("unknown webdriver error");
            return Err(ReviewError::TransportUiFailure(format!(
                "{path}: {message}"
            )));
        }
        Ok(value["value"].clone())
    }

    async fn create_session(&self, profile_dir: &Path, headless: bool) -> Result<String> {
        let mut args = vec![
            format!("--user-data-dir={}", profile_dir.display()),
            "--disable-gpu".to_string(),
            "--no-sandbox".to_string(),
        ];
        if headless {
            args.push("--headless=new".to_string());
        }

        let body = json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": args }
                }
            }
        });

        let value = self.wd(reqwest::Method::POST, "/session", Some(body)).await?;
        value["sessionId"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                ReviewError::TransportUiFailure("webdriver session has no id".into())
            })
    }

    async fn navigate(&self, session_id: &str, url: &str) -> Result<()> {
        self.wd(
            reqwest::Method::POST,
            &format!("/session/{session_id}/url"),
            Some(json!({ "url": url })),
        )
        .await?;
        Ok(())
    }

    async fn find_element(&self, session_id: &str, selector: &str) -> Result<Option<String>> {
        let result = self
            .wd(
                reqwest::Method::POST,
                &format!("/session/{session_id}/element"),
                Some(json!({ "using": "css selector", "value": selector })),
            )
            .await;
        match result {
            Ok(value) => Ok(value[ELEMENT_KEY].as_str().map(str::to_string)),
            Err(ReviewError::TransportUiFailure(msg)) if msg.contains("no such element") => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn find_elements(&self, session_id: &str, selector: &str) -> Result<Vec<String>> {
        let value = self
            .wd(
                reqwest::Method::POST,
                &format!("/session/{session_id}/elements"),
                Some(json!({ "using": "css selector", "value": selector })),
            )
            .await?;
        Ok(value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i[ELEMENT_KEY].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn element_text(&self, session_id: &str, element_id: &str) -> Result<String> {
        let value = self
            .wd(
                reqwest::Method::GET,
                &format!("/session/{session_id}/element/{element_id}/text"),
                None,
            )
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    /// Wait for a usable composer, surviving login redirects.
    async fn wait_composer(&self, session_id: &str, cancel: &CancelToken) -> Result<String> {
        let deadline = Instant::now() + self.ui_wait;
        loop {
            cancel.check()?;
            for selector in COMPOSER_SELECTORS {
                if let Some(id) = self.find_element(session_id, selector).await? {
                    return Ok(id);
                }
            }
            if Instant::now() >= deadline {
                return Err(ReviewError::TransportUiFailure(
                    "composer element not found within UI wait".into(),
                ));
            }
            debug!("composer not present yet, waiting");
            cancel.sleep(POLL_INTERVAL).await?;
        }
    }

    /// Clear any draft, type the message, press Enter.
    async fn send_message(&self, session_id: &str, text: &str, cancel: &CancelToken) -> Result<()> {
        let composer = self.wait_composer(session_id, cancel).await?;
        self.wd(
            reqwest::Method::POST,
            &format!("/session/{session_id}/element/{composer}/clear"),
            Some(json!({})),
        )
        .await?;
        self.wd(
            reqwest::Method::POST,
            &format!("/session/{session_id}/element/{composer}/value"),
            Some(json!({ "text": format!("{text}{ENTER_KEY}") })),
        )
        .await?;
        debug!("sent {} chars to composer", text.len());
        Ok(())
    }

    /// Wait for streaming to finish: the newest assistant block counts as
    /// complete once its text has been stable for `STREAM_IDLE`.
    async fn wait_reply(
        &self,
        session_id: &str,
        seen_blocks: usize,
        cancel: &CancelToken,
    ) -> Result<String> {
        let deadline = Instant::now() + self.ui_wait;
        let mut last_text = String::new();
        let mut last_change = Instant::now();

        loop {
            cancel.check()?;
            let blocks = self.find_elements(session_id, ASSISTANT_SELECTOR).await?;
            if blocks.len() > seen_blocks {
                let newest = blocks.last().expect("non-empty");
                let text = self.element_text(session_id, newest).await?;
                if text != last_text {
                    last_text = text;
                    last_change = Instant::now();
                } else if !last_text.is_empty() && last_change.elapsed() >= STREAM_IDLE {
                    return Ok(last_text);
                }
            }
            if Instant::now() >= deadline {
                return Err(ReviewError::TransportUiFailure(
                    "assistant reply did not arrive within UI wait".into(),
                ));
            }
            cancel.sleep(POLL_INTERVAL).await?;
        }
    }

    async fn assistant_block_count(&self, session_id: &str) -> Result<usize> {
        Ok(self.find_elements(session_id, ASSISTANT_SELECTOR).await?.len())
    }
}

/// True when the reply is the page asking permission to continue rather
/// than a payload.
fn is_continue_prompt(text: &str) -> bool {
    let lower = text.to_lowercase();
    CONTINUE_MARKERS.iter().any(|m| lower.contains(m))
}

#[async_trait]
impl Transport for BrowserTransport {
    async fn exchange(
        &self,
        conversation: &Conversation,
        request: &ExchangeRequest,
        cancel: &CancelToken,
    ) -> Result<Reply> {
        let mut session = self.session.lock().await;
        let session_id = session
            .id
            .clone()
            .ok_or_else(|| ReviewError::TransportUiFailure("session already closed".into()))?;

        // The page session carries history; only the first message needs the
        // system framing.
        let message = if session.sent_system {
            request.prompt.clone()
        } else {
            session.sent_system = true;
            format!("{}\n\n{}", conversation.system(), request.prompt)
        };

        let mut seen = self.assistant_block_count(&session_id).await?;
        self.send_message(&session_id, &message, cancel).await?;

        let mut text = self.wait_reply(&session_id, seen, cancel).await?;
        let mut continuations = 0;
        while self.auto && is_continue_prompt(&text) && continuations < MAX_CONTINUATIONS {
            info!("page asked to continue; answering");
            seen = self.assistant_block_count(&session_id).await?;
            self.send_message(&session_id, "continue", cancel).await?;
            text = self.wait_reply(&session_id, seen, cancel).await?;
            continuations += 1;
        }

        let envelope = extract_envelope(&text)?;
        Ok(match request.kind {
            RequestKind::Patch => Reply::Patch(envelope),
            RequestKind::Plan => Reply::Plan(envelope),
        })
    }

    /// Tear the WebDriver session down; the profile lock releases on drop.
    async fn cancel(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if let Some(id) = session.id.take() {
            if let Err(e) = self
                .wd(reqwest::Method::DELETE, &format!("/session/{id}"), None)
                .await
            {
                warn!("failed to close browser session: {e}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let first = ProfileLock::acquire(dir.path()).unwrap();

        let second = ProfileLock::acquire(dir.path());
        assert!(matches!(second, Err(ReviewError::ResourceInUse(_))));

        drop(first);
        let third = ProfileLock::acquire(dir.path());
        assert!(third.is_ok());
    }

    #[test]
    fn continue_prompt_detection() {
        assert!(is_continue_prompt("That's a lot of output. Reply CONTINUE for more."));
        assert!(is_continue_prompt("Shall I continue with the next file?"));
        assert!(!is_continue_prompt(r#"{"op":"create","file":"a","status":"in_progress"}"#));
    }
}
