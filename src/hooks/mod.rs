// HTTP webhook dispatch.
//
// The driver decides *when* to fire which hook and with which url list
// (copied from config before the first await, since a reload can swap the
// snapshot mid-iteration); this module knows *how* to call one url.
// Rejecting hooks (`on_connect`, `on_publish`, `on_play`) deny the
// connection; teardown hooks never fail the session.

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{Result, SessionError};
use crate::protocol::Request;

#[async_trait]
pub trait HttpHooks: Send + Sync {
    async fn on_connect(&self, url: &str, session_id: u64, req: &Request) -> Result<()>;
    async fn on_close(
        &self,
        url: &str,
        session_id: u64,
        req: &Request,
        send_bytes: u64,
        recv_bytes: u64,
    );
    async fn on_publish(&self, url: &str, session_id: u64, req: &Request) -> Result<()>;
    async fn on_unpublish(&self, url: &str, session_id: u64, req: &Request);
    async fn on_play(&self, url: &str, session_id: u64, req: &Request) -> Result<()>;
    async fn on_stop(&self, url: &str, session_id: u64, req: &Request);
}

/// Default implementation: JSON POST per event, `{"code": 0}` (or a bare
/// `0` body) means allow.
pub struct WebHookClient {
    http: reqwest::Client,
}

impl WebHookClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    async fn post(
        &self,
        action: &'static str,
        url: &str,
        body: serde_json::Value,
    ) -> Result<()> {
        let resp = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SessionError::HookDenied {
                action,
                url: format!("{url}: {e}"),
            })?;

        if !resp.status().is_success() {
            return Err(SessionError::HookDenied {
                action,
                url: format!("{url}: http {}", resp.status()),
            });
        }

        let text = resp.text().await.unwrap_or_default();
        if hook_allows(&text) {
            debug!(action, url, "http hook ok");
            return Ok(());
        }
        Err(SessionError::HookDenied {
            action,
            url: url.to_string(),
        })
    }

    fn event_body(
        &self,
        action: &str,
        session_id: u64,
        req: &Request,
    ) -> serde_json::Value {
        json!({
            "action": action,
            "client_id": session_id,
            "ip": req.ip,
            "vhost": req.vhost,
            "app": req.app,
            "stream": req.stream,
            "tcUrl": req.tc_url,
            "pageUrl": req.page_url,
        })
    }
}

impl Default for WebHookClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Empty body, literal `0`, or a JSON object with `code == 0` all allow.
fn hook_allows(body: &str) -> bool {
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed == "0" {
        return true;
    }
    serde_json::from_str::<serde_json::Value>(trimmed)
        .ok()
        .and_then(|v| v.get("code").and_then(|c| c.as_i64()))
        .map(|code| code == 0)
        .unwrap_or(false)
}

#[async_trait]
impl HttpHooks for WebHookClient {
    async fn on_connect(&self, url: &str, session_id: u64, req: &Request) -> Result<()> {
        self.post("on_connect", url, self.event_body("on_connect", session_id, req))
            .await
    }

    async fn on_close(
        &self,
        url: &str,
        session_id: u64,
        req: &Request,
        send_bytes: u64,
        recv_bytes: u64,
    ) {
        let mut body = self.event_body("on_close", session_id, req);
        body["send_bytes"] = send_bytes.into();
        body["recv_bytes"] = recv_bytes.into();
        if let Err(e) = self.post("on_close", url, body).await {
            warn!(url, "on_close hook failed, ignored: {e}");
        }
    }

    async fn on_publish(&self, url: &str, session_id: u64, req: &Request) -> Result<()> {
        self.post("on_publish", url, self.event_body("on_publish", session_id, req))
            .await
    }

    async fn on_unpublish(&self, url: &str, session_id: u64, req: &Request) {
        let body = self.event_body("on_unpublish", session_id, req);
        if let Err(e) = self.post("on_unpublish", url, body).await {
            warn!(url, "on_unpublish hook failed, ignored: {e}");
        }
    }

    async fn on_play(&self, url: &str, session_id: u64, req: &Request) -> Result<()> {
        self.post("on_play", url, self.event_body("on_play", session_id, req))
            .await
    }

    async fn on_stop(&self, url: &str, session_id: u64, req: &Request) {
        let body = self.event_body("on_stop", session_id, req);
        if let Err(e) = self.post("on_stop", url, body).await {
            warn!(url, "on_stop hook failed, ignored: {e}");
        }
    }
}
