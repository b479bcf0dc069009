//! Remote signal store - HTTP API and WebSocket feed

use crate::call::ProfileSource;
use crate::error::{Error, Result};
use crate::models::*;
use crate::storage::{SignalFeed, SignalStore};
use crate::RelayEndpoint;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use url::Url;

/// Store implementation against the remote backend: HTTP for writes and
/// queries, an authenticated WebSocket for the live signal feed.
pub struct RemoteStore {
    http: Client,
    base_url: String,
    ws_url: String,
    token: Mutex<Option<String>>,
}

impl RemoteStore {
    pub fn new(endpoint: &RelayEndpoint) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            http,
            base_url: endpoint.http_url(),
            ws_url: endpoint.ws_url(),
            token: Mutex::new(None),
        })
    }

    /// Bearer token used for both HTTP calls and the feed handshake.
    pub fn set_token(&self, token: &str) {
        *self.token.lock() = Some(token.to_string());
    }

    fn auth_header(&self) -> Option<String> {
        self.token.lock().as_ref().map(|t| format!("Bearer {}", t))
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.get(format!("{}{}", self.base_url, path));
        if let Some(auth) = self.auth_header() {
            req = req.header("Authorization", auth);
        }
        req
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.post(format!("{}{}", self.base_url, path));
        if let Some(auth) = self.auth_header() {
            req = req.header("Authorization", auth);
        }
        req
    }

    fn patch(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.patch(format!("{}{}", self.base_url, path));
        if let Some(auth) = self.auth_header() {
            req = req.header("Authorization", auth);
        }
        req
    }
}

#[async_trait]
impl SignalStore for RemoteStore {
    async fn insert_signal(&self, signal: &SignalMessage) -> Result<()> {
        let resp = self.post("/api/v1/signals").json(signal).send().await?;

        if !resp.status().is_success() {
            return Err(Error::Store(format!(
                "signal insert failed: {}",
                resp.status()
            )));
        }

        Ok(())
    }

    async fn mark_processed(&self, signal_id: &str) -> Result<()> {
        let resp = self
            .post(&format!("/api/v1/signals/{}/processed", signal_id))
            .send()
            .await?;

        // 404 means the id is unknown here, which mark-processed tolerates.
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            return Err(Error::Store(format!(
                "mark processed failed: {}",
                resp.status()
            )));
        }

        Ok(())
    }

    async fn signals_since(&self, user_id: &str, after: i64) -> Result<Vec<SignalMessage>> {
        let after = after.to_string();
        let resp = self
            .get("/api/v1/signals")
            .query(&[("to_user_id", user_id), ("after", after.as_str())])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::Store(format!(
                "signal fetch failed: {}",
                resp.status()
            )));
        }

        let signals: Vec<SignalMessage> = resp.json().await?;
        Ok(signals)
    }

    async fn insert_call(&self, record: &CallRecord) -> Result<()> {
        let resp = self.post("/api/v1/calls").json(record).send().await?;

        if !resp.status().is_success() {
            return Err(Error::Store(format!(
                "call insert failed: {}",
                resp.status()
            )));
        }

        Ok(())
    }

    async fn update_call_status(
        &self,
        call_id: &str,
        status: CallStatus,
        duration_seconds: Option<i64>,
    ) -> Result<()> {
        let resp = self
            .patch(&format!("/api/v1/calls/{}", call_id))
            .json(&json!({
                "status": status,
                "duration_seconds": duration_seconds,
            }))
            .send()
            .await?;

        if resp.status().as_u16() == 404 {
            return Err(Error::NotFound(call_id.to_string()));
        }
        if !resp.status().is_success() {
            return Err(Error::Store(format!(
                "call update failed: {}",
                resp.status()
            )));
        }

        Ok(())
    }

    async fn get_call(&self, call_id: &str) -> Result<Option<CallRecord>> {
        let resp = self.get(&format!("/api/v1/calls/{}", call_id)).send().await?;

        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Error::Store(format!(
                "call fetch failed: {}",
                resp.status()
            )));
        }

        let record: CallRecord = resp.json().await?;
        Ok(Some(record))
    }

    async fn calls_for_user(&self, user_id: &str) -> Result<Vec<CallRecord>> {
        let resp = self
            .get("/api/v1/calls")
            .query(&[("user_id", user_id)])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::Store(format!(
                "call history fetch failed: {}",
                resp.status()
            )));
        }

        let records: Vec<CallRecord> = resp.json().await?;
        Ok(records)
    }

    async fn open_feed(&self, user_id: &str) -> Result<SignalFeed> {
        let mut url = Url::parse(&self.ws_url).map_err(|e| Error::WebSocket(e.to_string()))?;
        url.query_pairs_mut().append_pair("user_id", user_id);

        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let token = self.token.lock().clone();
        if let Some(token) = token {
            let auth_msg = json!({
                "type": "authenticate",
                "payload": { "token": token }
            });
            write.send(WsMessage::Text(auth_msg.to_string())).await?;
        }

        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        if let Ok(data) = serde_json::from_str::<serde_json::Value>(&text) {
                            if data["type"] == "signal" {
                                if let Some(payload) = data.get("payload") {
                                    if let Ok(signal) =
                                        serde_json::from_value::<SignalMessage>(payload.clone())
                                    {
                                        if tx.send(signal).is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                        }
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            // Dropping the write half tears the socket down with the feed.
            drop(write);
        });

        Ok(SignalFeed::new(rx))
    }
}

#[async_trait]
impl ProfileSource for RemoteStore {
    async fn fetch_profile(&self, user_id: &str) -> Result<RemoteProfile> {
        let resp = self.get(&format!("/api/v1/users/{}", user_id)).send().await?;

        if resp.status().as_u16() == 404 {
            return Err(Error::NotFound(user_id.to_string()));
        }

        let data: serde_json::Value = resp.json().await?;

        Ok(RemoteProfile {
            user_id: data["user_id"].as_str().unwrap_or(user_id).to_string(),
            display_name: data["display_name"].as_str().map(|s| s.to_string()),
            avatar_file_id: data["avatar_file_id"].as_str().map(|s| s.to_string()),
        })
    }
}
