//! Signaling relay - durable store plus delivery notification

use crate::error::Result;
use crate::models::*;
use crate::storage::SignalStore;
use crate::BackoffConfig;
use rand::Rng;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Persists and retrieves signaling messages and call records, and hands
/// out live inbound subscriptions. Carries no call semantics of its own.
pub struct SignalingRelay {
    store: Arc<dyn SignalStore>,
}

/// Handle for one user's inbound signal subscription.
///
/// Delivery is at-least-once: after a transport drop the relay reconnects
/// on its own and replays everything inserted after the last delivered
/// message, so consumers must tolerate duplicates.
pub struct InboundSubscription {
    rx: mpsc::UnboundedReceiver<SignalMessage>,
    task: JoinHandle<()>,
}

impl InboundSubscription {
    pub async fn recv(&mut self) -> Option<SignalMessage> {
        self.rx.recv().await
    }

    pub fn close(self) {
        self.task.abort();
    }
}

impl Drop for InboundSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl SignalingRelay {
    pub fn new(store: Arc<dyn SignalStore>) -> Self {
        Self { store }
    }

    /// Inserts a new history record with status `Initiated`. Write failures
    /// propagate; retrying is the caller's decision.
    pub async fn create_call(
        &self,
        caller_id: &str,
        receiver_id: &str,
        call_id: &str,
        mode: CallMode,
    ) -> Result<CallRecord> {
        let record = CallRecord {
            call_id: call_id.to_string(),
            caller_id: caller_id.to_string(),
            receiver_id: receiver_id.to_string(),
            mode,
            status: CallStatus::Initiated,
            started_at: chrono::Utc::now().timestamp_millis(),
            answered_at: None,
            ended_at: None,
            duration_seconds: None,
        };

        self.store.insert_call(&record).await?;
        Ok(record)
    }

    pub async fn update_call_status(
        &self,
        call_id: &str,
        status: CallStatus,
        duration_seconds: Option<i64>,
    ) -> Result<()> {
        self.store
            .update_call_status(call_id, status, duration_seconds)
            .await
    }

    /// Appends a new signal addressed to `to`. Messages are never mutated
    /// after insertion.
    pub async fn send_signal(
        &self,
        call_id: &str,
        from: &str,
        to: &str,
        payload: SignalPayload,
    ) -> Result<SignalMessage> {
        let signal = SignalMessage {
            signal_id: uuid::Uuid::new_v4().to_string(),
            call_id: call_id.to_string(),
            from_user_id: from.to_string(),
            to_user_id: to.to_string(),
            payload,
            processed: false,
            created_at: chrono::Utc::now().timestamp_millis(),
        };

        self.store.insert_signal(&signal).await?;
        Ok(signal)
    }

    pub async fn mark_processed(&self, signal_id: &str) -> Result<()> {
        self.store.mark_processed(signal_id).await
    }

    pub async fn get_call(&self, call_id: &str) -> Result<Option<CallRecord>> {
        self.store.get_call(call_id).await
    }

    pub async fn call_history(&self, user_id: &str) -> Result<Vec<CallRecord>> {
        self.store.calls_for_user(user_id).await
    }

    /// Opens a live subscription for every newly inserted signal addressed
    /// to `user_id`, in insertion order (per-call ordering is preserved).
    /// Reconnects with capped exponential backoff and replays the gap after
    /// every drop.
    pub fn subscribe_inbound(&self, user_id: &str, backoff: BackoffConfig) -> InboundSubscription {
        let store = self.store.clone();
        let user_id = user_id.to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let mut last_seen = chrono::Utc::now().timestamp_millis();
            let mut delay = backoff.base();

            loop {
                match store.open_feed(&user_id).await {
                    Ok(mut feed) => {
                        delay = backoff.base();

                        match store.signals_since(&user_id, last_seen).await {
                            Ok(missed) => {
                                for signal in missed {
                                    last_seen = last_seen.max(signal.created_at);
                                    if tx.send(signal).is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(e) => {
                                log::warn!("signal replay for {} failed: {}", user_id, e)
                            }
                        }

                        while let Some(signal) = feed.next().await {
                            last_seen = last_seen.max(signal.created_at);
                            if tx.send(signal).is_err() {
                                return;
                            }
                        }

                        log::info!("signal feed for {} dropped, reconnecting", user_id);
                    }
                    Err(e) => {
                        log::warn!("signal feed for {} failed to open: {}", user_id, e);
                    }
                }

                let jitter_ms = {
                    let mut rng = rand::thread_rng();
                    rng.gen_range(0..=delay.as_millis() as u64 / 4)
                };
                tokio::time::sleep(delay + std::time::Duration::from_millis(jitter_ms)).await;
                delay = (delay * 2).min(backoff.max());
            }
        });

        InboundSubscription { rx, task }
    }
}
