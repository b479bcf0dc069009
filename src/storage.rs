//! Signal store boundary and the SQLite-backed implementation

use crate::error::{Error, Result};
use crate::models::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use tokio::sync::{broadcast, mpsc};

/// Live feed of newly inserted signals addressed to one user.
///
/// The feed ends when the underlying transport drops; reconnecting and
/// replaying the gap is the relay's job, not the store's.
pub struct SignalFeed {
    rx: mpsc::UnboundedReceiver<SignalMessage>,
}

impl SignalFeed {
    pub fn new(rx: mpsc::UnboundedReceiver<SignalMessage>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<SignalMessage> {
        self.rx.recv().await
    }
}

/// Persistence boundary for signaling messages and call records.
///
/// Implementations carry no call semantics: ordering within a call id and
/// at-least-once delivery are the only contracts the relay builds on.
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Appends a new message. Existing messages are never mutated.
    async fn insert_signal(&self, signal: &SignalMessage) -> Result<()>;

    /// Idempotent; marking an unknown or already-processed id is a no-op.
    async fn mark_processed(&self, signal_id: &str) -> Result<()>;

    /// Unprocessed messages for `user_id` inserted at or after `after` (ms
    /// since epoch), oldest first. Used to replay a gap after a feed drop;
    /// the bound is inclusive so same-millisecond neighbours of the last
    /// delivered message are re-sent rather than lost.
    async fn signals_since(&self, user_id: &str, after: i64) -> Result<Vec<SignalMessage>>;

    async fn insert_call(&self, record: &CallRecord) -> Result<()>;

    /// Sets the status and the matching timestamp field (answered_at for
    /// Answered, ended_at for a terminal status). Fails with `NotFound` for
    /// an unknown call id; a record already in a terminal status is left
    /// untouched.
    async fn update_call_status(
        &self,
        call_id: &str,
        status: CallStatus,
        duration_seconds: Option<i64>,
    ) -> Result<()>;

    async fn get_call(&self, call_id: &str) -> Result<Option<CallRecord>>;

    /// Records where the user is either side of the call, newest first.
    async fn calls_for_user(&self, user_id: &str) -> Result<Vec<CallRecord>>;

    /// Opens a live feed of newly inserted signals addressed to `user_id`.
    async fn open_feed(&self, user_id: &str) -> Result<SignalFeed>;
}

// ============================================================================
// SQLite store
// ============================================================================

type SignalRow = (String, String, String, String, String, i32, i64);

/// SQLite-backed store. Insert notifications fan out through an in-process
/// broadcast channel, so feeds only observe inserts made through the same
/// store instance.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    inserted: broadcast::Sender<SignalMessage>,
}

impl SqliteStore {
    pub fn open(data_dir: &str) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = Path::new(data_dir).join("wavecall.db");
        Self::from_connection(Connection::open(db_path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let (inserted, _) = broadcast::channel(256);
        let store = Self {
            conn: Mutex::new(conn),
            inserted,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                signal_id TEXT PRIMARY KEY,
                call_id TEXT NOT NULL,
                from_user_id TEXT NOT NULL,
                to_user_id TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS calls (
                call_id TEXT PRIMARY KEY,
                caller_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                mode TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                answered_at INTEGER,
                ended_at INTEGER,
                duration_seconds INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_signals_recipient ON signals(to_user_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_calls_caller ON calls(caller_id);
            CREATE INDEX IF NOT EXISTS idx_calls_receiver ON calls(receiver_id);
            "#,
        )?;

        Ok(())
    }

    fn row_to_signal(row: &rusqlite::Row<'_>) -> rusqlite::Result<SignalRow> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
        ))
    }

    fn row_to_call(row: &rusqlite::Row<'_>) -> rusqlite::Result<CallRecord> {
        let mode_str: String = row.get(3)?;
        let status_str: String = row.get(4)?;

        Ok(CallRecord {
            call_id: row.get(0)?,
            caller_id: row.get(1)?,
            receiver_id: row.get(2)?,
            mode: match mode_str.as_str() {
                "video" => CallMode::Video,
                _ => CallMode::Voice,
            },
            status: match status_str.as_str() {
                "answered" => CallStatus::Answered,
                "ended" => CallStatus::Ended,
                "missed" => CallStatus::Missed,
                "rejected" => CallStatus::Rejected,
                "failed" => CallStatus::Failed,
                _ => CallStatus::Initiated,
            },
            started_at: row.get(5)?,
            answered_at: row.get(6)?,
            ended_at: row.get(7)?,
            duration_seconds: row.get(8)?,
        })
    }
}

fn status_str(status: CallStatus) -> String {
    format!("{:?}", status).to_lowercase()
}

fn mode_str(mode: CallMode) -> String {
    format!("{:?}", mode).to_lowercase()
}

#[async_trait]
impl SignalStore for SqliteStore {
    async fn insert_signal(&self, signal: &SignalMessage) -> Result<()> {
        let payload_json = serde_json::to_string(&signal.payload)?;

        {
            let conn = self.conn.lock();
            conn.execute(
                r#"INSERT INTO signals
                   (signal_id, call_id, from_user_id, to_user_id, payload_json, processed, created_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
                params![
                    signal.signal_id,
                    signal.call_id,
                    signal.from_user_id,
                    signal.to_user_id,
                    payload_json,
                    signal.processed as i32,
                    signal.created_at,
                ],
            )?;
        }

        // Subscribers may be absent; that is not a delivery failure.
        let _ = self.inserted.send(signal.clone());

        Ok(())
    }

    async fn mark_processed(&self, signal_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE signals SET processed = 1 WHERE signal_id = ?1",
            params![signal_id],
        )?;
        Ok(())
    }

    async fn signals_since(&self, user_id: &str, after: i64) -> Result<Vec<SignalMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"SELECT signal_id, call_id, from_user_id, to_user_id, payload_json, processed, created_at
               FROM signals
               WHERE to_user_id = ?1 AND processed = 0 AND created_at >= ?2
               ORDER BY created_at ASC, rowid ASC"#,
        )?;

        let rows = stmt.query_map(params![user_id, after], Self::row_to_signal)?;

        let mut signals = Vec::new();
        for row in rows {
            let (signal_id, call_id, from_user_id, to_user_id, payload_json, processed, created_at) =
                row?;
            signals.push(SignalMessage {
                signal_id,
                call_id,
                from_user_id,
                to_user_id,
                payload: serde_json::from_str(&payload_json)?,
                processed: processed != 0,
                created_at,
            });
        }

        Ok(signals)
    }

    async fn insert_call(&self, record: &CallRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT INTO calls
               (call_id, caller_id, receiver_id, mode, status, started_at, answered_at, ended_at, duration_seconds)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            params![
                record.call_id,
                record.caller_id,
                record.receiver_id,
                mode_str(record.mode),
                status_str(record.status),
                record.started_at,
                record.answered_at,
                record.ended_at,
                record.duration_seconds,
            ],
        )?;
        Ok(())
    }

    async fn update_call_status(
        &self,
        call_id: &str,
        status: CallStatus,
        duration_seconds: Option<i64>,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let conn = self.conn.lock();

        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM calls WHERE call_id = ?1",
                params![call_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let current = match current {
            Some(s) => s,
            None => return Err(Error::NotFound(call_id.to_string())),
        };

        let already_terminal = matches!(
            current.as_str(),
            "ended" | "missed" | "rejected" | "failed"
        );
        if already_terminal {
            log::debug!("call {} already closed as {}, keeping it", call_id, current);
            return Ok(());
        }

        if status == CallStatus::Answered {
            conn.execute(
                "UPDATE calls SET status = ?1, answered_at = ?2 WHERE call_id = ?3",
                params![status_str(status), now, call_id],
            )?;
        } else if status.is_terminal() {
            conn.execute(
                "UPDATE calls SET status = ?1, ended_at = ?2, duration_seconds = ?3 WHERE call_id = ?4",
                params![status_str(status), now, duration_seconds, call_id],
            )?;
        } else {
            conn.execute(
                "UPDATE calls SET status = ?1 WHERE call_id = ?2",
                params![status_str(status), call_id],
            )?;
        }

        Ok(())
    }

    async fn get_call(&self, call_id: &str) -> Result<Option<CallRecord>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            r#"SELECT call_id, caller_id, receiver_id, mode, status, started_at, answered_at, ended_at, duration_seconds
               FROM calls WHERE call_id = ?1"#,
            params![call_id],
            Self::row_to_call,
        );

        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn calls_for_user(&self, user_id: &str) -> Result<Vec<CallRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"SELECT call_id, caller_id, receiver_id, mode, status, started_at, answered_at, ended_at, duration_seconds
               FROM calls
               WHERE caller_id = ?1 OR receiver_id = ?1
               ORDER BY started_at DESC"#,
        )?;

        let rows = stmt.query_map(params![user_id], Self::row_to_call)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }

        Ok(records)
    }

    async fn open_feed(&self, user_id: &str) -> Result<SignalFeed> {
        let mut inserts = self.inserted.subscribe();
        let user_id = user_id.to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                match inserts.recv().await {
                    Ok(signal) => {
                        if signal.to_user_id != user_id {
                            continue;
                        }
                        if tx.send(signal).is_err() {
                            break;
                        }
                    }
                    // A lagged subscriber has lost messages; end the feed so
                    // the relay reconnects and replays the gap.
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("signal feed for {} lagged by {}", user_id, n);
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(SignalFeed::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(id: &str, call_id: &str, to: &str, created_at: i64) -> SignalMessage {
        SignalMessage {
            signal_id: id.to_string(),
            call_id: call_id.to_string(),
            from_user_id: "alice".to_string(),
            to_user_id: to.to_string(),
            payload: SignalPayload::IceCandidate {
                candidate: format!("candidate {}", id),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            },
            processed: false,
            created_at,
        }
    }

    fn record(call_id: &str) -> CallRecord {
        CallRecord {
            call_id: call_id.to_string(),
            caller_id: "alice".to_string(),
            receiver_id: "bob".to_string(),
            mode: CallMode::Video,
            status: CallStatus::Initiated,
            started_at: 1_000,
            answered_at: None,
            ended_at: None,
            duration_seconds: None,
        }
    }

    #[tokio::test]
    async fn test_call_record_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_call(&record("c1")).await.unwrap();

        let fetched = store.get_call("c1").await.unwrap().unwrap();
        assert_eq!(fetched, record("c1"));
        assert!(store.get_call("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_call_status_timestamps() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_call(&record("c1")).await.unwrap();

        store
            .update_call_status("c1", CallStatus::Answered, None)
            .await
            .unwrap();
        let answered = store.get_call("c1").await.unwrap().unwrap();
        assert_eq!(answered.status, CallStatus::Answered);
        assert!(answered.answered_at.is_some());
        assert!(answered.ended_at.is_none());

        store
            .update_call_status("c1", CallStatus::Ended, Some(42))
            .await
            .unwrap();
        let ended = store.get_call("c1").await.unwrap().unwrap();
        assert_eq!(ended.status, CallStatus::Ended);
        assert!(ended.ended_at.is_some());
        assert_eq!(ended.duration_seconds, Some(42));
    }

    #[tokio::test]
    async fn test_terminal_status_set_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_call(&record("c1")).await.unwrap();

        store
            .update_call_status("c1", CallStatus::Rejected, None)
            .await
            .unwrap();
        store
            .update_call_status("c1", CallStatus::Ended, Some(10))
            .await
            .unwrap();

        let fetched = store.get_call("c1").await.unwrap().unwrap();
        assert_eq!(fetched.status, CallStatus::Rejected);
        assert_eq!(fetched.duration_seconds, None);
    }

    #[tokio::test]
    async fn test_update_unknown_call_fails() {
        let store = SqliteStore::open_in_memory().unwrap();
        let result = store
            .update_call_status("missing", CallStatus::Ended, None)
            .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_mark_processed_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_signal(&signal("s1", "c1", "bob", 10)).await.unwrap();
        store.insert_signal(&signal("s2", "c1", "bob", 20)).await.unwrap();

        store.mark_processed("s1").await.unwrap();
        store.mark_processed("s1").await.unwrap();
        store.mark_processed("unknown").await.unwrap();

        let pending = store.signals_since("bob", 0).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].signal_id, "s2");
    }

    #[tokio::test]
    async fn test_signals_since_order_and_filter() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_signal(&signal("s1", "c1", "bob", 10)).await.unwrap();
        store.insert_signal(&signal("s2", "c1", "bob", 20)).await.unwrap();
        store.insert_signal(&signal("s3", "c1", "carol", 30)).await.unwrap();
        store.insert_signal(&signal("s4", "c1", "bob", 40)).await.unwrap();

        let since = store.signals_since("bob", 20).await.unwrap();
        let ids: Vec<_> = since.iter().map(|s| s.signal_id.as_str()).collect();
        assert_eq!(ids, vec!["s2", "s4"]);

        // Payloads survive the trip through the store unchanged.
        assert_eq!(since[0].payload, signal("s2", "c1", "bob", 20).payload);
    }

    #[tokio::test]
    async fn test_feed_delivers_only_addressed_signals() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut feed = store.open_feed("bob").await.unwrap();

        store.insert_signal(&signal("s1", "c1", "carol", 10)).await.unwrap();
        store.insert_signal(&signal("s2", "c1", "bob", 20)).await.unwrap();

        let delivered = tokio::time::timeout(std::time::Duration::from_secs(1), feed.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.signal_id, "s2");
    }
}
