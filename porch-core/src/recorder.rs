//! State persistence via SQLite + WAL
//!
//! Write-through on every state change with async batch coalescing (100ms).
//! On startup the last recorded state of each entity is read back so that
//! entities which restore themselves (input buttons) can pick it up.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tokio::sync::mpsc;

use crate::state::StateChangedEvent;

/// A state change queued for persistence.
enum PendingWrite {
    Upsert {
        entity_id: String,
        state: String,
        attributes_json: String,
        last_changed: String,
        last_updated: String,
    },
    Delete {
        entity_id: String,
    },
}

/// Last recorded state of an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredState {
    pub state: String,
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub last_changed: Option<DateTime<Utc>>,
}

/// Open (or create) the SQLite database with WAL mode.
fn open_db(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "wal")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS entity_states (
            entity_id   TEXT PRIMARY KEY,
            state       TEXT NOT NULL,
            attributes  TEXT NOT NULL DEFAULT '{}',
            last_changed TEXT NOT NULL,
            last_updated TEXT NOT NULL
        );",
    )?;

    Ok(conn)
}

/// Read the last recorded state of every entity.
/// Called once at startup before integrations set up their entities.
pub fn load_last_states(db_path: &Path) -> anyhow::Result<HashMap<String, RestoredState>> {
    let conn = open_db(db_path)?;
    let mut stmt = conn.prepare("SELECT entity_id, state, attributes, last_changed FROM entity_states")?;

    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut states = HashMap::new();
    for row in rows {
        let (entity_id, state, attrs_json, last_changed) = row?;
        let attributes = serde_json::from_str(&attrs_json).unwrap_or_default();
        let last_changed = DateTime::parse_from_rfc3339(&last_changed)
            .ok()
            .map(|t| t.with_timezone(&Utc));
        states.insert(
            entity_id,
            RestoredState {
                state,
                attributes,
                last_changed,
            },
        );
    }

    tracing::info!("Recorder: loaded {} recorded states", states.len());
    Ok(states)
}

/// Spawn the async persistence writer.
///
/// Returns an mpsc sender. The caller feeds StateChangedEvents into it;
/// the writer batches them with 100ms coalescing and writes to SQLite.
pub fn spawn_writer(db_path: PathBuf) -> mpsc::UnboundedSender<StateChangedEvent> {
    let (tx, rx) = mpsc::unbounded_channel::<StateChangedEvent>();

    // Dedicated blocking thread; rusqlite is synchronous.
    tokio::task::spawn_blocking(move || {
        writer_loop(db_path, rx);
    });

    tx
}

/// The blocking writer loop. Drains the channel with 100ms coalescing.
fn writer_loop(db_path: PathBuf, mut rx: mpsc::UnboundedReceiver<StateChangedEvent>) {
    let conn = match open_db(&db_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Recorder: failed to open DB: {}", e);
            return;
        }
    };

    let mut batch: Vec<PendingWrite> = Vec::with_capacity(128);
    let coalesce = Duration::from_millis(100);

    while let Some(event) = rx.blocking_recv() {
        batch.push(to_pending(&event));

        let deadline = std::time::Instant::now() + coalesce;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            // UnboundedReceiver has no recv timeout; poll with short sleeps
            match rx.try_recv() {
                Ok(event) => batch.push(to_pending(&event)),
                Err(mpsc::error::TryRecvError::Empty) => {
                    std::thread::sleep(Duration::from_millis(10).min(remaining));
                }
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if !batch.is_empty() {
                        flush_batch(&conn, &batch);
                    }
                    return;
                }
            }
        }

        if !batch.is_empty() {
            flush_batch(&conn, &batch);
            batch.clear();
        }
    }
}

fn to_pending(event: &StateChangedEvent) -> PendingWrite {
    match &event.new_state {
        Some(new_state) => PendingWrite::Upsert {
            entity_id: new_state.entity_id.clone(),
            state: new_state.state.clone(),
            attributes_json: serde_json::to_string(&new_state.attributes).unwrap_or_else(|_| "{}".to_string()),
            last_changed: new_state.last_changed.to_rfc3339(),
            last_updated: new_state.last_updated.to_rfc3339(),
        },
        None => PendingWrite::Delete {
            entity_id: event.entity_id.clone(),
        },
    }
}

fn flush_batch(conn: &Connection, batch: &[PendingWrite]) {
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => {
            tracing::error!("Recorder: begin tx failed: {}", e);
            return;
        }
    };

    for w in batch {
        let result = match w {
            PendingWrite::Upsert {
                entity_id,
                state,
                attributes_json,
                last_changed,
                last_updated,
            } => tx.execute(
                "INSERT INTO entity_states (entity_id, state, attributes, last_changed, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(entity_id) DO UPDATE SET
                    state = excluded.state,
                    attributes = excluded.attributes,
                    last_changed = excluded.last_changed,
                    last_updated = excluded.last_updated",
                params![entity_id, state, attributes_json, last_changed, last_updated],
            ),
            PendingWrite::Delete { entity_id } => {
                tx.execute("DELETE FROM entity_states WHERE entity_id = ?1", params![entity_id])
            }
        };
        if let Err(e) = result {
            tracing::error!("Recorder: write error: {}", e);
        }
    }

    if let Err(e) = tx.commit() {
        tracing::error!("Recorder: commit failed: {}", e);
    }
}

/// Forward every state change from the state machine to the writer.
pub fn start_recorder(state_machine: &crate::state::StateMachine, db_path: PathBuf) {
    let writer = spawn_writer(db_path);
    let mut rx = state_machine.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if writer.send(event).is_err() {
                        tracing::error!("Recorder: writer stopped");
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Recorder: lagged behind, {} state changes not recorded", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateMachine;

    #[test]
    fn test_flush_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("porch.db");
        let conn = open_db(&db).unwrap();

        let sm = StateMachine::new(16);
        let mut rx = sm.subscribe();
        let mut attrs = serde_json::Map::new();
        attrs.insert("friendly_name".into(), serde_json::json!("Bell"));
        sm.set("input_button.bell".into(), "2021-01-01T23:59:59+00:00".into(), attrs);
        sm.set("sensor.gone".into(), "1".into(), Default::default());
        sm.remove("sensor.gone");

        let mut batch = Vec::new();
        while let Ok(event) = rx.try_recv() {
            batch.push(to_pending(&event));
        }
        flush_batch(&conn, &batch);

        let states = load_last_states(&db).unwrap();
        assert_eq!(states.len(), 1);
        let bell = &states["input_button.bell"];
        assert_eq!(bell.state, "2021-01-01T23:59:59+00:00");
        assert_eq!(bell.attributes["friendly_name"], serde_json::json!("Bell"));
        assert!(bell.last_changed.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_writer_coalesces_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("porch.db");
        let sm = StateMachine::new(16);
        start_recorder(&sm, db.clone());

        sm.set("input_button.a".into(), "x".into(), Default::default());
        sm.set("input_button.a".into(), "y".into(), Default::default());

        let mut found = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if let Some(s) = load_last_states(&db).unwrap().remove("input_button.a") {
                if s.state == "y" {
                    found = Some(s);
                    break;
                }
            }
        }
        assert_eq!(found.map(|s| s.state).as_deref(), Some("y"));
    }

    #[test]
    fn test_load_from_empty_db() {
        let dir = tempfile::tempdir().unwrap();
        let states = load_last_states(&dir.path().join("empty.db")).unwrap();
        assert!(states.is_empty());
    }
}
