//! Session service.
//!
//! A session is the durable record of one agent conversation. Each session
//! owns exactly one durable stream with the same id: creating the session
//! creates the stream, and stream publishes route through here so callers
//! never juggle two ids.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::info;

use corral_db::models::Session;
use corral_db::queries::sessions as db;

use crate::streams::{StreamError, StreamOptions, StreamService, Subscription};

/// Inputs for creating a session.
#[derive(Debug, Clone, Default)]
pub struct CreateSession<'a> {
    pub project_id: &'a str,
    pub task_id: Option<&'a str>,
    pub agent_id: Option<&'a str>,
    pub title: &'a str,
}

/// Service over session rows and their streams.
#[derive(Clone)]
pub struct SessionService {
    pool: SqlitePool,
    streams: StreamService,
}

impl SessionService {
    pub fn new(pool: SqlitePool, streams: StreamService) -> Self {
        Self { pool, streams }
    }

    /// The underlying stream service.
    pub fn streams(&self) -> &StreamService {
        &self.streams
    }

    /// Create an active session row and its durable stream.
    pub async fn create(&self, input: CreateSession<'_>) -> Result<Session> {
        let session = db::insert_session(
            &self.pool,
            input.project_id,
            input.task_id,
            input.agent_id,
            input.title,
        )
        .await?;

        // Stream id == session id. Idempotent, so a crash between the two
        // inserts self-heals on the next create.
        self.streams
            .create_stream(&session.id, StreamOptions::default())
            .map_err(|e| anyhow::anyhow!("failed to create stream for session: {e}"))?;

        info!(session_id = %session.id, task_id = ?input.task_id, "session created");
        Ok(session)
    }

    /// Publish an event onto a session's stream. Returns the offset.
    pub fn publish(
        &self,
        session_id: &str,
        kind: &str,
        data: serde_json::Value,
    ) -> Result<u64, StreamError> {
        self.streams.publish(session_id, kind, data)
    }

    /// Subscribe to a session's stream from an offset.
    pub fn subscribe(&self, session_id: &str, from_offset: u64) -> Result<Subscription, StreamError> {
        self.streams.subscribe(session_id, from_offset)
    }

    /// Close a session. The stream stays readable for replay until the
    /// session is garbage-collected.
    pub async fn close(&self, session_id: &str) -> Result<Option<Session>> {
        let session = db::close_session(&self.pool, session_id).await?;
        if session.is_some() {
            info!(session_id, "session closed");
        }
        Ok(session)
    }

    /// Fetch a session row.
    pub async fn get_by_id(&self, session_id: &str) -> Result<Option<Session>> {
        db::get_session(&self.pool, session_id).await
    }

    /// Drop a closed session's stream, releasing its stored events.
    pub fn collect_stream(&self, session_id: &str) -> bool {
        self.streams.delete_stream(session_id)
    }
}
