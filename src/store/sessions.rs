//! Session records: the domain entity jobs read from and write into.
//!
//! Stored like jobs (one file per id under `<data_dir>/sessions`) but
//! independent of them; the job record only carries the session id. Writes
//! to one session are serialized, so concurrent jobs on the same session
//! each see the other's changes.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use super::file::{KeyedLocks, read_record, write_atomic};
use crate::error::StoreError;

/// One round of questions within a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub number: u32,
    pub questions: Vec<String>,
    #[serde(default)]
    pub answers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// A study session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub title: String,
    /// Raw source material the session was built from.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub rounds: Vec<Round>,
    /// Free-form AI notes (project help output).
    #[serde(default)]
    pub notes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(title: impl Into<String>, source: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            source: source.into(),
            summary: None,
            rounds: Vec::new(),
            notes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn current_round(&self) -> Option<&Round> {
        self.rounds.last()
    }

    pub fn current_round_mut(&mut self) -> Option<&mut Round> {
        self.rounds.last_mut()
    }

    /// Append a new round with the given questions.
    pub fn push_round(&mut self, questions: Vec<String>) -> &Round {
        let number = self.rounds.len() as u32 + 1;
        self.rounds.push(Round {
            number,
            questions,
            ..Default::default()
        });
        &self.rounds[self.rounds.len() - 1]
    }
}

/// File-backed session store.
pub struct SessionStore {
    dir: PathBuf,
    locks: KeyedLocks,
}

impl SessionStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            locks: KeyedLocks::default(),
        })
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        read_record(&self.record_path(id)).await
    }

    /// Like `get`, but a missing session is an error.
    pub async fn load(&self, id: Uuid) -> Result<Session, StoreError> {
        self.get(id).await?.ok_or_else(|| StoreError::NotFound {
            entity: "session".to_string(),
            id,
        })
    }

    /// Persist the whole session, refreshing `updated_at`.
    pub async fn save(&self, session: &mut Session) -> Result<(), StoreError> {
        let _guard = self.locks.lock(session.id).await;
        self.write(session).await
    }

    /// Load, change and save one session under its write lock.
    ///
    /// Nothing is written if `change` fails.
    pub async fn modify<E, F>(&self, id: Uuid, change: F) -> Result<Session, E>
    where
        F: FnOnce(&mut Session) -> Result<(), E>,
        E: From<StoreError>,
    {
        let _guard = self.locks.lock(id).await;
        let mut session = self.load(id).await?;
        change(&mut session)?;
        self.write(&mut session).await?;
        Ok(session)
    }

    async fn write(&self, session: &mut Session) -> Result<(), StoreError> {
        session.updated_at = Utc::now();
        let bytes = serde_json::to_vec_pretty(session)?;
        write_atomic(&self.record_path(session.id), &bytes).await
    }
}
