// Externalized session state shared by every node
//
// Writes are unconditional, so concurrent writers resolve by last write wins.

use crate::clock::{deadline, Clock, SystemClock};
use crate::config::SessionConfig;
use crate::errors::StorageError;
use crate::storage::{encode, KeyValueStore};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub type Attributes = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub attributes: Attributes,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// Idle interval in milliseconds
    pub max_inactive_ms: u64,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    fn max_inactive(&self) -> Duration {
        Duration::from_millis(self.max_inactive_ms)
    }

    /// Mark the session used at `now`, pushing its expiry out
    fn touch(&mut self, now: DateTime<Utc>) {
        self.last_accessed_at = now;
        self.expires_at = deadline(now, self.max_inactive());
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub struct SessionStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    prefix: String,
    max_inactive: Duration,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &SessionConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            prefix: config.prefix.clone(),
            max_inactive: Duration::from_secs(config.max_inactive_seconds),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn session_key(&self, id: &str) -> String {
        format!("{}:{}", self.prefix, id)
    }

    fn new_session(&self, id: &str, ttl: Duration, now: DateTime<Utc>) -> Session {
        Session {
            id: id.to_string(),
            attributes: Attributes::new(),
            created_at: now,
            last_accessed_at: now,
            max_inactive_ms: duration_ms(ttl),
            expires_at: deadline(now, ttl),
        }
    }

    async fn write(&self, session: &Session) -> Result<(), StorageError> {
        self.store
            .set(
                &self.session_key(&session.id),
                &encode(session)?,
                Some(session.max_inactive()),
            )
            .await?;
        Ok(())
    }

    /// Start an empty session with a fresh id
    pub async fn create(&self) -> Result<Session, StorageError> {
        let session = self.new_session(&Uuid::new_v4().to_string(), self.max_inactive, self.clock.now());
        self.write(&session).await?;
        debug!(session_id = %session.id, "Session created");
        Ok(session)
    }

    /// Live session without touching its expiry
    pub async fn get(&self, id: &str) -> Result<Option<Session>, StorageError> {
        let Some(record) = self.store.get(&self.session_key(id)).await? else {
            return Ok(None);
        };
        let session: Session = record.decode()?;
        if session.expires_at <= self.clock.now() {
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// Attributes of the session, empty when absent or expired
    ///
    /// A live session's last access time and expiry are refreshed.
    pub async fn load(&self, id: &str) -> Result<Attributes, StorageError> {
        let Some(mut session) = self.get(id).await? else {
            return Ok(Attributes::new());
        };
        session.touch(self.clock.now());
        self.write(&session).await?;
        Ok(session.attributes)
    }

    /// Replace the session's attributes, creating it if needed
    pub async fn save(
        &self,
        id: &str,
        attributes: Attributes,
        ttl: Option<Duration>,
    ) -> Result<Session, StorageError> {
        let now = self.clock.now();
        let ttl = ttl.unwrap_or(self.max_inactive);

        let mut session = match self.get(id).await? {
            Some(existing) => existing,
            None => self.new_session(id, ttl, now),
        };
        session.attributes = attributes;
        session.max_inactive_ms = duration_ms(ttl);
        session.touch(now);

        self.write(&session).await?;
        Ok(session)
    }

    pub async fn set_attribute<T: Serialize>(
        &self,
        id: &str,
        name: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let now = self.clock.now();
        let mut session = match self.get(id).await? {
            Some(existing) => existing,
            None => self.new_session(id, self.max_inactive, now),
        };
        session
            .attributes
            .insert(name.to_string(), serde_json::to_value(value)?);
        session.touch(now);
        self.write(&session).await
    }

    pub async fn get_attribute<T: DeserializeOwned>(
        &self,
        id: &str,
        name: &str,
    ) -> Result<Option<T>, StorageError> {
        let mut attributes = self.load(id).await?;
        match attributes.remove(name) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Destroy the session, returns whether it existed
    pub async fn invalidate(&self, id: &str) -> Result<bool, StorageError> {
        self.store.delete(&self.session_key(id)).await
    }
}
