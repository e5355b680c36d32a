//! In-memory collaborator implementations for tests and demos.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};

use crate::error::CallError;
use crate::types::{
    CallId, CallSession, CallStatus, ChannelId, Profile, RosterDelta, ThreadId, UserId,
};

use super::{CallRecordStore, ParticipantRoster, ProfileLookup, SystemMessageSink};

/// Call records held in a map, with push notification of new sessions.
#[derive(Default)]
pub struct MemoryCallStore {
    sessions: RwLock<HashMap<CallId, CallSession>>,
    listeners: Mutex<Vec<(UserId, mpsc::Sender<CallSession>)>>,
}

impl MemoryCallStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of one session record.
    pub async fn session(&self, id: &CallId) -> Option<CallSession> {
        self.sessions.read().await.get(id).cloned()
    }
}

#[async_trait]
impl CallRecordStore for MemoryCallStore {
    async fn create_session(
        &self,
        caller: &UserId,
        callee: &UserId,
        thread: &ThreadId,
    ) -> Result<CallId, CallError> {
        let id = CallId::generate();
        let session = CallSession {
            id: id.clone(),
            caller_id: caller.clone(),
            callee_id: callee.clone(),
            thread_id: thread.clone(),
            status: CallStatus::Ringing,
            started_at: None,
            ended_at: None,
        };
        self.sessions
            .write()
            .await
            .insert(id.clone(), session.clone());

        let mut listeners = self.listeners.lock().await;
        listeners.retain(|(user, tx)| {
            if user != callee {
                return true;
            }
            tx.try_send(session.clone()).is_ok()
        });
        Ok(id)
    }

    async fn update_status(
        &self,
        id: &CallId,
        status: CallStatus,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), CallError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| CallError::NotFound(id.to_string()))?;
        session.status = status;
        match status {
            CallStatus::Connected => session.started_at = at.or_else(|| Some(Utc::now())),
            s if s.is_terminal() => session.ended_at = at.or_else(|| Some(Utc::now())),
            _ => {}
        }
        Ok(())
    }

    async fn subscribe_incoming(&self, callee: &UserId) -> mpsc::Receiver<CallSession> {
        let (tx, rx) = mpsc::channel(8);
        self.listeners.lock().await.push((callee.clone(), tx));
        rx
    }
}

/// Channel rosters held in a map, with broadcast deltas.
pub struct MemoryRoster {
    channels: DashMap<ChannelId, HashSet<UserId>>,
    changes: broadcast::Sender<RosterDelta>,
}

impl Default for MemoryRoster {
    fn default() -> Self {
        Self {
            channels: DashMap::new(),
            changes: broadcast::channel(64).0,
        }
    }
}

impl MemoryRoster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ParticipantRoster for MemoryRoster {
    async fn join(&self, channel: &ChannelId, user: &UserId) -> Result<(), CallError> {
        self.channels
            .entry(channel.clone())
            .or_default()
            .insert(user.clone());
        let _ = self.changes.send(RosterDelta {
            channel_id: channel.clone(),
            user_id: user.clone(),
            joined: true,
        });
        Ok(())
    }

    async fn leave(&self, channel: &ChannelId, user: &UserId) -> Result<(), CallError> {
        if let Some(mut members) = self.channels.get_mut(channel) {
            members.remove(user);
        }
        let _ = self.changes.send(RosterDelta {
            channel_id: channel.clone(),
            user_id: user.clone(),
            joined: false,
        });
        Ok(())
    }

    async fn list_participants(&self, channel: &ChannelId) -> Result<Vec<UserId>, CallError> {
        Ok(self
            .channels
            .get(channel)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn subscribe_changes(&self, _channel: &ChannelId) -> broadcast::Receiver<RosterDelta> {
        self.changes.subscribe()
    }
}

/// Profile table with a fallback to the raw user id.
#[derive(Default)]
pub struct MemoryProfiles {
    profiles: DashMap<UserId, Profile>,
}

impl MemoryProfiles {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, user: UserId, display_name: impl Into<String>) {
        self.profiles.insert(
            user,
            Profile {
                display_name: display_name.into(),
                avatar_url: None,
            },
        );
    }
}

#[async_trait]
impl ProfileLookup for MemoryProfiles {
    async fn get_profile(&self, user: &UserId) -> Result<Profile, CallError> {
        Ok(self
            .profiles
            .get(user)
            .map(|p| p.value().clone())
            .unwrap_or_else(|| Profile {
                display_name: user.to_string(),
                avatar_url: None,
            }))
    }
}

/// One posted system message.
#[derive(Debug, Clone)]
pub struct SystemMessage {
    pub thread_id: ThreadId,
    pub author_id: UserId,
    pub text: String,
}

/// Records posted system messages for inspection.
#[derive(Default)]
pub struct MemoryMessages {
    messages: Mutex<Vec<SystemMessage>>,
}

impl MemoryMessages {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn messages(&self) -> Vec<SystemMessage> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl SystemMessageSink for MemoryMessages {
    async fn post_system_message(
        &self,
        thread: &ThreadId,
        author: &UserId,
        text: &str,
    ) -> Result<(), CallError> {
        self.messages.lock().await.push(SystemMessage {
            thread_id: thread.clone(),
            author_id: author.clone(),
            text: text.to_string(),
        });
        Ok(())
    }
}
