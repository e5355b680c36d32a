//! External collaborator interfaces.
//!
//! The engine drives these but never implements persistence itself: call
//! records, channel rosters, profiles and system messages all live with the
//! managed backend. [`memory`] provides in-process implementations for tests
//! and the loopback demo.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};

use crate::error::CallError;
use crate::types::{CallId, CallSession, CallStatus, ChannelId, Profile, RosterDelta, ThreadId, UserId};

/// Call session records.
#[async_trait]
pub trait CallRecordStore: Send + Sync {
    /// Creates a ringing session record and returns its id.
    async fn create_session(
        &self,
        caller: &UserId,
        callee: &UserId,
        thread: &ThreadId,
    ) -> Result<CallId, CallError>;

    /// Updates a session's status. `at` stamps `started_at` when the status
    /// is `Connected` and `ended_at` when it is terminal.
    async fn update_status(
        &self,
        id: &CallId,
        status: CallStatus,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), CallError>;

    /// Push stream of new sessions ringing for `callee`.
    async fn subscribe_incoming(&self, callee: &UserId) -> mpsc::Receiver<CallSession>;
}

/// Voice-channel participant rows.
#[async_trait]
pub trait ParticipantRoster: Send + Sync {
    async fn join(&self, channel: &ChannelId, user: &UserId) -> Result<(), CallError>;

    async fn leave(&self, channel: &ChannelId, user: &UserId) -> Result<(), CallError>;

    async fn list_participants(&self, channel: &ChannelId) -> Result<Vec<UserId>, CallError>;

    /// Push stream of membership changes for `channel`.
    async fn subscribe_changes(&self, channel: &ChannelId) -> broadcast::Receiver<RosterDelta>;
}

/// Display-name/avatar lookup for caller and callee rendering.
#[async_trait]
pub trait ProfileLookup: Send + Sync {
    async fn get_profile(&self, user: &UserId) -> Result<Profile, CallError>;
}

/// Sink for call-related system messages ("Missed call from …").
///
/// Posting is never load-bearing for call correctness; callers swallow
/// failures.
#[async_trait]
pub trait SystemMessageSink: Send + Sync {
    async fn post_system_message(
        &self,
        thread: &ThreadId,
        author: &UserId,
        text: &str,
    ) -> Result<(), CallError>;
}
