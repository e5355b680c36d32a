//! Shared wiring handed to call controllers and voice-channel meshes.

use std::sync::Arc;

use crate::config::CallConfig;
use crate::media::MediaDevices;
use crate::signaling::SignalingBus;
use crate::store::{CallRecordStore, ParticipantRoster, ProfileLookup, SystemMessageSink};

/// Configuration plus every external collaborator the engine consumes.
///
/// Cheap to clone; controllers and meshes take one by value.
#[derive(Clone)]
pub struct EngineContext {
    pub config: CallConfig,
    pub bus: Arc<SignalingBus>,
    pub store: Arc<dyn CallRecordStore>,
    pub roster: Arc<dyn ParticipantRoster>,
    pub profiles: Arc<dyn ProfileLookup>,
    pub messages: Arc<dyn SystemMessageSink>,
    pub devices: Arc<dyn MediaDevices>,
}
