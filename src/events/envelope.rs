//! Wire envelope of SDK response events

use crate::core::Ambiance;
use crate::events::{SdkResponseEvent, SdkResponseEventType};
use crate::execution::EngineError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// `{ambiance, event_type, payload}` with a JSON payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdkResponseEventEnvelope {
    pub ambiance: Ambiance,

    pub event_type: String,

    pub payload: Vec<u8>,
}

impl SdkResponseEventEnvelope {
    pub fn new(ambiance: Ambiance, event: &SdkResponseEvent) -> Result<Self, serde_json::Error> {
        let payload = match event {
            SdkResponseEvent::AddExecutableResponse(inner) => serde_json::to_vec(inner)?,
            SdkResponseEvent::HandleStepResponse(inner) => serde_json::to_vec(inner)?,
            SdkResponseEvent::ResumeNode(inner) => serde_json::to_vec(inner)?,
            SdkResponseEvent::HandleFacilitateResponse(inner) => serde_json::to_vec(inner)?,
            SdkResponseEvent::HandleAdviserResponse(inner) => serde_json::to_vec(inner)?,
            SdkResponseEvent::HandleEventError(inner) => serde_json::to_vec(inner)?,
            SdkResponseEvent::QueueTask(inner) => serde_json::to_vec(inner)?,
            SdkResponseEvent::SpawnChild(inner) => serde_json::to_vec(inner)?,
            SdkResponseEvent::SpawnChildren(inner) => serde_json::to_vec(inner)?,
        };

        Ok(Self {
            ambiance,
            event_type: event.event_type().to_string(),
            payload,
        })
    }

    /// Check the ambiance addresses a node
    pub fn validate(&self) -> Result<(), EngineError> {
        self.ambiance
            .validate_for_node()
            .map_err(EngineError::InvalidAmbiance)
    }

    /// Decode the payload according to the event type
    pub fn decode(&self) -> Result<SdkResponseEvent, EngineError> {
        let event_type = SdkResponseEventType::parse(&self.event_type)
            .ok_or_else(|| EngineError::UnknownEventType(self.event_type.clone()))?;

        let event = match event_type {
            SdkResponseEventType::AddExecutableResponse => {
                SdkResponseEvent::AddExecutableResponse(self.payload(event_type)?)
            }
            SdkResponseEventType::HandleStepResponse => {
                SdkResponseEvent::HandleStepResponse(self.payload(event_type)?)
            }
            SdkResponseEventType::ResumeNode => SdkResponseEvent::ResumeNode(self.payload(event_type)?),
            SdkResponseEventType::HandleFacilitateResponse => {
                SdkResponseEvent::HandleFacilitateResponse(self.payload(event_type)?)
            }
            SdkResponseEventType::HandleAdviserResponse => {
                SdkResponseEvent::HandleAdviserResponse(self.payload(event_type)?)
            }
            SdkResponseEventType::HandleEventError => {
                SdkResponseEvent::HandleEventError(self.payload(event_type)?)
            }
            SdkResponseEventType::QueueTask => SdkResponseEvent::QueueTask(self.payload(event_type)?),
            SdkResponseEventType::SpawnChild => SdkResponseEvent::SpawnChild(self.payload(event_type)?),
            SdkResponseEventType::SpawnChildren => {
                SdkResponseEvent::SpawnChildren(self.payload(event_type)?)
            }
        };

        Ok(event)
    }

    fn payload<T: DeserializeOwned>(&self, event_type: SdkResponseEventType) -> Result<T, EngineError> {
        serde_json::from_slice(&self.payload).map_err(|e| EngineError::MalformedEvent {
            event_type: event_type.to_string(),
            reason: e.to_string(),
        })
    }
}
