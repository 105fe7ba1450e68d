//! JSON wire format for queue messages.

use crate::event::Event;
use crate::queue::QueueError;

pub const CONTENT_TYPE: &str = "application/json";

pub fn encode(event: &Event) -> Result<Vec<u8>, QueueError> {
    serde_json::to_vec(event).map_err(QueueError::Encode)
}

pub fn decode(payload: &[u8]) -> Result<Event, QueueError> {
    serde_json::from_slice(payload).map_err(QueueError::Decode)
}
