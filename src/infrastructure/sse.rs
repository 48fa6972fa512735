//! Server-sent-events codec for stream frames
//!
//! Story frames travel as `event: story_event` with the event's `seq_id` as the
//! frame id; heartbeats and errors travel as `event: system_event`. The decoder
//! accepts arbitrary chunking of the text stream.

use crate::application::api::{StreamFrame, SystemEvent};
use crate::domain::entities::Event;

pub const STORY_EVENT: &str = "story_event";
pub const SYSTEM_EVENT: &str = "system_event";

#[derive(Debug, thiserror::Error)]
pub enum SseError {
    #[error("Unknown frame type '{0}'")]
    UnknownEvent(String),

    #[error("Frame '{event}' has no data")]
    MissingData { event: String },

    #[error("Malformed '{event}' payload: {source}")]
    Payload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Render one frame, including the terminating blank line
pub fn encode_frame(frame: &StreamFrame) -> Result<String, SseError> {
    match frame {
        StreamFrame::Story(event) => {
            let data = serde_json::to_string(event).map_err(|source| SseError::Payload {
                event: STORY_EVENT.to_string(),
                source,
            })?;
            Ok(format!("event: {STORY_EVENT}\nid: {}\ndata: {data}\n\n", event.seq_id))
        }
        StreamFrame::System(system) => {
            let data = serde_json::to_string(system).map_err(|source| SseError::Payload {
                event: SYSTEM_EVENT.to_string(),
                source,
            })?;
            Ok(format!("event: {SYSTEM_EVENT}\ndata: {data}\n\n"))
        }
    }
}

#[derive(Debug, Default)]
struct PendingFrame {
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
}

/// Incremental decoder over a chunked text stream
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    pending: PendingFrame,
    last_event_id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw text received from the transport
    pub fn feed(&mut self, chunk: &str) {
        self.buffer.push_str(chunk);
    }

    /// Id of the most recent frame that carried one
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Next complete frame, or `None` until more text arrives
    pub fn next_frame(&mut self) -> Option<Result<StreamFrame, SseError>> {
        while let Some(end) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=end).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                let frame = std::mem::take(&mut self.pending);
                if frame.event.is_none() && frame.data.is_empty() {
                    continue;
                }
                if let Some(id) = &frame.id {
                    self.last_event_id = Some(id.clone());
                }
                return Some(Self::build(frame));
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.pending.event = Some(value.to_string()),
                "id" => self.pending.id = Some(value.to_string()),
                "data" => self.pending.data.push(value.to_string()),
                _ => {}
            }
        }
        None
    }

    /// Feed a chunk and collect every frame it completes
    pub fn decode(&mut self, chunk: &str) -> Vec<Result<StreamFrame, SseError>> {
        self.feed(chunk);
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    fn build(frame: PendingFrame) -> Result<StreamFrame, SseError> {
        let event = frame.event.unwrap_or_else(|| "message".to_string());
        if frame.data.is_empty() {
            return Err(SseError::MissingData { event });
        }
        let data = frame.data.join("\n");
        match event.as_str() {
            STORY_EVENT => serde_json::from_str::<Event>(&data)
                .map(StreamFrame::Story)
                .map_err(|source| SseError::Payload { event, source }),
            SYSTEM_EVENT => serde_json::from_str::<SystemEvent>(&data)
                .map(StreamFrame::System)
                .map_err(|source| SseError::Payload { event, source }),
            _ => Err(SseError::UnknownEvent(event)),
        }
    }
}
