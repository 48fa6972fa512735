//! Playback buffer - Local event queue with duplicate filtering and backpressure

use crate::config::PlaybackConfig;
use crate::domain::entities::Event;
use crate::domain::value_objects::SeqId;
use log::debug;
use std::collections::{HashSet, VecDeque};

/// Whether playback has to stop at `event` until something completes it
pub fn is_blocking(event: &Event) -> bool {
    event.event_type.is_narrative_blocking() || event.waits_for_media()
}

/// What the session should do with the push connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionCommand {
    Close,
    /// Reconnect, resuming at the last event received
    Reopen { from: Option<SeqId> },
}

#[derive(Debug)]
pub struct PlaybackBuffer {
    queue: VecDeque<Event>,
    /// Every event that was enqueued or played
    seen: HashSet<SeqId>,
    blocking: usize,
    high_watermark: usize,
    low_watermark: usize,
    connected: bool,
    /// The story's final event has been received; the stream has nothing left
    complete: bool,
    last_received: Option<SeqId>,
}

impl PlaybackBuffer {
    pub fn new(config: &PlaybackConfig) -> Self {
        Self {
            queue: VecDeque::new(),
            seen: HashSet::new(),
            blocking: 0,
            high_watermark: config.high_watermark,
            low_watermark: config.low_watermark,
            connected: true,
            complete: false,
            last_received: None,
        }
    }

    /// Enqueue `event`; returns false for an event already enqueued or played
    pub fn push(&mut self, event: Event) -> bool {
        if !self.seen.insert(event.seq_id.clone()) {
            debug!("Discarding duplicate event '{}'", event.seq_id);
            return false;
        }
        if is_blocking(&event) {
            self.blocking += 1;
        }
        if event.is_terminal() {
            self.complete = true;
        }
        self.last_received = Some(event.seq_id.clone());
        self.queue.push_back(event);
        true
    }

    pub fn pop(&mut self) -> Option<Event> {
        let event = self.queue.pop_front()?;
        if is_blocking(&event) {
            self.blocking -= 1;
        }
        Some(event)
    }

    pub fn contains(&self, seq_id: &SeqId) -> bool {
        self.seen.contains(seq_id)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Buffered blocking events not yet played
    pub fn blocking_count(&self) -> usize {
        self.blocking
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn last_received(&self) -> Option<&SeqId> {
        self.last_received.as_ref()
    }

    /// Whether the final event of the story is already buffered or played
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Record that the transport dropped on its own
    pub fn mark_disconnected(&mut self) {
        self.connected = false;
    }

    /// Apply the watermarks; at most one command per threshold crossing
    pub fn watermark(&mut self) -> Option<ConnectionCommand> {
        if self.connected && self.blocking > self.high_watermark {
            self.connected = false;
            debug!("Buffer above high watermark ({}), pausing stream", self.blocking);
            return Some(ConnectionCommand::Close);
        }
        if !self.connected && !self.complete && self.blocking < self.low_watermark {
            self.connected = true;
            debug!(
                "Buffer below low watermark ({}), resuming from {:?}",
                self.blocking, self.last_received
            );
            return Some(ConnectionCommand::Reopen {
                from: self.last_received.clone(),
            });
        }
        None
    }
}
