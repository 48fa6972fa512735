//! Playback scheduler - Branch-filtered, cooperatively suspending playback
//!
//! The scheduler performs no I/O. The session feeds it received events and
//! completion signals, and it hands back the next event to present together
//! with the wait that event requires. At most one wait is outstanding.

use crate::client::buffer::{ConnectionCommand, PlaybackBuffer, is_blocking};
use crate::config::PlaybackConfig;
use crate::domain::entities::{DecisionOption, Event};
use crate::domain::errors::DomainError;
use crate::domain::value_objects::{BranchTag, EventType, OptionId, SeqId};
use log::{debug, trace};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackState {
    Idle,
    AwaitAdvance { seq_id: SeqId },
    AwaitChoice { seq_id: SeqId, options: Vec<OptionId> },
    /// Waiting for a video to finish
    Suspended { seq_id: SeqId },
    Ended,
}

/// What happened to a received event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intake {
    Enqueued,
    Duplicate,
    /// Belongs to a branch the viewer is not on
    OtherBranch,
}

/// The signal a presented event waits for
#[derive(Debug, Clone, PartialEq)]
pub enum Wait {
    None,
    Advance { auto_after: Option<Duration> },
    Choice {
        options: Vec<DecisionOption>,
        timeout: Option<Duration>,
    },
    Media,
}

/// Signal that ends the outstanding wait
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Advance,
    MediaFinished,
    Choice(OptionId),
    ChoiceTimeout,
}

/// An event to present and the wait that follows it
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub event: Event,
    pub wait: Wait,
}

pub struct PlaybackScheduler {
    buffer: PlaybackBuffer,
    active_tag: Option<BranchTag>,
    state: PlaybackState,
    current: Option<Event>,
    config: PlaybackConfig,
    played: usize,
    /// Decisions the server already resolved on the viewer's version
    recorded: HashMap<SeqId, OptionId>,
}

impl PlaybackScheduler {
    /// With no active tag, the first received event decides it
    pub fn new(config: PlaybackConfig, active_tag: Option<BranchTag>) -> Self {
        Self {
            buffer: PlaybackBuffer::new(&config),
            active_tag,
            state: PlaybackState::Idle,
            current: None,
            config,
            played: 0,
            recorded: HashMap::new(),
        }
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn active_tag(&self) -> Option<&BranchTag> {
        self.active_tag.as_ref()
    }

    pub fn buffer(&self) -> &PlaybackBuffer {
        &self.buffer
    }

    pub fn is_ended(&self) -> bool {
        self.state == PlaybackState::Ended
    }

    /// Events presented so far
    pub fn played(&self) -> usize {
        self.played
    }

    /// Offer a pushed event to the local queue
    pub fn receive(&mut self, event: Event) -> Intake {
        let tag = self.active_tag.get_or_insert_with(|| event.branch_tag.clone());
        if event.branch_tag != *tag {
            trace!("Filtered '{}' of branch '{}'", event.seq_id, event.branch_tag);
            return Intake::OtherBranch;
        }
        let recorded = self
            .recorded
            .get(&event.seq_id)
            .and_then(|option_id| event.option(option_id))
            .map(|option| option.branch_tag.clone());
        if !self.buffer.push(event) {
            return Intake::Duplicate;
        }
        // The stream continues on the recorded branch right behind the decision.
        if let Some(tag) = recorded {
            self.active_tag = Some(tag);
        }
        Intake::Enqueued
    }

    /// Note that `seq_id` will be followed by `option_id` without asking
    pub fn record_choice(&mut self, seq_id: SeqId, option_id: OptionId) {
        debug!("'{seq_id}' continues via recorded '{option_id}'");
        self.recorded.insert(seq_id, option_id);
    }

    pub fn mark_disconnected(&mut self) {
        self.buffer.mark_disconnected();
    }

    pub fn watermark(&mut self) -> Option<ConnectionCommand> {
        self.buffer.watermark()
    }

    /// Take the next event to present; `None` while waiting, ended or starved
    pub fn next(&mut self) -> Option<Step> {
        if self.state != PlaybackState::Idle {
            return None;
        }
        let event = self.buffer.pop()?;
        self.played += 1;
        let wait = self.wait_for(&event);
        self.state = match &wait {
            Wait::None if event.is_terminal() => PlaybackState::Ended,
            Wait::None => PlaybackState::Idle,
            Wait::Advance { .. } => PlaybackState::AwaitAdvance {
                seq_id: event.seq_id.clone(),
            },
            Wait::Choice { options, .. } => PlaybackState::AwaitChoice {
                seq_id: event.seq_id.clone(),
                options: options.iter().map(|o| o.option_id.clone()).collect(),
            },
            Wait::Media => PlaybackState::Suspended {
                seq_id: event.seq_id.clone(),
            },
        };
        debug!("Presenting '{}' ({}), now {:?}", event.seq_id, event.event_type, self.state);
        self.current = Some(event.clone());
        Some(Step { event, wait })
    }

    fn wait_for(&mut self, event: &Event) -> Wait {
        if event.is_decision() && self.recorded.remove(&event.seq_id).is_some() {
            return Wait::None;
        }
        if event.is_decision() {
            return Wait::Choice {
                options: event.options.clone(),
                timeout: self.config.choice_timeout(),
            };
        }
        if event.waits_for_media() {
            return Wait::Media;
        }
        if !is_blocking(event) {
            return Wait::None;
        }
        let auto_after = self.config.auto_advance.then(|| {
            let voice = event
                .voice_duration_secs()
                .filter(|secs| secs.is_finite() && *secs > 0.0)
                .map(Duration::from_secs_f64)
                .unwrap_or_default();
            voice + self.config.auto_advance_delay()
        });
        Wait::Advance { auto_after }
    }

    /// Resolve the outstanding wait. Returns the option taken when it was a
    /// decision; the active branch switches to that option's tag.
    pub fn complete(&mut self, completion: Completion) -> Result<Option<DecisionOption>, DomainError> {
        let chosen = match (&self.state, completion) {
            (PlaybackState::AwaitAdvance { .. }, Completion::Advance)
            | (PlaybackState::Suspended { .. }, Completion::MediaFinished | Completion::Advance) => None,
            (PlaybackState::AwaitChoice { seq_id, .. }, Completion::Choice(option_id)) => {
                let option = self
                    .current
                    .as_ref()
                    .and_then(|event| event.option(&option_id))
                    .cloned()
                    .ok_or_else(|| {
                        DomainError::invalid_choice(format!("'{option_id}' is not an option of '{seq_id}'"))
                    })?;
                Some(option)
            }
            (PlaybackState::AwaitChoice { seq_id, .. }, Completion::ChoiceTimeout) => {
                let option = self
                    .current
                    .as_ref()
                    .and_then(|event| event.options.first())
                    .cloned()
                    .ok_or_else(|| DomainError::invalid_choice(format!("'{seq_id}' has no options")))?;
                debug!("Choice at '{seq_id}' timed out, taking '{}'", option.option_id);
                Some(option)
            }
            (state, completion) => {
                return Err(DomainError::invalid_choice(format!(
                    "{completion:?} does not resolve {state:?}"
                )));
            }
        };

        if let Some(option) = &chosen {
            self.active_tag = Some(option.branch_tag.clone());
        }
        let finished = self.current.as_ref().is_some_and(|e| e.is_terminal());
        self.state = if finished && chosen.is_none() {
            PlaybackState::Ended
        } else {
            PlaybackState::Idle
        };
        Ok(chosen)
    }

    /// Whether the event being waited on is of `event_type`
    pub fn is_waiting_on(&self, event_type: EventType) -> bool {
        self.state != PlaybackState::Idle
            && self.current.as_ref().is_some_and(|e| e.event_type == event_type)
    }
}
