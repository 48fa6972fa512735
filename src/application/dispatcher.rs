//! Stream dispatcher - Walks the graph for one connection and pushes frames
//!
//! Each connection owns a cursor task. The cursor emits events in graph
//! order, suspends at decisions until a choice arrives out-of-band, and
//! materializes missing successors through the generator before moving on.
//! While suspended it emits heartbeats; generation failures turn into error
//! frames and are retried after `retry_after`.

use crate::application::api::{ConnectRequest, StreamFrame};
use crate::application::generation::{GenerationRequest, MaterializationGate, NarrativeGenerator};
use crate::application::graph::EventStore;
use crate::application::versions::BranchVersionManager;
use crate::config::StreamConfig;
use crate::domain::entities::{DecisionOption, Event, EventShape, now_millis};
use crate::domain::errors::DomainError;
use crate::domain::value_objects::{OptionId, SeqId, StoryId, VersionId, ViewerId};
use futures::Stream;
use log::{debug, error, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Decision a cursor is suspended on
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDecision {
    pub seq_id: SeqId,
    pub options: Vec<OptionId>,
}

impl PendingDecision {
    fn of(event: &Event) -> Self {
        Self {
            seq_id: event.seq_id.clone(),
            options: event.options.iter().map(|o| o.option_id.clone()).collect(),
        }
    }
}

struct ChoiceMessage {
    decision: SeqId,
    option_id: OptionId,
    reply: oneshot::Sender<Result<VersionId, DomainError>>,
}

/// Out-of-band choice channel of one connection
#[derive(Clone, Debug)]
pub struct ChoiceHandle {
    pending: watch::Receiver<Option<PendingDecision>>,
    sender: mpsc::Sender<ChoiceMessage>,
}

impl ChoiceHandle {
    /// Decision the cursor is waiting on, if any
    pub fn pending_decision(&self) -> Option<PendingDecision> {
        self.pending.borrow().clone()
    }

    /// Submit a choice for the pending decision.
    /// Resolves once the cursor has forked (or reused) the branch version.
    pub async fn submit(&self, option_id: OptionId) -> Result<VersionId, DomainError> {
        let decision = match self.pending_decision() {
            None => return Err(DomainError::invalid_choice("no decision is awaiting a choice")),
            Some(pending) if !pending.options.contains(&option_id) => {
                return Err(DomainError::invalid_choice(format!(
                    "'{}' is not an option of '{}'",
                    option_id, pending.seq_id
                )));
            }
            Some(pending) => pending.seq_id,
        };

        let (reply, response) = oneshot::channel();
        self.sender
            .try_send(ChoiceMessage {
                decision,
                option_id,
                reply,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => DomainError::invalid_choice("a choice is already being applied"),
                TrySendError::Closed(_) => DomainError::connection_lost("stream closed"),
            })?;
        response
            .await
            .map_err(|_| DomainError::connection_lost("stream closed before the choice was applied"))?
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Server side of one push connection
#[derive(Debug)]
pub struct StreamConnection {
    pub story_id: StoryId,
    pub viewer_id: ViewerId,
    frames: mpsc::Receiver<StreamFrame>,
    choices: ChoiceHandle,
    task: JoinHandle<()>,
}

impl StreamConnection {
    pub async fn next_frame(&mut self) -> Option<StreamFrame> {
        self.frames.recv().await
    }

    pub fn choices(&self) -> ChoiceHandle {
        self.choices.clone()
    }

    /// Frames as a stream; ends when the cursor finishes
    pub fn into_stream(self) -> impl Stream<Item = StreamFrame> + Send + 'static {
        futures::stream::unfold(self.frames, |mut frames| async move {
            frames.recv().await.map(|frame| (frame, frames))
        })
    }

    /// Drop the connection; the cursor stops at its next send or wait
    pub fn close(self) {
        self.task.abort();
    }
}

/// Creates cursors for push connections
pub struct StreamDispatcher {
    events: Arc<EventStore>,
    versions: Arc<BranchVersionManager>,
    generator: Arc<dyn NarrativeGenerator>,
    gate: Arc<MaterializationGate>,
    config: StreamConfig,
}

impl StreamDispatcher {
    pub fn new(
        events: Arc<EventStore>,
        versions: Arc<BranchVersionManager>,
        generator: Arc<dyn NarrativeGenerator>,
        config: StreamConfig,
    ) -> Self {
        Self {
            events,
            versions,
            generator,
            gate: Arc::new(MaterializationGate::new()),
            config,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Open a connection and start its cursor
    pub fn connect(&self, request: ConnectRequest) -> StreamConnection {
        let (frame_tx, frame_rx) = mpsc::channel(self.config.frame_buffer.max(1));
        let (choice_tx, choice_rx) = mpsc::channel(1);
        let (pending_tx, pending_rx) = watch::channel(None);

        let cursor = Cursor {
            events: self.events.clone(),
            versions: self.versions.clone(),
            generator: self.generator.clone(),
            gate: self.gate.clone(),
            config: self.config.clone(),
            story_id: request.story_id.clone(),
            viewer_id: request.viewer_id.clone(),
            active: None,
            frames: frame_tx,
            choices: choice_rx,
            pending: pending_tx,
        };
        debug!(
            "Viewer '{}' connected to story '{}' (from {:?})",
            request.viewer_id, request.story_id, request.from_seq_id
        );
        let task = tokio::spawn(cursor.run(request.from_seq_id, request.version_id));

        StreamConnection {
            story_id: request.story_id,
            viewer_id: request.viewer_id,
            frames: frame_rx,
            choices: ChoiceHandle {
                pending: pending_rx,
                sender: choice_tx,
            },
            task,
        }
    }
}

/// Why a walk stopped early
enum Halt {
    /// The viewer went away
    Closed,
    Fatal(DomainError),
}

impl From<DomainError> for Halt {
    fn from(error: DomainError) -> Self {
        Halt::Fatal(error)
    }
}

struct Cursor {
    events: Arc<EventStore>,
    versions: Arc<BranchVersionManager>,
    generator: Arc<dyn NarrativeGenerator>,
    gate: Arc<MaterializationGate>,
    config: StreamConfig,
    story_id: StoryId,
    viewer_id: ViewerId,
    active: Option<VersionId>,
    frames: mpsc::Sender<StreamFrame>,
    choices: mpsc::Receiver<ChoiceMessage>,
    pending: watch::Sender<Option<PendingDecision>>,
}

impl Cursor {
    async fn run(mut self, from: Option<SeqId>, version: Option<VersionId>) {
        match self.walk(from, version).await {
            Ok(()) => debug!("Stream of '{}' for '{}' reached its end", self.story_id, self.viewer_id),
            Err(Halt::Closed) => debug!("Viewer '{}' left story '{}'", self.viewer_id, self.story_id),
            Err(Halt::Fatal(e)) => {
                error!("Stream of '{}' for '{}' failed: {e}", self.story_id, self.viewer_id);
                let _ = self.frames.send(StreamFrame::from_domain_error(&e, 0)).await;
            }
        }
        self.pending.send_replace(None);
    }

    async fn walk(&mut self, from: Option<SeqId>, version: Option<VersionId>) -> Result<(), Halt> {
        let mut current = match from {
            Some(seq_id) => seq_id,
            None => self.events.get_start(&self.story_id).await?.seq_id,
        };
        self.resolve_active_version(version).await?;

        loop {
            let event = self.events.get(&current).await?;
            if event.story_id != self.story_id {
                return Err(DomainError::invalid_event(
                    &event.seq_id,
                    format!("does not belong to story '{}'", self.story_id),
                )
                .into());
            }
            let recorded = if event.is_decision() {
                self.recorded_choice(&event).await?
            } else {
                None
            };
            match &recorded {
                Some(option) => {
                    // Announced ahead of the decision so the viewer never waits on it.
                    self.emit(StreamFrame::choice_recorded(&event.seq_id, &option.option_id))
                        .await?;
                }
                // Published before the frame so a quick reply is never rejected.
                None if event.is_decision() => {
                    self.pending.send_replace(Some(PendingDecision::of(&event)));
                }
                None => {}
            }
            self.emit(StreamFrame::Story(event.clone())).await?;
            self.track_frontier(&event.seq_id).await;

            current = match (event.shape(), recorded) {
                (EventShape::Terminal, _) => return Ok(()),
                (EventShape::Linear(next), _) => {
                    self.ensure(GenerationRequest::continuation(&event, next)).await?;
                    next.clone()
                }
                (EventShape::Decision(_), Some(option)) => {
                    debug!("'{}' follows '{}' via recorded '{}'", self.viewer_id, event.seq_id, option.option_id);
                    self.ensure(GenerationRequest::branch(&event, &option)).await?;
                    option.next_seq_id
                }
                (EventShape::Decision(_), None) => self.decide(&event).await?,
            };
        }
    }

    async fn resolve_active_version(&mut self, requested: Option<VersionId>) -> Result<(), DomainError> {
        if let Some(id) = requested {
            match self.versions.get(&id).await {
                Ok(version) if version.story_id == self.story_id => {
                    self.active = Some(version.id);
                    return Ok(());
                }
                Ok(_) => warn!("Version '{id}' belongs to another story, falling back to the root"),
                Err(e) if e.is_not_found() => warn!("Unknown version '{id}', falling back to the root"),
                Err(e) => return Err(e),
            }
        }
        self.active = self.versions.root_of(&self.story_id).await?.map(|v| v.id);
        Ok(())
    }

    /// Option the active version already took at `decision`, if any
    async fn recorded_choice(&self, decision: &Event) -> Result<Option<DecisionOption>, DomainError> {
        let Some(version) = &self.active else {
            return Ok(None);
        };
        let path = self.versions.resolve_path(version).await?;
        Ok(path
            .iter()
            .find(|step| step.fork_seq_id == decision.seq_id)
            .and_then(|step| decision.option(&step.option_id))
            .cloned())
    }

    async fn emit(&self, frame: StreamFrame) -> Result<(), Halt> {
        self.frames.send(frame).await.map_err(|_| Halt::Closed)
    }

    async fn track_frontier(&self, seq_id: &SeqId) {
        let Some(version) = &self.active else {
            return;
        };
        if let Err(e) = self.versions.advance_frontier(version, seq_id).await {
            warn!("Could not advance frontier of '{version}' to '{seq_id}': {e}");
        }
    }

    /// Wait for a choice at `decision` and return the event to continue from
    async fn decide(&mut self, decision: &Event) -> Result<SeqId, Halt> {
        self.lookahead(decision).await?;
        let period = self.config.heartbeat_interval();

        loop {
            let message = suspend(&self.frames, period, self.choices.recv())
                .await?
                .ok_or(Halt::Closed)?;
            if message.decision != decision.seq_id {
                let _ = message
                    .reply
                    .send(Err(DomainError::invalid_choice("choice for a stale decision")));
                continue;
            }

            let option = match self.apply_choice(decision, &message.option_id).await {
                Ok((version_id, option)) => {
                    self.pending.send_replace(None);
                    self.active = Some(version_id.clone());
                    let _ = message.reply.send(Ok(version_id));
                    option
                }
                Err(e @ (DomainError::InvalidFork { .. } | DomainError::InvalidChoice { .. })) => {
                    // Reported to the submitter; the viewer may pick again.
                    warn!("Rejected choice '{}' at '{}': {e}", message.option_id, decision.seq_id);
                    let _ = message.reply.send(Err(e));
                    continue;
                }
                Err(e) => {
                    let _ = message.reply.send(Err(e.clone()));
                    return Err(e.into());
                }
            };

            self.ensure(GenerationRequest::branch(decision, &option)).await?;
            return Ok(option.next_seq_id);
        }
    }

    async fn apply_choice(
        &self,
        decision: &Event,
        option_id: &OptionId,
    ) -> Result<(VersionId, DecisionOption), DomainError> {
        let option = decision
            .option(option_id)
            .cloned()
            .ok_or_else(|| DomainError::invalid_choice(format!("unknown option '{option_id}'")))?;
        let parent = match &self.active {
            Some(version) => version.clone(),
            None => self.versions.create_root(&self.story_id, &self.viewer_id).await?.id,
        };
        let version = self
            .versions
            .fork(&parent, &decision.seq_id, option_id, &self.viewer_id)
            .await?;
        Ok((version.id, option))
    }

    /// Push the already-materialized head of every option branch
    async fn lookahead(&self, decision: &Event) -> Result<(), Halt> {
        let limit = self.config.speculative_lookahead;
        if limit == 0 {
            return Ok(());
        }
        for option in &decision.options {
            let mut next = Some(option.next_seq_id.clone());
            let mut sent = 0;
            while let Some(seq_id) = next.take() {
                if sent >= limit {
                    break;
                }
                let Some(stored) = self.events.find(&seq_id).await? else {
                    break;
                };
                next = match stored.event.shape() {
                    EventShape::Linear(after) => Some(after.clone()),
                    _ => None,
                };
                self.emit(StreamFrame::Story(stored.event)).await?;
                sent += 1;
            }
        }
        Ok(())
    }

    /// Make sure `request.target` exists, retrying generation failures
    async fn ensure(&self, request: GenerationRequest) -> Result<(), Halt> {
        if self.events.contains(&request.target).await? {
            return Ok(());
        }
        let period = self.config.heartbeat_interval();
        loop {
            // Run detached so a disconnect never cancels a half-written segment.
            let (events, generator, gate, job) = (
                self.events.clone(),
                self.generator.clone(),
                self.gate.clone(),
                request.clone(),
            );
            let task = tokio::spawn(async move {
                gate.materialize(&events, generator.as_ref(), &job).await
            });
            let outcome = match suspend(&self.frames, period, task).await? {
                Ok(result) => result,
                Err(join_error) => Err(DomainError::generation_failure(
                    &request.story_id,
                    &request.target,
                    format!("generation task failed: {join_error}"),
                )),
            };

            match outcome {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_fatal() => {
                    let retry_after = self.config.retry_after();
                    warn!(
                        "Generation of '{}' failed: {e}; retrying in {}s",
                        request.target,
                        retry_after.as_secs()
                    );
                    self.emit(StreamFrame::from_domain_error(&e, retry_after.as_secs()))
                        .await?;
                    suspend(&self.frames, period, tokio::time::sleep(retry_after)).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Await `work`, emitting heartbeats every `period` and giving up when the
/// viewer disconnects
async fn suspend<F: Future>(
    frames: &mpsc::Sender<StreamFrame>,
    period: Duration,
    work: F,
) -> Result<F::Output, Halt> {
    tokio::pin!(work);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            output = &mut work => return Ok(output),
            _ = ticker.tick() => {
                frames
                    .send(StreamFrame::heartbeat(now_millis()))
                    .await
                    .map_err(|_| Halt::Closed)?;
            }
            _ = frames.closed() => return Err(Halt::Closed),
        }
    }
}
