//! Playback session - Drives one viewer's playback on tokio
//!
//! The session owns the push connection and reacts to the buffer's
//! watermarks by closing and re-opening it. Received events go through the
//! scheduler; presented events go to the renderer and the progress
//! synchronizer; choices go back to the server out-of-band.

use crate::application::api::{
    ApiError, ChoiceAck, ChoiceSubmission, ConnectRequest, StreamFrame, SystemEvent,
};
use crate::application::service::StoryService;
use crate::client::buffer::ConnectionCommand;
use crate::client::prefetch::{AssetStatus, ResourcePrefetcher};
use crate::client::scheduler::{Completion, Intake, PlaybackScheduler, Step, Wait};
use crate::application::progress::ProgressSynchronizer;
use crate::domain::entities::{DecisionOption, Event};
use crate::domain::value_objects::{OptionId, ResourceRef, SeqId, StoryId, VersionId, ViewerId};
use crate::infrastructure::sse::{SseDecoder, encode_frame};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const CONNECT_ATTEMPTS: u32 = 5;
const CHOICE_ATTEMPTS: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_millis(500);

pub type FrameStream = BoxStream<'static, Result<StreamFrame, ApiError>>;

/// Server endpoints a session talks to
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn connect(
        &self,
        from_seq_id: Option<SeqId>,
        version_id: Option<VersionId>,
    ) -> Result<FrameStream, ApiError>;

    async fn submit_choice(&self, option_id: OptionId) -> Result<ChoiceAck, ApiError>;
}

/// In-process source that still sends every frame through the SSE codec
pub struct LocalEventSource {
    service: Arc<StoryService>,
    story_id: StoryId,
    viewer_id: ViewerId,
}

impl LocalEventSource {
    pub fn new(service: Arc<StoryService>, story_id: StoryId, viewer_id: ViewerId) -> Self {
        Self {
            service,
            story_id,
            viewer_id,
        }
    }
}

#[async_trait]
impl EventSource for LocalEventSource {
    async fn connect(
        &self,
        from_seq_id: Option<SeqId>,
        version_id: Option<VersionId>,
    ) -> Result<FrameStream, ApiError> {
        let mut request = ConnectRequest::new(self.story_id.clone(), self.viewer_id.clone());
        if let Some(from) = from_seq_id {
            request = request.resume_from(from, version_id);
        } else {
            request.version_id = version_id;
        }
        let connection = self.service.connect(request).await?;

        let mut decoder = SseDecoder::new();
        let frames = connection
            .into_stream()
            .map(move |frame| match encode_frame(&frame) {
                Ok(text) => decoder.decode(&text),
                Err(e) => vec![Err(e)],
            })
            .flat_map(futures::stream::iter)
            .map(|decoded| decoded.map_err(|e| ApiError::connection(e.to_string())));
        Ok(frames.boxed())
    }

    async fn submit_choice(&self, option_id: OptionId) -> Result<ChoiceAck, ApiError> {
        self.service
            .submit_choice(ChoiceSubmission {
                story_id: self.story_id.clone(),
                viewer_id: self.viewer_id.clone(),
                option_id,
            })
            .await
    }
}

/// Presentation side of a session
#[async_trait]
pub trait Renderer: Send {
    async fn present(&mut self, event: &Event, assets: &[(ResourceRef, AssetStatus)]);

    /// Viewer input ending `wait`; `None` when the viewer will not answer and
    /// the wait's own timer decides. Must be cancel safe.
    async fn input(&mut self, wait: &Wait) -> Option<Completion>;

    /// A decision was resolved, by the viewer or by timeout
    async fn chosen(&mut self, _option: &DecisionOption) {}

    /// A recoverable server-side problem was reported
    async fn notice(&mut self, _message: &str) {}
}

/// Outcome of a finished session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub played: usize,
    pub choices: Vec<OptionId>,
    pub version_id: Option<VersionId>,
    pub reconnects: usize,
    pub last_seq_id: Option<SeqId>,
}

/// Connection-facing half of the session
struct Link {
    source: Arc<dyn EventSource>,
    stream: Option<FrameStream>,
    scheduler: PlaybackScheduler,
    prefetcher: Arc<ResourcePrefetcher>,
    version_id: Option<VersionId>,
    reconnects: usize,
    notices: Vec<String>,
}

impl Link {
    async fn open(&mut self, from: Option<SeqId>) -> Result<(), ApiError> {
        self.stream = None;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.source.connect(from.clone(), self.version_id.clone()).await {
                Ok(stream) => {
                    debug!("Stream opened (from {from:?}, attempt {attempt})");
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(ApiError::NotReady { retry_after_secs, .. }) if attempt < CONNECT_ATTEMPTS => {
                    tokio::time::sleep(Duration::from_secs(retry_after_secs)).await;
                }
                Err(ApiError::Connection(reason)) if attempt < CONNECT_ATTEMPTS => {
                    warn!("Connecting failed ({reason}), retrying");
                    tokio::time::sleep(RETRY_DELAY * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn reopen(&mut self, from: Option<SeqId>) -> Result<(), ApiError> {
        self.reconnects += 1;
        self.open(from).await
    }

    /// Apply pending backpressure commands
    async fn regulate(&mut self) -> Result<(), ApiError> {
        while let Some(command) = self.scheduler.watermark() {
            match command {
                ConnectionCommand::Close => {
                    debug!("Pausing the stream");
                    self.stream = None;
                }
                ConnectionCommand::Reopen { from } => self.reopen(from).await?,
            }
        }
        Ok(())
    }

    /// Next frame, or `None` once the transport is gone
    async fn next_frame(&mut self) -> Option<Result<StreamFrame, ApiError>> {
        let stream = self.stream.as_mut()?;
        let frame = stream.next().await;
        if frame.is_none() {
            debug!("Stream ended");
            self.stream = None;
            self.scheduler.mark_disconnected();
        }
        frame
    }

    fn handle(&mut self, frame: Result<StreamFrame, ApiError>) -> Result<(), ApiError> {
        match frame {
            Ok(StreamFrame::Story(event)) => {
                let preview = event.clone();
                if self.scheduler.receive(event) != Intake::Duplicate {
                    self.prefetcher.prefetch_event(&preview);
                }
                Ok(())
            }
            Ok(StreamFrame::System(SystemEvent::Heartbeat { server_time })) => {
                debug!("Heartbeat at {server_time}");
                Ok(())
            }
            Ok(StreamFrame::System(SystemEvent::ChoiceRecorded { seq_id, option_id })) => {
                self.scheduler.record_choice(seq_id, option_id);
                Ok(())
            }
            Ok(StreamFrame::System(SystemEvent::Error {
                error_code,
                message,
                retry_after,
            })) => {
                if retry_after == 0 {
                    self.stream = None;
                    return Err(match error_code.as_str() {
                        "NOT_FOUND" => ApiError::not_found(message),
                        "INVALID_FORK" | "INVALID_EVENT" | "DUPLICATE_SEQ_ID" | "INVALID_CHOICE" => {
                            ApiError::invalid(message)
                        }
                        _ => ApiError::internal(message),
                    });
                }
                warn!("Server reported {error_code}: {message} (retrying in {retry_after}s)");
                self.notices.push(message);
                Ok(())
            }
            Err(e) => {
                warn!("Dropping undecodable frame: {e}");
                Ok(())
            }
        }
    }

    /// Make sure a starving, disconnected session gets a connection
    async fn refill(&mut self) -> Result<(), ApiError> {
        if self.stream.is_none() && !self.scheduler.buffer().is_complete() {
            let from = self.scheduler.buffer().last_received().cloned();
            self.reopen(from).await?;
        }
        match self.next_frame().await {
            Some(frame) => self.handle(frame),
            None => Ok(()),
        }
    }
}

pub struct PlaybackSession<R: Renderer> {
    link: Link,
    renderer: R,
    progress: ProgressSynchronizer,
    resume_from: Option<SeqId>,
    choices: Vec<OptionId>,
    last_seq_id: Option<SeqId>,
}

impl<R: Renderer> PlaybackSession<R> {
    pub fn new(
        source: Arc<dyn EventSource>,
        scheduler: PlaybackScheduler,
        prefetcher: Arc<ResourcePrefetcher>,
        progress: ProgressSynchronizer,
        renderer: R,
    ) -> Self {
        let version_id = progress.version_id().cloned();
        Self {
            link: Link {
                source,
                stream: None,
                scheduler,
                prefetcher,
                version_id,
                reconnects: 0,
                notices: Vec::new(),
            },
            renderer,
            progress,
            resume_from: None,
            choices: Vec::new(),
            last_seq_id: None,
        }
    }

    /// Start at a saved position instead of the story start
    pub fn resume_from(mut self, seq_id: SeqId) -> Self {
        self.resume_from = Some(seq_id);
        self
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    /// Play until the story ends
    pub async fn run(mut self) -> Result<(SessionSummary, R), ApiError> {
        let from = self.resume_from.clone();
        self.link.open(from).await?;

        let outcome = self.play_all().await;
        if let Err(e) = self.progress.flush().await {
            warn!("Final progress checkpoint failed: {e}");
        }
        outcome?;

        let summary = SessionSummary {
            played: self.link.scheduler.played(),
            choices: self.choices,
            version_id: self.link.version_id,
            reconnects: self.link.reconnects,
            last_seq_id: self.last_seq_id,
        };
        info!(
            "Session finished: {} events, {} choices, {} reconnects",
            summary.played,
            summary.choices.len(),
            summary.reconnects
        );
        Ok((summary, self.renderer))
    }

    async fn play_all(&mut self) -> Result<(), ApiError> {
        loop {
            self.link.regulate().await?;
            self.flush_notices().await;
            if let Some(step) = self.link.scheduler.next() {
                self.play(step).await?;
                if self.link.scheduler.is_ended() {
                    return Ok(());
                }
                continue;
            }
            if self.link.scheduler.is_ended() {
                return Ok(());
            }
            self.link.refill().await?;
        }
    }

    async fn play(&mut self, step: Step) -> Result<(), ApiError> {
        let Step { event, wait } = step;
        let mut assets = Vec::new();
        for resource in event.resource_refs() {
            let status = self.link.prefetcher.get(&resource.url).await;
            assets.push((resource, status));
        }
        self.renderer.present(&event, &assets).await;
        self.last_seq_id = Some(event.seq_id.clone());
        if let Err(e) = self.progress.on_played(&event).await {
            warn!("Progress checkpoint at '{}' failed: {e}", event.seq_id);
        }

        if wait == Wait::None {
            return Ok(());
        }
        let completion = self.await_completion(&wait).await?;
        let chosen = self.link.scheduler.complete(completion)?;
        if let Some(option) = chosen {
            self.renderer.chosen(&option).await;
            self.submit(&option).await?;
        }
        Ok(())
    }

    /// Wait for the viewer or the wait's timer while still taking frames
    async fn await_completion(&mut self, wait: &Wait) -> Result<Completion, ApiError> {
        let (deadline, on_timer) = match wait {
            Wait::Advance { auto_after: Some(delay) } => (Some(Instant::now() + *delay), Completion::Advance),
            Wait::Choice { timeout: Some(delay), .. } => (Some(Instant::now() + *delay), Completion::ChoiceTimeout),
            Wait::Choice { .. } => (None, Completion::ChoiceTimeout),
            _ => (None, Completion::Advance),
        };
        let timer = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(timer);

        let link = &mut self.link;
        let input = self.renderer.input(wait);
        tokio::pin!(input);
        let mut input_open = true;

        loop {
            tokio::select! {
                answer = &mut input, if input_open => match answer {
                    Some(completion) => return Ok(completion),
                    None => input_open = false,
                },
                _ = &mut timer => return Ok(on_timer.clone()),
                frame = link.next_frame(), if link.stream.is_some() => {
                    if let Some(frame) = frame {
                        link.handle(frame)?;
                    }
                    link.regulate().await?;
                }
            }
        }
    }

    async fn submit(&mut self, option: &DecisionOption) -> Result<(), ApiError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.link.source.submit_choice(option.option_id.clone()).await {
                Ok(ack) => {
                    debug!("Choice '{}' applied on version '{}'", ack.option_id, ack.version_id);
                    self.choices.push(ack.option_id);
                    self.link.version_id = Some(ack.version_id.clone());
                    if let Err(e) = self.progress.on_choice(ack.version_id).await {
                        warn!("Progress checkpoint after choice failed: {e}");
                    }
                    return Ok(());
                }
                Err(e) if attempt < CHOICE_ATTEMPTS && !matches!(e, ApiError::NotFound(_)) => {
                    warn!("Choice '{}' not applied ({e}), retrying", option.option_id);
                    if self.link.stream.is_none() {
                        let from = self.link.scheduler.buffer().last_received().cloned();
                        self.link.reopen(from).await?;
                    }
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn flush_notices(&mut self) {
        for message in std::mem::take(&mut self.link.notices) {
            self.renderer.notice(&message).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::generation::ScriptedGenerator;
    use crate::application::progress::ProgressSink;
    use crate::config::{PlaybackConfig, PrefetchConfig, ProgressConfig, StreamConfig};
    use crate::domain::entities::{Story, StoryKind};
    use crate::domain::value_objects::{BranchTag, EventType};
    use crate::infrastructure::fetchers::InMemoryFetcher;
    use std::collections::VecDeque;

    fn sid() -> StoryId {
        StoryId::from("s1")
    }

    fn graph() -> Vec<Event> {
        let root = BranchTag::root();
        vec![
            Event::linear(&sid(), "E1", EventType::StoryStart, &root, "E2"),
            Event::linear(&sid(), "E2", EventType::Narration, &root, "E3"),
            Event::decision(
                &sid(),
                "E3",
                &root,
                vec![
                    DecisionOption::new("optA", "Stay", "E4", "a"),
                    DecisionOption::new("optB", "Run", "E5", "b"),
                ],
            ),
            Event::linear(&sid(), "E4", EventType::Dialogue, &BranchTag::from("a"), "E6"),
            Event::terminal(&sid(), "E6", &BranchTag::from("a")),
            Event::terminal(&sid(), "E5", &BranchTag::from("b")),
        ]
    }

    #[derive(Default)]
    struct ScriptedRenderer {
        presented: Vec<String>,
        picks: VecDeque<OptionId>,
    }

    #[async_trait]
    impl Renderer for ScriptedRenderer {
        async fn present(&mut self, event: &Event, _assets: &[(ResourceRef, AssetStatus)]) {
            self.presented.push(event.seq_id.to_string());
        }

        async fn input(&mut self, wait: &Wait) -> Option<Completion> {
            match wait {
                Wait::Choice { .. } => self.picks.pop_front().map(Completion::Choice),
                Wait::Media => Some(Completion::MediaFinished),
                _ => Some(Completion::Advance),
            }
        }
    }

    async fn session(
        picks: &[&str],
    ) -> (Arc<StoryService>, PlaybackSession<ScriptedRenderer>) {
        let service = Arc::new(StoryService::in_memory(
            Arc::new(ScriptedGenerator::new()),
            StreamConfig::default(),
        ));
        service
            .import_story(
                Story::new(sid(), "Rain", StoryKind::Interactive, ViewerId::from("author")),
                graph(),
            )
            .await
            .unwrap();
        let source = Arc::new(LocalEventSource::new(service.clone(), sid(), ViewerId::from("v1")));
        let sink: Arc<dyn ProgressSink> = service.clone();
        let progress = ProgressSynchronizer::new(sink, sid(), ViewerId::from("v1"), &ProgressConfig::default());
        let renderer = ScriptedRenderer {
            picks: picks.iter().map(|p| OptionId::from(*p)).collect(),
            ..ScriptedRenderer::default()
        };
        let session = PlaybackSession::new(
            source,
            PlaybackScheduler::new(PlaybackConfig::default(), None),
            Arc::new(ResourcePrefetcher::new(Arc::new(InMemoryFetcher::new()), PrefetchConfig::default())),
            progress,
            renderer,
        );
        (service, session)
    }

    #[tokio::test(start_paused = true)]
    async fn plays_through_a_choice() {
        let (service, session) = session(&["optB"]).await;
        let (summary, renderer) = session.run().await.unwrap();

        assert_eq!(renderer.presented, vec!["E1", "E2", "E3", "E5"]);
        assert_eq!(summary.choices, vec![OptionId::from("optB")]);
        let progress = service.get_progress(&ViewerId::from("v1"), &sid()).await.unwrap();
        assert_eq!(progress.current_seq_id, SeqId::from("E5"));
        assert_eq!(progress.version_id, summary.version_id);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_viewers_get_the_first_option() {
        let (_service, session) = session(&[]).await;
        let (summary, renderer) = session.run().await.unwrap();
        assert_eq!(renderer.presented, vec!["E1", "E2", "E3", "E4", "E6"]);
        assert_eq!(summary.choices, vec![OptionId::from("optA")]);
    }
}
