//! Story service - Entry point bundling catalog, streaming, choices and progress

use crate::application::api::{
    ApiError, ChoiceAck, ChoiceSubmission, ConnectRequest, ProgressCheckpoint, StatusReport,
};
use crate::application::dispatcher::{ChoiceHandle, StreamConnection, StreamDispatcher};
use crate::application::generation::NarrativeGenerator;
use crate::application::graph::{EventStore, StoryLocks};
use crate::application::progress::ProgressSink;
use crate::application::versions::BranchVersionManager;
use crate::config::StreamConfig;
use crate::domain::entities::{
    BranchVersion, Event, ForkStep, Story, StoryKind, StoryStatus, ViewerProgress, now_millis,
};
use crate::domain::errors::{DomainError, RecordKind};
use crate::domain::repositories::{
    EventRepository, ProgressRepository, RepositoryError, StoryRepository, VersionRepository,
};
use crate::domain::services::GraphValidator;
use crate::domain::value_objects::{StoryId, VersionId, ViewerId};
use crate::infrastructure::repositories::{
    InMemoryEventRepository, InMemoryProgressRepository, InMemoryStoryRepository,
    InMemoryVersionRepository, JsonEventRepository, JsonProgressRepository, JsonStoryRepository,
    JsonVersionRepository,
};
use async_trait::async_trait;
use log::{debug, error, info};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Poll delay suggested while a story is being prepared
const STATUS_POLL_SECS: u64 = 2;

/// Storage backends of the service
pub struct Repositories {
    pub events: Arc<dyn EventRepository>,
    pub versions: Arc<dyn VersionRepository>,
    pub progress: Arc<dyn ProgressRepository>,
    pub stories: Arc<dyn StoryRepository>,
}

impl Repositories {
    pub fn in_memory() -> Self {
        Self {
            events: Arc::new(InMemoryEventRepository::new()),
            versions: Arc::new(InMemoryVersionRepository::new()),
            progress: Arc::new(InMemoryProgressRepository::new()),
            stories: Arc::new(InMemoryStoryRepository::new()),
        }
    }

    /// File-backed storage below `data_dir`, loading whatever is already there
    pub async fn open(data_dir: &Path) -> Result<Self, RepositoryError> {
        Ok(Self {
            events: Arc::new(JsonEventRepository::open(data_dir.join("events")).await?),
            versions: Arc::new(JsonVersionRepository::open(data_dir.join("versions")).await?),
            progress: Arc::new(JsonProgressRepository::new(data_dir.join("progress"))),
            stories: Arc::new(JsonStoryRepository::open(data_dir.join("stories")).await?),
        })
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressRepository>) -> Self {
        self.progress = progress;
        self
    }
}

pub struct StoryService {
    stories: Arc<dyn StoryRepository>,
    progress: Arc<dyn ProgressRepository>,
    events: Arc<EventStore>,
    versions: Arc<BranchVersionManager>,
    dispatcher: StreamDispatcher,
    generator: Arc<dyn NarrativeGenerator>,
    sessions: Mutex<HashMap<(StoryId, ViewerId), ChoiceHandle>>,
}

impl StoryService {
    pub fn new(
        repositories: Repositories,
        generator: Arc<dyn NarrativeGenerator>,
        config: StreamConfig,
    ) -> Self {
        let events = Arc::new(EventStore::new(repositories.events, Arc::new(StoryLocks::new())));
        let versions = Arc::new(BranchVersionManager::new(repositories.versions, events.clone()));
        let dispatcher = StreamDispatcher::new(events.clone(), versions.clone(), generator.clone(), config);
        Self {
            stories: repositories.stories,
            progress: repositories.progress,
            events,
            versions,
            dispatcher,
            generator,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory(generator: Arc<dyn NarrativeGenerator>, config: StreamConfig) -> Self {
        Self::new(Repositories::in_memory(), generator, config)
    }

    pub fn events(&self) -> &Arc<EventStore> {
        &self.events
    }

    pub fn versions(&self) -> &Arc<BranchVersionManager> {
        &self.versions
    }

    /// Register a story and prepare its opening in the background
    pub async fn create_story(self: &Arc<Self>, mut story: Story) -> Result<StatusReport, ApiError> {
        story.status = StoryStatus::Pending;
        story.error_message = None;
        let story_id = story.id.clone();
        self.insert_story(story).await?;

        let service = Arc::clone(self);
        let id = story_id.clone();
        tokio::spawn(async move {
            if let Err(e) = service.prepare(&id).await {
                error!("Preparing story '{id}' failed: {e}");
            }
        });
        self.status(&story_id).await
    }

    /// Generate the opening segment and make the story streamable
    pub async fn prepare(&self, story_id: &StoryId) -> Result<StatusReport, ApiError> {
        let story = self.story(story_id).await?;
        self.set_status(story_id, StoryStatus::Generating, None).await?;

        let outcome = async {
            let opening = self.generator.opening(&story).await?;
            self.events.append_all(opening).await?;
            if story.kind == StoryKind::Interactive {
                self.versions.create_root(story_id, &story.creator).await?;
            }
            Ok::<(), DomainError>(())
        }
        .await;

        match outcome {
            Ok(()) => {
                let status = match story.kind {
                    StoryKind::Interactive => StoryStatus::Dynamic,
                    StoryKind::Linear => StoryStatus::Completed,
                };
                self.set_status(story_id, status, None).await?;
                info!("Story '{story_id}' is ready ({status:?})");
            }
            Err(e) => {
                error!("Opening of story '{story_id}' failed: {e}");
                self.set_status(story_id, StoryStatus::Error, Some(e.to_string()))
                    .await?;
            }
        }
        self.status(story_id).await
    }

    /// Load a complete or partial graph, such as one read from a file
    pub async fn import_story(&self, mut story: Story, events: Vec<Event>) -> Result<StatusReport, ApiError> {
        let report = GraphValidator::new().validate(&events)?;
        if report.story_id != story.id {
            return Err(ApiError::invalid(format!(
                "graph belongs to story '{}', not '{}'",
                report.story_id, story.id
            )));
        }
        story.status = if story.kind == StoryKind::Interactive || !report.pending.is_empty() {
            StoryStatus::Dynamic
        } else {
            StoryStatus::Completed
        };
        let story_id = story.id.clone();
        let creator = story.creator.clone();
        let kind = story.kind;
        if self.stories.get(&story_id).await.map_err(DomainError::from)?.is_some() {
            return Err(ApiError::invalid(format!("story '{story_id}' already exists")));
        }

        // The row goes in last, so a story is never visible without its graph.
        if let Err(e) = self.events.append_all(events).await {
            self.discard_graph(&story_id).await;
            return Err(e.into());
        }
        if let Err(e) = self.insert_story(story).await {
            self.discard_graph(&story_id).await;
            return Err(e);
        }
        if kind == StoryKind::Interactive {
            self.versions.create_root(&story_id, &creator).await?;
        }
        info!(
            "Imported story '{}' ({} events, {} pending)",
            story_id,
            report.event_count,
            report.pending.len()
        );
        self.status(&story_id).await
    }

    async fn discard_graph(&self, story_id: &StoryId) {
        match self.events.remove_story(story_id).await {
            Ok(dropped) => debug!("Rolled back {dropped} events of '{story_id}'"),
            Err(e) => error!("Rolling back the graph of '{story_id}' failed: {e}"),
        }
    }

    async fn insert_story(&self, story: Story) -> Result<(), ApiError> {
        let story_id = story.id.clone();
        self.stories.insert(story).await.map_err(|e| match e {
            RepositoryError::Conflict { .. } => {
                ApiError::invalid(format!("story '{story_id}' already exists"))
            }
            other => DomainError::from(other).into(),
        })
    }

    pub async fn story(&self, story_id: &StoryId) -> Result<Story, ApiError> {
        self.stories
            .get(story_id)
            .await
            .map_err(DomainError::from)?
            .ok_or_else(|| ApiError::story_not_found(story_id))
    }

    async fn set_status(
        &self,
        story_id: &StoryId,
        status: StoryStatus,
        message: Option<String>,
    ) -> Result<(), ApiError> {
        self.stories
            .update_status(story_id, status, message)
            .await
            .map_err(|e| DomainError::from(e).into())
    }

    /// Answer a status poll
    pub async fn status(&self, story_id: &StoryId) -> Result<StatusReport, ApiError> {
        let story = self.story(story_id).await?;
        let (progress, message) = match story.status {
            StoryStatus::Pending => (0.0, Some("Waiting to start".to_string())),
            StoryStatus::Generating => (0.5, Some("Generating the opening".to_string())),
            StoryStatus::Dynamic | StoryStatus::Completed => (1.0, None),
            StoryStatus::Error => (0.0, story.error_message.clone()),
        };
        Ok(StatusReport {
            status: story.status,
            progress,
            message,
            retry_after_secs: story.status.is_pre_stream().then_some(STATUS_POLL_SECS),
        })
    }

    /// Open a push stream; replaces any earlier stream of the same viewer
    pub async fn connect(&self, request: ConnectRequest) -> Result<StreamConnection, ApiError> {
        let story = self.story(&request.story_id).await?;
        if story.status.is_pre_stream() {
            return Err(ApiError::NotReady {
                message: format!("story '{}' is still being prepared", story.id),
                retry_after_secs: STATUS_POLL_SECS,
            });
        }
        if story.status == StoryStatus::Error {
            return Err(ApiError::internal(
                story
                    .error_message
                    .unwrap_or_else(|| "story preparation failed".to_string()),
            ));
        }

        let key = (request.story_id.clone(), request.viewer_id.clone());
        let connection = self.dispatcher.connect(request);
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, handle| !handle.is_closed());
        sessions.insert(key, connection.choices());
        Ok(connection)
    }

    /// Route a choice to the viewer's live stream
    pub async fn submit_choice(&self, submission: ChoiceSubmission) -> Result<ChoiceAck, ApiError> {
        let handle = {
            let key = (submission.story_id.clone(), submission.viewer_id.clone());
            let mut sessions = self.sessions.lock().await;
            match sessions.get(&key) {
                Some(h) if h.is_closed() => {
                    sessions.remove(&key);
                    None
                }
                other => other.cloned(),
            }
        };
        let Some(handle) = handle else {
            return Err(ApiError::invalid(format!(
                "viewer '{}' has no open stream for story '{}'",
                submission.viewer_id, submission.story_id
            )));
        };
        let version_id = handle.submit(submission.option_id.clone()).await?;
        Ok(ChoiceAck {
            story_id: submission.story_id,
            option_id: submission.option_id,
            version_id,
        })
    }

    pub async fn save_progress(&self, checkpoint: ProgressCheckpoint) -> Result<(), ApiError> {
        self.story(&checkpoint.story_id).await?;
        let now = now_millis();
        let previous = self
            .progress
            .get(&checkpoint.viewer_id, &checkpoint.story_id)
            .await
            .map_err(DomainError::from)?;
        let row = ViewerProgress {
            started_at_ms: previous.as_ref().map_or(now, |p| p.started_at_ms),
            play_time_secs: checkpoint
                .play_time_secs
                .or(previous.as_ref().map(|p| p.play_time_secs))
                .unwrap_or(0),
            viewer_id: checkpoint.viewer_id,
            story_id: checkpoint.story_id,
            version_id: checkpoint.version_id,
            current_seq_id: checkpoint.seq_id,
            chapter_id: checkpoint.chapter_id,
            scene_id: checkpoint.scene_id,
            last_played_at_ms: now,
        };
        self.progress.upsert(&row).await.map_err(DomainError::from)?;
        Ok(())
    }

    pub async fn get_progress(
        &self,
        viewer_id: &ViewerId,
        story_id: &StoryId,
    ) -> Result<ViewerProgress, ApiError> {
        self.progress
            .get(viewer_id, story_id)
            .await
            .map_err(DomainError::from)?
            .ok_or_else(|| {
                DomainError::not_found(RecordKind::Progress, format!("{viewer_id}/{story_id}")).into()
            })
    }

    pub async fn delete_progress(&self, viewer_id: &ViewerId, story_id: &StoryId) -> Result<bool, ApiError> {
        Ok(self
            .progress
            .delete(viewer_id, story_id)
            .await
            .map_err(DomainError::from)?)
    }

    /// Connections whose choice channel is still registered
    pub async fn open_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn versions_of(&self, story_id: &StoryId) -> Result<Vec<BranchVersion>, ApiError> {
        Ok(self.versions.versions_of(story_id).await?)
    }

    pub async fn resolve_path(&self, version_id: &VersionId) -> Result<Vec<ForkStep>, ApiError> {
        Ok(self.versions.resolve_path(version_id).await?)
    }

    pub async fn export_story(&self, story_id: &StoryId) -> Result<Vec<Event>, ApiError> {
        Ok(self.events.export(story_id).await?)
    }

    /// Delete a story with its graph and versions
    pub async fn remove_story(&self, story_id: &StoryId) -> Result<(), ApiError> {
        self.story(story_id).await?;
        self.sessions.lock().await.retain(|(story, _), _| story != story_id);
        let events = self.events.remove_story(story_id).await?;
        let versions = self.versions.remove_story(story_id).await?;
        self.stories.remove(story_id).await.map_err(DomainError::from)?;
        info!("Removed story '{story_id}' ({events} events, {versions} versions)");
        Ok(())
    }
}

#[async_trait]
impl ProgressSink for StoryService {
    async fn save_progress(&self, checkpoint: ProgressCheckpoint) -> Result<(), ApiError> {
        StoryService::save_progress(self, checkpoint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::generation::{ProceduralGenerator, ScriptedGenerator};
    use crate::domain::entities::DecisionOption;
    use crate::domain::value_objects::{BranchTag, EventType, SeqId};

    fn sid() -> StoryId {
        StoryId::from("s1")
    }

    fn story(kind: StoryKind) -> Story {
        Story::new(sid(), "Rain", kind, ViewerId::from("author"))
    }

    fn graph() -> Vec<Event> {
        let root = BranchTag::root();
        vec![
            Event::linear(&sid(), "E1", EventType::StoryStart, &root, "E2"),
            Event::decision(
                &sid(),
                "E2",
                &root,
                vec![DecisionOption::new("optA", "Stay", "E3", "a")],
            ),
            Event::terminal(&sid(), "E3", &BranchTag::from("a")),
        ]
    }

    #[tokio::test]
    async fn prepare_moves_status_to_dynamic() {
        let generator = Arc::new(ProceduralGenerator::new(1));
        let service = StoryService::in_memory(generator, StreamConfig::default());
        service.insert_story(story(StoryKind::Interactive)).await.unwrap();
        assert_eq!(service.status(&sid()).await.unwrap().retry_after_secs, Some(STATUS_POLL_SECS));

        let report = service.prepare(&sid()).await.unwrap();
        assert_eq!(report.status, StoryStatus::Dynamic);
        assert!(report.is_streamable());
        assert!(service.versions().root_of(&sid()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_openings_surface_in_the_status() {
        let service = StoryService::in_memory(Arc::new(ScriptedGenerator::new()), StreamConfig::default());
        service.insert_story(story(StoryKind::Linear)).await.unwrap();
        let report = service.prepare(&sid()).await.unwrap();
        assert_eq!(report.status, StoryStatus::Error);
        assert!(report.message.unwrap().contains("no opening scripted"));

        let err = service
            .connect(ConnectRequest::new(sid(), ViewerId::from("v1")))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Internal(_)));
    }

    #[tokio::test]
    async fn pending_stories_cannot_be_streamed() {
        let service = StoryService::in_memory(Arc::new(ScriptedGenerator::new()), StreamConfig::default());
        service.insert_story(story(StoryKind::Interactive)).await.unwrap();
        let err = service
            .connect(ConnectRequest::new(sid(), ViewerId::from("v1")))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotReady { .. }));
    }

    #[tokio::test]
    async fn progress_keeps_its_start_time() {
        let service = StoryService::in_memory(Arc::new(ScriptedGenerator::new()), StreamConfig::default());
        service.import_story(story(StoryKind::Interactive), graph()).await.unwrap();
        let viewer = ViewerId::from("v1");
        let checkpoint = |seq: &str| ProgressCheckpoint {
            story_id: sid(),
            viewer_id: viewer.clone(),
            seq_id: SeqId::from(seq),
            version_id: None,
            chapter_id: None,
            scene_id: None,
            play_time_secs: None,
        };

        service.save_progress(checkpoint("E1")).await.unwrap();
        let first = service.get_progress(&viewer, &sid()).await.unwrap();
        service.save_progress(checkpoint("E2")).await.unwrap();
        let second = service.get_progress(&viewer, &sid()).await.unwrap();
        assert_eq!(second.current_seq_id, SeqId::from("E2"));
        assert_eq!(second.started_at_ms, first.started_at_ms);

        assert!(service.delete_progress(&viewer, &sid()).await.unwrap());
        assert!(matches!(
            service.get_progress(&viewer, &sid()).await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn choices_need_an_open_stream() {
        let service = StoryService::in_memory(Arc::new(ScriptedGenerator::new()), StreamConfig::default());
        service.import_story(story(StoryKind::Interactive), graph()).await.unwrap();
        let err = service
            .submit_choice(ChoiceSubmission {
                story_id: sid(),
                viewer_id: ViewerId::from("v1"),
                option_id: crate::domain::value_objects::OptionId::from("optA"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Invalid(_)));
    }

    #[tokio::test]
    async fn removal_drops_graph_and_versions() {
        let service = StoryService::in_memory(Arc::new(ScriptedGenerator::new()), StreamConfig::default());
        service.import_story(story(StoryKind::Interactive), graph()).await.unwrap();
        assert_eq!(service.versions_of(&sid()).await.unwrap().len(), 1);

        service.remove_story(&sid()).await.unwrap();
        assert!(service.versions_of(&sid()).await.unwrap().is_empty());
        assert!(service.export_story(&sid()).await.is_err());
        assert!(matches!(service.status(&sid()).await, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn failed_imports_leave_nothing_behind() {
        let service = StoryService::in_memory(Arc::new(ScriptedGenerator::new()), StreamConfig::default());
        service.import_story(story(StoryKind::Interactive), graph()).await.unwrap();

        // E1 is taken by s1, so the import fails after E10 went in.
        let s2 = StoryId::from("s2");
        let clash = vec![
            Event::linear(&s2, "E10", EventType::StoryStart, &BranchTag::root(), "E1"),
            Event::terminal(&s2, "E1", &BranchTag::root()),
        ];
        let other = Story::new(s2.clone(), "Clash", StoryKind::Linear, ViewerId::from("a"));
        assert!(service.import_story(other.clone(), clash).await.is_err());

        assert!(matches!(service.status(&s2).await, Err(ApiError::NotFound(_))));
        assert!(matches!(
            service.connect(ConnectRequest::new(s2.clone(), ViewerId::from("v1"))).await,
            Err(ApiError::NotFound(_))
        ));
        assert!(!service.events().contains(&SeqId::from("E10")).await.unwrap());
        assert_eq!(service.export_story(&sid()).await.unwrap().len(), 3);

        // The id is free for a correct graph.
        let fixed = vec![Event::terminal(&s2, "E20", &BranchTag::root())];
        service.import_story(other, fixed).await.unwrap();
        assert_eq!(service.status(&s2).await.unwrap().status, StoryStatus::Completed);
    }

    #[tokio::test]
    async fn existing_stories_are_not_overwritten_by_imports() {
        let service = StoryService::in_memory(Arc::new(ScriptedGenerator::new()), StreamConfig::default());
        service.import_story(story(StoryKind::Interactive), graph()).await.unwrap();
        let root = BranchTag::root();
        let again = vec![Event::terminal(&sid(), "E30", &root)];
        assert!(matches!(
            service.import_story(story(StoryKind::Interactive), again).await,
            Err(ApiError::Invalid(_))
        ));
        assert!(!service.events().contains(&SeqId::from("E30")).await.unwrap());
        assert_eq!(service.export_story(&sid()).await.unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_streams_are_forgotten() {
        let service = StoryService::in_memory(Arc::new(ScriptedGenerator::new()), StreamConfig::default());
        service.import_story(story(StoryKind::Interactive), graph()).await.unwrap();

        for viewer in ["v1", "v2", "v3"] {
            let conn = service
                .connect(ConnectRequest::new(sid(), ViewerId::from(viewer)))
                .await
                .unwrap();
            conn.close();
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        // Each connect sweeps the closed ones before registering itself.
        assert_eq!(service.open_sessions().await, 1);

        let err = service
            .submit_choice(ChoiceSubmission {
                story_id: sid(),
                viewer_id: ViewerId::from("v3"),
                option_id: crate::domain::value_objects::OptionId::from("optA"),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Invalid(_)));
        assert_eq!(service.open_sessions().await, 0);
    }

    #[tokio::test]
    async fn import_rejects_foreign_graphs() {
        let service = StoryService::in_memory(Arc::new(ScriptedGenerator::new()), StreamConfig::default());
        let other = Story::new(StoryId::from("s2"), "Other", StoryKind::Linear, ViewerId::from("a"));
        assert!(service.import_story(other, graph()).await.is_err());
    }
}
