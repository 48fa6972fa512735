//! Client playback against an in-process server

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use storyweave::application::api::ProgressCheckpoint;
use storyweave::application::{ProgressSink, ProgressSynchronizer, Repositories, ScriptedGenerator, StoryService};
use storyweave::client::{
    AssetStatus, Completion, ConnectionCommand, Intake, LocalEventSource, PlaybackScheduler, PlaybackSession,
    Renderer, ResourcePrefetcher, Wait,
};
use storyweave::config::{PlaybackConfig, PrefetchConfig, ProgressConfig, StreamConfig};
use storyweave::domain::{
    BranchTag, DecisionOption, Event, EventType, OptionId, ProgressRepository, ResourceRef, SeqId, Story,
    StoryId, StoryKind, ViewerId,
};
use storyweave::infrastructure::{FileSystemFetcher, InMemoryFetcher, JsonProgressRepository};
use tempfile::TempDir;

const BACKGROUND: &str = "asset://bg/harbor.png";
const VOICE: &str = "asset://voice/e4.ogg";

fn sid() -> StoryId {
    StoryId::from("harbor")
}

fn viewer() -> ViewerId {
    ViewerId::from("v1")
}

fn graph() -> Vec<Event> {
    let root = BranchTag::root();
    let a = BranchTag::from("a");
    vec![
        Event::linear(&sid(), "E1", EventType::StoryStart, &root, "E2").with_content(json!({"title": "Harbor"})),
        Event::linear(&sid(), "E2", EventType::Narration, &root, "E3")
            .with_content(json!({"text": "Fog rolls in.", "background": {"url": BACKGROUND}})),
        Event::decision(
            &sid(),
            "E3",
            &root,
            vec![
                DecisionOption::new("optA", "Wait", "E4", "a"),
                DecisionOption::new("optB", "Sail", "E5", "b"),
            ],
        ),
        Event::linear(&sid(), "E4", EventType::Dialogue, &a, "E6").with_content(json!({
            "speaker": "Keeper",
            "text": "Good call.",
            "voice": {"url": VOICE, "duration": 2.0}
        })),
        Event::terminal(&sid(), "E6", &a),
        Event::terminal(&sid(), "E5", &BranchTag::from("b")),
    ]
}

#[derive(Default)]
struct RecordingRenderer {
    presented: Vec<String>,
    assets: Vec<(String, bool)>,
    picks: VecDeque<OptionId>,
    chosen: Vec<OptionId>,
}

#[async_trait]
impl Renderer for RecordingRenderer {
    async fn present(&mut self, event: &Event, assets: &[(ResourceRef, AssetStatus)]) {
        self.presented.push(event.seq_id.to_string());
        for (resource, status) in assets {
            self.assets.push((resource.url.clone(), status.is_ready()));
        }
    }

    async fn input(&mut self, wait: &Wait) -> Option<Completion> {
        match wait {
            Wait::Choice { .. } => self.picks.pop_front().map(Completion::Choice),
            Wait::Media => Some(Completion::MediaFinished),
            _ => Some(Completion::Advance),
        }
    }

    async fn chosen(&mut self, option: &DecisionOption) {
        self.chosen.push(option.option_id.clone());
    }
}

fn renderer(picks: &[&str]) -> RecordingRenderer {
    RecordingRenderer {
        picks: picks.iter().map(|p| OptionId::from(*p)).collect(),
        ..RecordingRenderer::default()
    }
}

async fn service(repositories: Repositories) -> Arc<StoryService> {
    let service = Arc::new(StoryService::new(
        repositories,
        Arc::new(ScriptedGenerator::new()),
        StreamConfig::default(),
    ));
    service
        .import_story(
            Story::new(sid(), "Harbor", StoryKind::Interactive, ViewerId::from("author")),
            graph(),
        )
        .await
        .expect("import should succeed");
    service
}

fn fetcher() -> Arc<InMemoryFetcher> {
    Arc::new(InMemoryFetcher::new().with_asset(VOICE, b"ogg".to_vec()))
}

fn session(
    service: &Arc<StoryService>,
    fetcher: Arc<InMemoryFetcher>,
    progress: ProgressSynchronizer,
    renderer: RecordingRenderer,
) -> PlaybackSession<RecordingRenderer> {
    let prefetch = PrefetchConfig {
        max_attempts: 2,
        base_backoff_ms: 10,
        ..PrefetchConfig::default()
    };
    PlaybackSession::new(
        Arc::new(LocalEventSource::new(service.clone(), sid(), viewer())),
        PlaybackScheduler::new(PlaybackConfig::default(), None),
        Arc::new(ResourcePrefetcher::new(fetcher, prefetch)),
        progress,
        renderer,
    )
}

fn synchronizer(service: &Arc<StoryService>) -> ProgressSynchronizer {
    let sink: Arc<dyn ProgressSink> = service.clone();
    ProgressSynchronizer::new(sink, sid(), viewer(), &ProgressConfig::default())
}

#[tokio::test(start_paused = true)]
async fn other_branches_are_never_presented() {
    let service = service(Repositories::in_memory()).await;
    let (summary, renderer) = session(&service, fetcher(), synchronizer(&service), renderer(&["optB"]))
        .run()
        .await
        .unwrap();

    // The lookahead pushed E4 and E6 as well; they belong to branch a.
    assert_eq!(renderer.presented, vec!["E1", "E2", "E3", "E5"]);
    assert_eq!(renderer.chosen, vec![OptionId::from("optB")]);
    assert_eq!(summary.played, 4);
    assert_eq!(summary.last_seq_id, Some(SeqId::from("E5")));
}

#[test]
fn schedulers_drop_events_of_inactive_branches() {
    let mut scheduler = PlaybackScheduler::new(PlaybackConfig::default(), Some(BranchTag::from("a")));
    for (i, tag) in ["a", "b", "a", "c", "b"].iter().enumerate() {
        let event = Event::linear(
            &sid(),
            format!("E{i}"),
            EventType::Narration,
            &BranchTag::from(*tag),
            format!("E{}", i + 1),
        );
        let intake = scheduler.receive(event);
        assert_eq!(intake == Intake::Enqueued, *tag == "a");
    }
    assert_eq!(scheduler.buffer().len(), 2);
    assert!(!scheduler.buffer().contains(&SeqId::from("E1")));
}

#[tokio::test(start_paused = true)]
async fn missing_assets_do_not_stop_playback() {
    let service = service(Repositories::in_memory()).await;
    let fetcher = fetcher();
    let (_, renderer) = session(&service, fetcher.clone(), synchronizer(&service), renderer(&["optA"]))
        .run()
        .await
        .unwrap();

    assert_eq!(renderer.presented, vec!["E1", "E2", "E3", "E4", "E6"]);
    assert_eq!(
        renderer.assets,
        vec![(BACKGROUND.to_string(), false), (VOICE.to_string(), true)]
    );
    // Two attempts for the missing background, one for the voice line.
    assert_eq!(fetcher.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn silent_viewers_time_out_to_the_first_option() {
    let service = service(Repositories::in_memory()).await;
    let (summary, renderer) = session(&service, fetcher(), synchronizer(&service), renderer(&[]))
        .run()
        .await
        .unwrap();

    assert_eq!(renderer.chosen, vec![OptionId::from("optA")]);
    assert_eq!(summary.choices, vec![OptionId::from("optA")]);
    assert!(summary.version_id.is_some());
}

#[tokio::test(start_paused = true)]
async fn resumed_sessions_continue_on_the_recorded_branch() {
    let service = service(Repositories::in_memory()).await;
    let root = service.versions().root_of(&sid()).await.unwrap().unwrap();
    let forked = service
        .versions()
        .fork(&root.id, &SeqId::from("E3"), &OptionId::from("optB"), &viewer())
        .await
        .unwrap();
    service
        .save_progress(ProgressCheckpoint {
            story_id: sid(),
            viewer_id: viewer(),
            seq_id: SeqId::from("E3"),
            version_id: Some(forked.id.clone()),
            chapter_id: None,
            scene_id: None,
            play_time_secs: Some(40),
        })
        .await
        .unwrap();

    let saved = service.get_progress(&viewer(), &sid()).await.unwrap();
    let progress = synchronizer(&service)
        .with_play_time(saved.play_time_secs)
        .with_version(saved.version_id.clone());
    let (summary, renderer) = session(&service, fetcher(), progress, renderer(&[]))
        .resume_from(saved.current_seq_id)
        .run()
        .await
        .unwrap();

    // The decision is shown again but answered by the recorded choice.
    assert_eq!(renderer.presented, vec!["E3", "E5"]);
    assert!(renderer.chosen.is_empty());
    assert!(summary.choices.is_empty());
    assert_eq!(summary.version_id, Some(forked.id.clone()));

    let after = service.get_progress(&viewer(), &sid()).await.unwrap();
    assert_eq!(after.current_seq_id, SeqId::from("E5"));
    assert_eq!(after.version_id, Some(forked.id));
    assert!(after.play_time_secs >= 40);
    assert_eq!(after.started_at_ms, saved.started_at_ms);
}

#[tokio::test]
async fn progress_files_outlive_the_service() {
    let dir = TempDir::new().unwrap();
    let repositories =
        Repositories::in_memory().with_progress(Arc::new(JsonProgressRepository::new(dir.path())));
    let service = service(repositories).await;
    let (summary, _) = session(&service, fetcher(), synchronizer(&service), renderer(&["optA"]))
        .run()
        .await
        .unwrap();

    let reopened = JsonProgressRepository::new(dir.path());
    let row = reopened.get(&viewer(), &sid()).await.unwrap().expect("progress row");
    assert_eq!(row.current_seq_id, SeqId::from("E6"));
    assert_eq!(row.version_id, summary.version_id);

    assert!(service.delete_progress(&viewer(), &sid()).await.unwrap());
    assert!(reopened.get(&viewer(), &sid()).await.unwrap().is_none());
}

#[test]
fn backpressure_converges_under_a_steady_producer() {
    const HIGH: usize = 6;
    const LOW: usize = 2;
    const BURST: usize = 3;
    const TOTAL: usize = 120;

    let config = PlaybackConfig {
        high_watermark: HIGH,
        low_watermark: LOW,
        ..PlaybackConfig::default()
    };
    let mut scheduler = PlaybackScheduler::new(config, None);
    let mut produced = 0;
    let mut connected = true;
    let mut toggles = 0;

    for _tick in 0..(TOTAL * 2) {
        if connected {
            for _ in 0..BURST {
                if produced < TOTAL {
                    let event = Event::linear(
                        &sid(),
                        format!("L{produced}"),
                        EventType::Dialogue,
                        &BranchTag::root(),
                        format!("L{}", produced + 1),
                    );
                    assert_eq!(scheduler.receive(event), Intake::Enqueued);
                    produced += 1;
                }
            }
        }
        while let Some(command) = scheduler.watermark() {
            toggles += 1;
            connected = matches!(command, ConnectionCommand::Reopen { .. });
        }
        assert!(scheduler.buffer().blocking_count() <= HIGH + BURST);

        // The viewer reads one line per tick.
        if let Some(step) = scheduler.next()
            && step.wait != Wait::None
        {
            scheduler.complete(Completion::Advance).unwrap();
        }
        assert!(scheduler.buffer().blocking_count() < HIGH + BURST);
        if !connected {
            // Paused streams reopen before the viewer runs dry.
            assert!(scheduler.buffer().blocking_count() >= LOW - 1);
        }
    }

    assert_eq!(scheduler.played(), TOTAL);
    assert!(scheduler.buffer().is_empty());
    assert!(toggles > 0);
    // Each close is followed by at least HIGH - LOW ticks of draining.
    assert!(toggles <= 2 * TOTAL / (HIGH - LOW));
}

#[tokio::test]
async fn file_assets_are_served_and_bad_urls_give_up_at_once() {
    let dir = TempDir::new().unwrap();
    tokio::fs::create_dir_all(dir.path().join("bg")).await.unwrap();
    tokio::fs::write(dir.path().join("bg/harbor.png"), b"png").await.unwrap();

    let prefetcher = ResourcePrefetcher::new(
        Arc::new(FileSystemFetcher::new(dir.path())),
        PrefetchConfig::default(),
    );
    let event = Event::linear(&sid(), "E2", EventType::SceneStart, &BranchTag::root(), "E3")
        .with_content(json!({"background": {"url": BACKGROUND}, "audio": {"url": "https://cdn.example/a.ogg"}}));
    assert_eq!(prefetcher.prefetch_event(&event), 2);

    match prefetcher.get(BACKGROUND).await {
        AssetStatus::Ready(bytes) => assert_eq!(&bytes[..], b"png"),
        AssetStatus::Unavailable => panic!("Expected the background to load"),
    }
    assert_eq!(prefetcher.get("https://cdn.example/a.ogg").await, AssetStatus::Unavailable);
    assert_eq!(prefetcher.tracked(), 2);
}
