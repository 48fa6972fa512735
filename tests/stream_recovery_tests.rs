//! Push stream behaviour under reconnects, lazy generation and failures

use std::sync::Arc;
use std::time::Duration;
use storyweave::application::api::{ApiError, ChoiceSubmission, ConnectRequest, StreamFrame, SystemEvent};
use storyweave::application::dispatcher::StreamConnection;
use storyweave::application::{ProceduralGenerator, ScriptedGenerator, StoryService};
use storyweave::client::{Completion, Intake, PlaybackScheduler, Wait};
use storyweave::config::{PlaybackConfig, StreamConfig};
use storyweave::domain::{
    BranchTag, DecisionOption, Event, EventType, OptionId, SeqId, Story, StoryId, StoryKind, StoryStatus,
    ViewerId,
};
use storyweave::infrastructure::{SseDecoder, encode_frame};

fn sid() -> StoryId {
    StoryId::from("rain")
}

/// E5 is left for the generator
fn partial_graph() -> Vec<Event> {
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
        Event::terminal(&sid(), "E4", &BranchTag::from("a")),
    ]
}

fn quiet() -> StreamConfig {
    StreamConfig {
        speculative_lookahead: 0,
        ..StreamConfig::default()
    }
}

async fn service_with(generator: Arc<ScriptedGenerator>, config: StreamConfig) -> Arc<StoryService> {
    let service = Arc::new(StoryService::in_memory(generator, config));
    service
        .import_story(
            Story::new(sid(), "Rain", StoryKind::Interactive, ViewerId::from("author")),
            partial_graph(),
        )
        .await
        .expect("import should succeed");
    service
}

fn e5_generator() -> ScriptedGenerator {
    ScriptedGenerator::new().with_segment("E5", vec![Event::terminal(&sid(), "E5", &BranchTag::from("b"))])
}

async fn next_event(conn: &mut StreamConnection) -> Option<Event> {
    while let Some(frame) = conn.next_frame().await {
        if let StreamFrame::Story(event) = frame {
            return Some(event);
        }
    }
    None
}

async fn choose(service: &StoryService, viewer: &str, option: &str) -> Result<(), ApiError> {
    service
        .submit_choice(ChoiceSubmission {
            story_id: sid(),
            viewer_id: ViewerId::from(viewer),
            option_id: OptionId::from(option),
        })
        .await
        .map(|_| ())
}

#[tokio::test(start_paused = true)]
async fn reconnecting_from_a_received_event_does_not_replay_it() {
    let service = service_with(Arc::new(ScriptedGenerator::new()), quiet()).await;
    let mut scheduler = PlaybackScheduler::new(PlaybackConfig::default(), None);

    // First connection drops while E3 is on its way.
    let mut conn = service
        .connect(ConnectRequest::new(sid(), ViewerId::from("v1")))
        .await
        .unwrap();
    for _ in 0..2 {
        let event = next_event(&mut conn).await.unwrap();
        assert_eq!(scheduler.receive(event), Intake::Enqueued);
    }
    conn.close();
    assert_eq!(scheduler.buffer().last_received(), Some(&SeqId::from("E2")));

    let resume = ConnectRequest::new(sid(), ViewerId::from("v1")).resume_from(SeqId::from("E2"), None);
    let mut conn = service.connect(resume).await.unwrap();
    let replayed = next_event(&mut conn).await.unwrap();
    assert_eq!(replayed.seq_id, SeqId::from("E2"));
    assert_eq!(scheduler.receive(replayed), Intake::Duplicate);
    let decision = next_event(&mut conn).await.unwrap();
    assert_eq!(scheduler.receive(decision), Intake::Enqueued);

    let mut played = Vec::new();
    while let Some(step) = scheduler.next() {
        played.push(step.event.seq_id.to_string());
        match step.wait {
            Wait::None => {}
            Wait::Choice { .. } => break,
            _ => {
                scheduler.complete(Completion::Advance).unwrap();
            }
        }
    }
    assert_eq!(played, vec!["E1", "E2", "E3"]);
}

#[tokio::test(start_paused = true)]
async fn viewers_racing_into_a_missing_branch_share_one_generation() {
    let generator = Arc::new(e5_generator().with_delay(Duration::from_secs(2)));
    let service = service_with(generator.clone(), quiet()).await;

    let mut first = service
        .connect(ConnectRequest::new(sid(), ViewerId::from("v1")))
        .await
        .unwrap();
    let mut second = service
        .connect(ConnectRequest::new(sid(), ViewerId::from("v2")))
        .await
        .unwrap();
    for conn in [&mut first, &mut second] {
        for _ in 0..3 {
            next_event(conn).await.unwrap();
        }
    }

    let (a, b) = tokio::join!(choose(&service, "v1", "optB"), choose(&service, "v2", "optB"));
    a.unwrap();
    b.unwrap();

    assert_eq!(next_event(&mut first).await.unwrap().seq_id, SeqId::from("E5"));
    assert_eq!(next_event(&mut second).await.unwrap().seq_id, SeqId::from("E5"));
    assert_eq!(generator.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn generation_failures_surface_as_error_frames_until_retried() {
    let generator = Arc::new(e5_generator().failing("E5", 2));
    let service = service_with(generator.clone(), quiet()).await;
    let mut conn = service
        .connect(ConnectRequest::new(sid(), ViewerId::from("v1")))
        .await
        .unwrap();
    for _ in 0..3 {
        next_event(&mut conn).await.unwrap();
    }
    choose(&service, "v1", "optB").await.unwrap();

    let mut errors = 0;
    let landed = loop {
        match conn.next_frame().await.expect("stream ended early") {
            StreamFrame::System(SystemEvent::Error {
                error_code,
                retry_after,
                ..
            }) => {
                assert_eq!(error_code, "GENERATION_FAILED");
                assert_eq!(retry_after, 5);
                errors += 1;
            }
            StreamFrame::System(SystemEvent::Heartbeat { .. }) => {}
            StreamFrame::Story(event) => break event,
            other => panic!("unexpected frame: {other:?}"),
        }
    };
    assert_eq!(errors, 2);
    assert_eq!(landed.seq_id, SeqId::from("E5"));
    assert_eq!(generator.calls(), 3);
    assert!(conn.next_frame().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn waiting_decisions_keep_the_stream_alive() {
    let service = service_with(Arc::new(ScriptedGenerator::new()), quiet()).await;
    let mut conn = service
        .connect(ConnectRequest::new(sid(), ViewerId::from("v1")))
        .await
        .unwrap();
    for _ in 0..3 {
        next_event(&mut conn).await.unwrap();
    }

    for _ in 0..3 {
        assert!(conn.next_frame().await.unwrap().is_heartbeat());
    }
    let pending = conn.choices().pending_decision().unwrap();
    assert_eq!(pending.seq_id, SeqId::from("E3"));
    assert_eq!(pending.options, vec![OptionId::from("optA"), OptionId::from("optB")]);
}

#[tokio::test(start_paused = true)]
async fn invalid_choices_leave_the_decision_open() {
    let service = service_with(Arc::new(ScriptedGenerator::new()), quiet()).await;
    let early = choose(&service, "v1", "optA").await;
    assert!(matches!(early, Err(ApiError::Invalid(_))));

    let mut conn = service
        .connect(ConnectRequest::new(sid(), ViewerId::from("v1")))
        .await
        .unwrap();
    for _ in 0..3 {
        next_event(&mut conn).await.unwrap();
    }
    let wrong = choose(&service, "v1", "optZ").await;
    assert!(matches!(wrong, Err(ApiError::Invalid(_))));

    choose(&service, "v1", "optA").await.unwrap();
    assert_eq!(next_event(&mut conn).await.unwrap().seq_id, SeqId::from("E4"));
}

#[tokio::test(start_paused = true)]
async fn resuming_at_a_taken_decision_shows_it_then_follows_the_choice() {
    let service = service_with(Arc::new(e5_generator()), quiet()).await;
    let mut conn = service
        .connect(ConnectRequest::new(sid(), ViewerId::from("v1")))
        .await
        .unwrap();
    for _ in 0..3 {
        next_event(&mut conn).await.unwrap();
    }
    let ack = service
        .submit_choice(ChoiceSubmission {
            story_id: sid(),
            viewer_id: ViewerId::from("v1"),
            option_id: OptionId::from("optB"),
        })
        .await
        .unwrap();
    assert_eq!(next_event(&mut conn).await.unwrap().seq_id, SeqId::from("E5"));
    conn.close();

    // The viewer saved its position on the decision itself.
    let resume = ConnectRequest::new(sid(), ViewerId::from("v1")).resume_from(SeqId::from("E3"), Some(ack.version_id));
    let mut conn = service.connect(resume).await.unwrap();
    match conn.next_frame().await {
        Some(StreamFrame::System(SystemEvent::ChoiceRecorded { seq_id, option_id })) => {
            assert_eq!(seq_id, SeqId::from("E3"));
            assert_eq!(option_id, OptionId::from("optB"));
        }
        other => panic!("Expected the recorded choice first, got {other:?}"),
    }
    assert_eq!(next_event(&mut conn).await.unwrap().seq_id, SeqId::from("E3"));
    assert!(conn.choices().pending_decision().is_none());
    assert_eq!(next_event(&mut conn).await.unwrap().seq_id, SeqId::from("E5"));
    assert!(conn.next_frame().await.is_none());

    let late = choose(&service, "v1", "optA").await;
    assert!(matches!(late, Err(ApiError::Invalid(_))));
    assert_eq!(service.versions_of(&sid()).await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn frames_survive_arbitrary_sse_chunking() {
    let service = service_with(Arc::new(ScriptedGenerator::new()), StreamConfig::default()).await;
    let mut conn = service
        .connect(ConnectRequest::new(sid(), ViewerId::from("v1")))
        .await
        .unwrap();

    // E1..E3, the lookahead of optA, then one heartbeat.
    let mut sent = Vec::new();
    while sent.len() < 5 {
        let frame = conn.next_frame().await.unwrap();
        let heartbeat = frame.is_heartbeat();
        sent.push(frame);
        if heartbeat {
            break;
        }
    }
    let text: String = sent
        .iter()
        .map(|frame| encode_frame(frame).unwrap())
        .collect();

    let mut decoder = SseDecoder::new();
    let mut received = Vec::new();
    for chunk in text.as_bytes().chunks(7) {
        for frame in decoder.decode(std::str::from_utf8(chunk).unwrap()) {
            received.push(frame.unwrap());
        }
    }
    assert_eq!(received, sent);
    assert_eq!(decoder.last_event_id(), Some("E4"));
}

#[tokio::test(start_paused = true)]
async fn unknown_resume_points_end_the_stream_with_a_final_error() {
    let service = service_with(Arc::new(ScriptedGenerator::new()), quiet()).await;
    let resume = ConnectRequest::new(sid(), ViewerId::from("v1")).resume_from(SeqId::from("E42"), None);
    let mut conn = service.connect(resume).await.unwrap();

    match conn.next_frame().await {
        Some(StreamFrame::System(SystemEvent::Error { error_code, retry_after, .. })) => {
            assert_eq!(error_code, "NOT_FOUND");
            assert_eq!(retry_after, 0);
        }
        other => panic!("Expected a final error frame, got {other:?}"),
    }
    assert!(conn.next_frame().await.is_none());

    let missing = service
        .connect(ConnectRequest::new(StoryId::from("nope"), ViewerId::from("v1")))
        .await;
    assert!(matches!(missing, Err(ApiError::NotFound(_))));
}

#[tokio::test]
async fn generated_stories_become_streamable() {
    let service = Arc::new(StoryService::in_memory(
        Arc::new(ProceduralGenerator::new(1)),
        StreamConfig::default(),
    ));
    let story = Story::new(sid(), "Rain", StoryKind::Interactive, ViewerId::from("author"));
    let first = service.create_story(story).await.unwrap();
    assert_ne!(first.status, StoryStatus::Error);

    let mut report = first;
    for _ in 0..100 {
        if report.is_streamable() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        report = service.status(&sid()).await.unwrap();
    }
    assert_eq!(report.status, StoryStatus::Dynamic);
    assert_eq!(report.progress, 1.0);
    assert_eq!(report.retry_after_secs, None);

    let mut conn = service
        .connect(ConnectRequest::new(sid(), ViewerId::from("v1")))
        .await
        .unwrap();
    let start = next_event(&mut conn).await.unwrap();
    assert_eq!(start.event_type, EventType::StoryStart);
    assert_eq!(start.content["title"], "Rain");
}
