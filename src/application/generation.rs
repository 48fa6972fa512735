//! Narrative generation - Materializing missing parts of the graph on demand

use crate::application::graph::EventStore;
use crate::domain::entities::{DecisionOption, Event, Story, StoryKind};
use crate::domain::errors::DomainError;
use crate::domain::value_objects::{BranchTag, EventType, OptionId, SeqId, StoryId};
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// A pointer whose target does not exist yet
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub story_id: StoryId,
    /// Event owning the pointer
    pub owner: SeqId,
    /// Chosen option when the owner is a decision
    pub option_id: Option<OptionId>,
    /// Id the first generated event must carry
    pub target: SeqId,
    pub branch_tag: BranchTag,
    /// Content of the owning event, for generators that carry state in the graph
    pub context: serde_json::Value,
}

impl GenerationRequest {
    /// Request for the successor of a linear event
    pub fn continuation(owner: &Event, next: &SeqId) -> Self {
        Self {
            story_id: owner.story_id.clone(),
            owner: owner.seq_id.clone(),
            option_id: None,
            target: next.clone(),
            branch_tag: owner.branch_tag.clone(),
            context: owner.content.clone(),
        }
    }

    /// Request for the head of a decision's option branch
    pub fn branch(decision: &Event, option: &DecisionOption) -> Self {
        Self {
            story_id: decision.story_id.clone(),
            owner: decision.seq_id.clone(),
            option_id: Some(option.option_id.clone()),
            target: option.next_seq_id.clone(),
            branch_tag: option.branch_tag.clone(),
            context: decision.content.clone(),
        }
    }

    fn slot_key(&self) -> SlotKey {
        (self.story_id.clone(), self.owner.clone(), self.option_id.clone())
    }
}

type SlotKey = (StoryId, SeqId, Option<OptionId>);

/// Produces narrative events
///
/// A generated segment starts with `request.target` and runs in walk order.
/// It may end on a terminal, a decision, or a pointer to a further event that
/// will be requested later.
#[async_trait]
pub trait NarrativeGenerator: Send + Sync {
    /// Opening segment of a story, starting with its start event
    async fn opening(&self, story: &Story) -> Result<Vec<Event>, DomainError>;

    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<Event>, DomainError>;
}

/// Single-flight guard for lazy materialization
///
/// Keyed by `(story, owner, option)`. The first caller generates; callers
/// arriving meanwhile wait for it and then find the stored result.
#[derive(Default)]
pub struct MaterializationGate {
    slots: Mutex<HashMap<SlotKey, Arc<Mutex<()>>>>,
}

impl MaterializationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure `request.target` exists, generating it at most once at a time
    pub async fn materialize(
        &self,
        events: &EventStore,
        generator: &dyn NarrativeGenerator,
        request: &GenerationRequest,
    ) -> Result<(), DomainError> {
        if events.contains(&request.target).await? {
            return Ok(());
        }

        let slot = {
            let mut slots = self.slots.lock().await;
            slots.entry(request.slot_key()).or_default().clone()
        };
        let result = {
            let _turn = slot.lock().await;
            Self::generate_once(events, generator, request).await
        };

        let mut slots = self.slots.lock().await;
        // Map plus this handle: nobody else is waiting on the slot.
        if Arc::strong_count(&slot) <= 2 {
            slots.remove(&request.slot_key());
        }
        result
    }

    async fn generate_once(
        events: &EventStore,
        generator: &dyn NarrativeGenerator,
        request: &GenerationRequest,
    ) -> Result<(), DomainError> {
        if events.contains(&request.target).await? {
            debug!("'{}' was materialized by a concurrent request", request.target);
            return Ok(());
        }

        let segment = generator.generate(request).await?;
        match segment.first() {
            Some(first) if first.seq_id == request.target => {}
            Some(first) => {
                return Err(DomainError::invalid_event(
                    &first.seq_id,
                    format!("generated segment must start at '{}'", request.target),
                ));
            }
            None => {
                return Err(DomainError::generation_failure(
                    &request.story_id,
                    &request.target,
                    "generator returned an empty segment",
                ));
            }
        }
        let appended = events.append_all(segment).await?;
        debug!(
            "Materialized {} events from '{}' for story '{}'",
            appended, request.target, request.story_id
        );
        Ok(())
    }

    /// Requests currently being generated or waited on
    pub async fn in_flight(&self) -> usize {
        self.slots.lock().await.len()
    }
}

/// Generator replaying pre-registered segments
///
/// Useful for tests and fixed stories. Failures can be injected per target.
#[derive(Default)]
pub struct ScriptedGenerator {
    openings: HashMap<StoryId, Vec<Event>>,
    segments: HashMap<SeqId, Vec<Event>>,
    failures: Mutex<HashMap<SeqId, u32>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_opening(mut self, story_id: &StoryId, events: Vec<Event>) -> Self {
        self.openings.insert(story_id.clone(), events);
        self
    }

    /// Segment served when `target` is requested
    pub fn with_segment(mut self, target: impl Into<SeqId>, events: Vec<Event>) -> Self {
        self.segments.insert(target.into(), events);
        self
    }

    /// Fail the next `times` requests for `target`
    pub fn failing(mut self, target: impl Into<SeqId>, times: u32) -> Self {
        self.failures.get_mut().insert(target.into(), times);
        self
    }

    /// Simulated generation latency
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of `generate` calls served so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NarrativeGenerator for ScriptedGenerator {
    async fn opening(&self, story: &Story) -> Result<Vec<Event>, DomainError> {
        self.openings
            .get(&story.id)
            .cloned()
            .ok_or_else(|| DomainError::generation_failure(&story.id, &SeqId::from("opening"), "no opening scripted"))
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<Event>, DomainError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        {
            let mut failures = self.failures.lock().await;
            if let Some(remaining) = failures.get_mut(&request.target)
                && *remaining > 0
            {
                *remaining -= 1;
                warn!("Injected generation failure for '{}'", request.target);
                return Err(DomainError::generation_failure(
                    &request.story_id,
                    &request.target,
                    "injected failure",
                ));
            }
        }
        self.segments.get(&request.target).cloned().ok_or_else(|| {
            DomainError::generation_failure(&request.story_id, &request.target, "no segment scripted")
        })
    }
}

/// Content key holding a procedural decision's depth
const DEPTH_KEY: &str = "depth";

/// Deterministic procedural story generator
///
/// Every segment is a short scene; ids are MD5-derived from the pointer that
/// requested them, so the same request always yields the same events. Each
/// decision records its depth in its content, so the generator keeps no state
/// and a reloaded graph continues exactly where it stopped.
pub struct ProceduralGenerator {
    /// Decisions along any path before the story ends
    max_decisions: usize,
    /// Narrative beats per segment
    beats: usize,
    options_per_decision: usize,
}

impl ProceduralGenerator {
    pub fn new(max_decisions: usize) -> Self {
        Self {
            max_decisions,
            beats: 3,
            options_per_decision: 2,
        }
    }

    pub fn with_beats(mut self, beats: usize) -> Self {
        self.beats = beats.max(1);
        self
    }

    fn derive_id(seed: &str, part: &str) -> SeqId {
        let digest = format!("{:x}", md5::compute(format!("{seed}/{part}")));
        SeqId::from(&digest[..16])
    }

    /// Scene body starting at `first`; returns the events and the dangling id
    /// the last one points at.
    fn scene(
        &self,
        story_id: &StoryId,
        first: SeqId,
        tag: &BranchTag,
        scene_label: &str,
    ) -> (Vec<Event>, SeqId) {
        let seed = first.to_string();
        let mut ids = vec![first];
        for i in 0..=self.beats {
            ids.push(Self::derive_id(&seed, &format!("beat{i}")));
        }
        let scene_id = format!("scene_{}", seed.chars().take(8).collect::<String>());

        let mut events = Vec::with_capacity(self.beats + 1);
        events.push(
            Event::linear(story_id, ids[0].clone(), EventType::SceneStart, tag, ids[1].clone())
                .with_content(json!({"background": {"url": format!("asset://bg/{scene_label}.png")}}))
                .with_position(Some("chapter_1"), Some(scene_id.as_str())),
        );
        for i in 1..=self.beats {
            let (event_type, content) = if i % 2 == 1 {
                (EventType::Narration, json!({"text": format!("{scene_label}: beat {i}.")}))
            } else {
                (
                    EventType::Dialogue,
                    json!({
                        "speaker": "Guide",
                        "text": format!("Line {i} of {scene_label}."),
                        "voice": {"url": format!("asset://voice/{seed}_{i}.ogg"), "duration": 1.5}
                    }),
                )
            };
            events.push(
                Event::linear(story_id, ids[i].clone(), event_type, tag, ids[i + 1].clone())
                    .with_content(content)
                    .with_position(Some("chapter_1"), Some(scene_id.as_str())),
            );
        }
        let tail = ids[self.beats + 1].clone();
        (events, tail)
    }

    /// Decisions already taken on the way to the requested pointer.
    /// Pointers not owned by a procedural decision end the story.
    fn level_of(&self, request: &GenerationRequest) -> usize {
        match (&request.option_id, request.context.get(DEPTH_KEY).and_then(|d| d.as_u64())) {
            (Some(_), Some(depth)) => usize::try_from(depth).map_or(self.max_decisions, |d| d + 1),
            _ => self.max_decisions,
        }
    }

    /// Close a segment: a decision while decisions remain, otherwise the end
    fn close(
        &self,
        story_id: &StoryId,
        at: SeqId,
        tag: &BranchTag,
        level: usize,
        events: &mut Vec<Event>,
    ) {
        if level >= self.max_decisions {
            events.push(Event::terminal(story_id, at, tag));
            return;
        }
        let seed = at.to_string();
        let prefix: String = seed.chars().take(6).collect();
        let options: Vec<DecisionOption> = (0..self.options_per_decision)
            .map(|i| {
                DecisionOption::new(
                    format!("opt{i}"),
                    format!("Path {}", i + 1),
                    Self::derive_id(&seed, &format!("opt{i}")),
                    format!("{prefix}{i}"),
                )
            })
            .collect();
        events.push(Event::decision(story_id, at, tag, options).with_content(json!({ DEPTH_KEY: level })));
    }
}

#[async_trait]
impl NarrativeGenerator for ProceduralGenerator {
    async fn opening(&self, story: &Story) -> Result<Vec<Event>, DomainError> {
        let root = BranchTag::root();
        let start = Self::derive_id(story.id.as_str(), "start");
        let first_scene = Self::derive_id(story.id.as_str(), "scene");

        let mut events = vec![
            Event::linear(&story.id, start, EventType::StoryStart, &root, first_scene.clone())
                .with_content(json!({"title": story.title})),
        ];
        let (scene, tail) = self.scene(&story.id, first_scene, &root, "opening");
        events.extend(scene);
        match story.kind {
            StoryKind::Interactive => self.close(&story.id, tail, &root, 0, &mut events),
            StoryKind::Linear => events.push(Event::terminal(&story.id, tail, &root)),
        }
        Ok(events)
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<Event>, DomainError> {
        let level = self.level_of(request);
        let label = match &request.option_id {
            Some(option) => format!("branch {option}"),
            None => "continuation".to_string(),
        };
        let (mut events, tail) =
            self.scene(&request.story_id, request.target.clone(), &request.branch_tag, &label);
        self.close(&request.story_id, tail, &request.branch_tag, level, &mut events);
        Ok(events)
    }
}
