//! Console player
//!
//! Runs an in-process story server and a playback session against it, with
//! every frame going through the SSE codec, and prints the story as it plays.

use crate::application::api::ApiError;
use crate::application::generation::{NarrativeGenerator, ProceduralGenerator, ScriptedGenerator};
use crate::application::progress::{ProgressSink, ProgressSynchronizer};
use crate::application::service::{Repositories, StoryService};
use crate::cli::view_state::ViewState;
use crate::client::prefetch::{AssetStatus, ResourcePrefetcher};
use crate::client::scheduler::{Completion, PlaybackScheduler, Wait};
use crate::client::session::{LocalEventSource, PlaybackSession, Renderer, SessionSummary};
use crate::config::AppConfig;
use crate::domain::entities::{DecisionOption, Event, Story, StoryKind};
use crate::domain::value_objects::{EventType, OptionId, ResourceRef, StoryId, ViewerId};
use crate::infrastructure::fetchers::{FileSystemFetcher, HttpFetcher, RoutingFetcher};
use crate::storage;
use anyhow::{Context, bail};
use async_trait::async_trait;
use log::{info, warn};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Decisions deep a procedural story goes before it ends
const PROCEDURAL_DEPTH: usize = 2;
const STATUS_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct PlayOptions {
    /// Graph file to play; without one a procedural story is generated
    pub graph: Option<PathBuf>,
    pub title: String,
    pub viewer: ViewerId,
    pub config: AppConfig,
    /// Generate missing branches procedurally
    pub procedural: bool,
    /// Skip all waits
    pub fast: bool,
    /// Options to pick in order; later decisions time out to the first option
    pub choices: Vec<OptionId>,
    /// Keep stories, branch versions and progress here across runs
    pub data_dir: Option<PathBuf>,
    /// Write the materialized graph here when playback ends
    pub save_graph: Option<PathBuf>,
}

/// Renderer printing to stdout
pub struct ConsoleRenderer {
    view: ViewState,
    picks: VecDeque<OptionId>,
    fast: bool,
    lines: usize,
}

impl ConsoleRenderer {
    pub fn new(picks: Vec<OptionId>, fast: bool) -> Self {
        Self {
            view: ViewState::new(),
            picks: picks.into(),
            fast,
            lines: 0,
        }
    }

    /// Story lines printed so far
    pub fn lines(&self) -> usize {
        self.lines
    }

    fn text(event: &Event) -> Option<String> {
        let content = &event.content;
        let text = content.get("text").and_then(|t| t.as_str());
        match event.event_type {
            EventType::Dialogue => {
                let speaker = content.get("speaker").and_then(|s| s.as_str()).unwrap_or("???");
                Some(format!("{speaker}: {}", text.unwrap_or("")))
            }
            EventType::Narration => text.map(str::to_string),
            EventType::StoryStart => content
                .get("title")
                .and_then(|t| t.as_str())
                .map(|title| format!("=== {title} ===")),
            EventType::StoryEnd => Some("=== The End ===".to_string()),
            EventType::Decision => {
                let mut lines = vec![text.unwrap_or("What do you do?").to_string()];
                for (i, option) in event.options.iter().enumerate() {
                    lines.push(format!("  {}. {} [{}]", i + 1, option.label, option.option_id));
                }
                Some(lines.join("\n"))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl Renderer for ConsoleRenderer {
    async fn present(&mut self, event: &Event, assets: &[(ResourceRef, AssetStatus)]) {
        for line in self.view.apply(event, assets).lines() {
            println!("{line}");
        }
        if let Some(text) = Self::text(event) {
            println!("{text}");
            self.lines += 1;
        }
    }

    async fn input(&mut self, wait: &Wait) -> Option<Completion> {
        match wait {
            Wait::Choice { .. } => {
                let pick = self.picks.pop_front();
                match pick {
                    Some(option_id) => Some(Completion::Choice(option_id)),
                    None if self.fast => Some(Completion::ChoiceTimeout),
                    None => None,
                }
            }
            Wait::Media => Some(Completion::MediaFinished),
            Wait::Advance { auto_after: None } => Some(Completion::Advance),
            Wait::Advance { .. } if self.fast => Some(Completion::Advance),
            Wait::Advance { .. } | Wait::None => None,
        }
    }

    async fn chosen(&mut self, option: &DecisionOption) {
        println!("> {}", option.label);
        println!();
    }

    async fn notice(&mut self, message: &str) {
        println!("  (server: {message})");
    }
}

/// Play a story to its end and return the session summary
pub async fn run_play(options: PlayOptions) -> anyhow::Result<SessionSummary> {
    let config = options.config.clone();
    config.validate()?;

    let generator: Arc<dyn NarrativeGenerator> = if options.procedural || options.graph.is_none() {
        Arc::new(ProceduralGenerator::new(PROCEDURAL_DEPTH))
    } else {
        Arc::new(ScriptedGenerator::new())
    };
    let repositories = match &options.data_dir {
        Some(dir) => Repositories::open(dir)
            .await
            .with_context(|| format!("Failed to open data directory '{}'", dir.display()))?,
        None => Repositories::in_memory(),
    };
    let service = Arc::new(StoryService::new(repositories, generator, config.stream.clone()));

    let (story_id, asset_root) = match &options.graph {
        Some(path) => {
            let (graph, report) = storage::read_graph(path)
                .await
                .with_context(|| format!("Failed to load '{}'", path.display()))?;
            info!(
                "Loaded '{}': {} events, {} decisions, {} pending",
                graph.story_id,
                report.event_count,
                report.decision_count,
                report.pending.len()
            );
            let root = path.parent().map(PathBuf::from).unwrap_or_default();
            if !reusable(&service, &graph.story_id).await? {
                service.import_story(graph.story(), graph.events.clone()).await?;
            }
            (graph.story_id, root)
        }
        None => {
            let story_id = procedural_id(&options.title);
            if !reusable(&service, &story_id).await? {
                let story =
                    Story::new(story_id.clone(), &options.title, StoryKind::Interactive, options.viewer.clone());
                service.create_story(story).await?;
                wait_until_ready(&service, &story_id).await?;
            }
            (story_id, PathBuf::from("."))
        }
    };

    let saved = match service.get_progress(&options.viewer, &story_id).await {
        Ok(progress) => Some(progress),
        Err(ApiError::NotFound(_)) => None,
        Err(e) => return Err(e.into()),
    };

    let sink: Arc<dyn ProgressSink> = service.clone();
    let mut progress = ProgressSynchronizer::new(sink, story_id.clone(), options.viewer.clone(), &config.progress);
    if let Some(saved) = &saved {
        println!("(resuming at {})", saved.current_seq_id);
        progress = progress
            .with_play_time(saved.play_time_secs)
            .with_version(saved.version_id.clone());
    }

    let source = Arc::new(LocalEventSource::new(service.clone(), story_id.clone(), options.viewer.clone()));
    let fetcher = RoutingFetcher::new(
        Arc::new(FileSystemFetcher::new(asset_root)),
        Arc::new(HttpFetcher::new(config.prefetch.request_timeout())?),
    );
    let prefetcher = Arc::new(ResourcePrefetcher::new(Arc::new(fetcher), config.prefetch.clone()));
    let mut playback = config.playback.clone();
    if options.fast {
        playback.auto_advance_delay_ms = 0;
        playback.choice_timeout_ms = Some(0);
    }
    let renderer = ConsoleRenderer::new(options.choices.clone(), options.fast);

    let mut session = PlaybackSession::new(
        source,
        PlaybackScheduler::new(playback, None),
        prefetcher,
        progress,
        renderer,
    );
    if let Some(saved) = saved {
        session = session.resume_from(saved.current_seq_id);
    }
    let (summary, renderer) = session.run().await?;

    if let Some(path) = &options.save_graph {
        let graph = storage::snapshot(&service, &story_id).await?;
        storage::write_graph(path, &graph)
            .await
            .with_context(|| format!("Failed to write '{}'", path.display()))?;
        info!("Saved {} events to '{}'", graph.events.len(), path.display());
    }

    println!();
    println!(
        "Played {} events ({} lines), {} choices, {} reconnects",
        summary.played,
        renderer.lines(),
        summary.choices.len(),
        summary.reconnects
    );
    Ok(summary)
}

/// Whether a story kept by an earlier run can be played as stored.
/// Stories left half-prepared or failed are dropped so they can be rebuilt.
pub(crate) async fn reusable(service: &StoryService, story_id: &StoryId) -> anyhow::Result<bool> {
    match service.status(story_id).await {
        Ok(report) if report.is_streamable() => {
            info!("Continuing stored story '{story_id}'");
            Ok(true)
        }
        Ok(report) => {
            warn!("Discarding story '{story_id}' left {:?}", report.status);
            service.remove_story(story_id).await?;
            Ok(false)
        }
        Err(ApiError::NotFound(_)) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn procedural_id(title: &str) -> StoryId {
    let digest = format!("{:x}", md5::compute(title.as_bytes()));
    StoryId::from(format!("story-{}", &digest[..12]))
}

/// Poll the story status until it can be streamed
async fn wait_until_ready(service: &StoryService, story_id: &StoryId) -> anyhow::Result<()> {
    loop {
        let report = service.status(story_id).await?;
        if report.is_streamable() {
            return Ok(());
        }
        match report.retry_after_secs {
            Some(secs) => {
                info!("Story is {:?} ({:.0}%)", report.status, report.progress * 100.0);
                tokio::time::sleep(Duration::from_secs(secs).min(STATUS_POLL)).await;
            }
            None => bail!(
                "Story '{}' cannot be played: {}",
                story_id,
                report.message.unwrap_or_else(|| format!("{:?}", report.status))
            ),
        }
    }
}
