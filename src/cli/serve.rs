//! HTTP server command

use crate::application::generation::{NarrativeGenerator, ProceduralGenerator, ScriptedGenerator};
use crate::application::service::{Repositories, StoryService};
use crate::cli::play::reusable;
use crate::config::AppConfig;
use crate::server;
use crate::storage;
use anyhow::Context;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

/// Decision depth of stories created over the API
const GENERATED_DEPTH: usize = 3;

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub config: AppConfig,
    /// Graph files registered before the listener opens
    pub graphs: Vec<PathBuf>,
    /// Generate branches procedurally instead of only serving stored ones
    pub procedural: bool,
}

/// Build the service described by `options` and load its graphs
pub async fn prepare_service(options: &ServeOptions) -> anyhow::Result<Arc<StoryService>> {
    let config = &options.config;
    config.validate()?;

    let generator: Arc<dyn NarrativeGenerator> = if options.procedural {
        Arc::new(ProceduralGenerator::new(GENERATED_DEPTH))
    } else {
        Arc::new(ScriptedGenerator::new())
    };
    let repositories = match &config.server.data_dir {
        Some(dir) => Repositories::open(dir)
            .await
            .with_context(|| format!("Failed to open data directory '{}'", dir.display()))?,
        None => Repositories::in_memory(),
    };
    let service = Arc::new(StoryService::new(repositories, generator, config.stream.clone()));

    for path in &options.graphs {
        let (graph, report) = storage::read_graph(path)
            .await
            .with_context(|| format!("Failed to load '{}'", path.display()))?;
        if reusable(&service, &graph.story_id).await? {
            continue;
        }
        service.import_story(graph.story(), graph.events).await?;
        info!("Serving '{}' ({} events)", graph.story_id, report.event_count);
    }
    Ok(service)
}

/// Serve until the listener fails
pub async fn run_serve(options: ServeOptions) -> anyhow::Result<()> {
    let service = prepare_service(&options).await?;
    let address = &options.config.server.bind_address;
    server::serve(service, address)
        .await
        .with_context(|| format!("Server on '{address}' stopped"))
}
