//! CLI entry point for storyweave
//!
//! Validates story graph files, plays stories in the terminal and serves
//! them over HTTP.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use storyweave::cli::play::{PlayOptions, run_play};
use storyweave::cli::serve::{ServeOptions, run_serve};
use storyweave::config::AppConfig;
use storyweave::domain::value_objects::{OptionId, ViewerId};
use storyweave::storage;

#[derive(Parser, Debug)]
#[command(name = "storyweave")]
#[command(about = "Branching story streaming engine")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a story graph file and summarize it
    Validate {
        graph: PathBuf,
    },
    /// Play a story in the terminal
    Play {
        /// Graph file; omit to generate a story procedurally
        graph: Option<PathBuf>,

        #[arg(long, default_value = "viewer")]
        viewer: String,

        /// JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Generate branches the graph does not contain
        #[arg(long)]
        procedural: bool,

        /// Title of a generated story
        #[arg(long, default_value = "Untitled")]
        title: String,

        /// Do not wait between lines
        #[arg(long)]
        fast: bool,

        /// Comma-separated option ids to pick at successive decisions
        #[arg(long, value_delimiter = ',')]
        choose: Vec<String>,

        /// Keep stories and viewer progress in this directory and resume from it
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Write the materialized graph here afterwards
        #[arg(long)]
        save_graph: Option<PathBuf>,
    },
    /// Serve stories over HTTP
    Serve {
        /// Graph files to register at startup
        graphs: Vec<PathBuf>,

        /// JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Address to listen on, overriding the configuration
        #[arg(long)]
        bind: Option<String>,

        /// Keep stories, versions and progress in this directory
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Generate missing branches procedurally
        #[arg(long)]
        procedural: bool,
    },
}

fn init_logging() {
    let default_filter = if std::env::var_os("STORYWEAVE_DEBUG").is_some() {
        "debug"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<AppConfig> {
    let mut config = match path {
        Some(path) => AppConfig::load(path).with_context(|| format!("Failed to read config '{}'", path.display()))?,
        None => AppConfig::default(),
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

async fn validate(graph: PathBuf) -> anyhow::Result<()> {
    let (story, report) = storage::read_graph(&graph)
        .await
        .with_context(|| format!("'{}' is not a valid story graph", graph.display()))?;
    println!("{} ({:?}): {}", story.story_id, story.kind, story.title);
    println!("  start:     {}", report.start);
    println!("  events:    {}", report.event_count);
    println!("  decisions: {}", report.decision_count);
    println!("  endings:   {}", report.terminal_count);
    println!("  depth:     {}", report.max_depth);
    if !report.pending.is_empty() {
        println!("  generated on demand:");
        for pending in &report.pending {
            println!("    {} -> {} [{}]", pending.owner, pending.target, pending.branch_tag);
        }
    }
    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    match args.command {
        Command::Validate { graph } => validate(graph).await,
        Command::Play {
            graph,
            viewer,
            config,
            procedural,
            title,
            fast,
            choose,
            data_dir,
            save_graph,
        } => {
            let options = PlayOptions {
                graph,
                title,
                viewer: ViewerId::from(viewer),
                config: load_config(config.as_ref())?,
                procedural,
                fast,
                choices: choose.into_iter().map(OptionId::from).collect(),
                data_dir,
                save_graph,
            };
            run_play(options).await.map(|_| ())
        }
        Command::Serve {
            graphs,
            config,
            bind,
            data_dir,
            procedural,
        } => {
            let mut config = load_config(config.as_ref())?;
            if let Some(bind) = bind {
                config.server.bind_address = bind;
            }
            if data_dir.is_some() {
                config.server.data_dir = data_dir;
            }
            run_serve(ServeOptions {
                config,
                graphs,
                procedural,
            })
            .await
        }
    }
}

#[tokio::main]
async fn main() {
    init_logging();
    let args = Args::parse();

    if let Err(err) = run(args).await {
        eprintln!("Error: {err:#}");
        process::exit(1);
    }
}
