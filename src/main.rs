mod agents;
mod bus;
mod config;
mod core;
mod data;
mod lanes;
mod llm;
mod persistence;
mod pipeline;
mod ranking;
mod schema;
mod sources;

use anyhow::{Context, Result};
use bus::types::Bus;
use clap::{Parser, Subcommand, ValueEnum};
use config::config::AppCfg;
use core::types::{Actor, ConfidenceTier};
use data::DataAggregator;
use data::client::HttpDataAggregator;
use data::simulator::SimDataAggregator;
use lanes::report::{Lane, RunReport, RunStatus};
use llm::LlmClient;
use llm::client::OpenAiClient;
use llm::simulator::ScriptedLlm;
use persistence::Store;
use persistence::database::Database;
use persistence::memory::MemoryStore;
use pipeline::actor::{LaneActor, ReportActor};
use pipeline::orchestrator::{Collaborators, Pipeline, RunOptions};
use reqwest::Client;
use sources::IdeaSource;
use sources::screener::ScreenerSource;
use sources::simulator::StaticSource;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ideaflow", version, about = "Lane-based investment research orchestrator")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, global = true, default_value = "config.yml")]
    config: String,

    /// Use in-process simulators instead of network collaborators.
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every lane on its schedule until Ctrl-C.
    Serve,
    /// Run one lane (or all of them, in order) once and print the report.
    Run {
        lane: LaneArg,
        #[arg(long)]
        dry_run: bool,
        /// Lane B: promote past the daily target, up to the daily max.
        #[arg(long)]
        stretch: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LaneArg {
    Lane0,
    LaneA,
    LaneB,
    Bundle,
    All,
}

impl LaneArg {
    fn lane(self) -> Option<Lane> {
        match self {
            LaneArg::Lane0 => Some(Lane::Lane0),
            LaneArg::LaneA => Some(Lane::LaneA),
            LaneArg::LaneB => Some(Lane::LaneB),
            LaneArg::Bundle => Some(Lane::Bundle),
            LaneArg::All => None,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn http_client(cfg: &AppCfg) -> Result<Client> {
    Client::builder()
        .user_agent(cfg.http.user_agent.clone())
        .pool_idle_timeout(cfg.http.pool_idle_timeout)
        .pool_max_idle_per_host(cfg.http.pool_max_idle_per_host)
        .tcp_keepalive(cfg.http.tcp_keep_alive)
        .timeout(cfg.http.timeout)
        .build()
        .context("building http client")
}

async fn store(cfg: &AppCfg) -> Result<Arc<dyn Store>> {
    if cfg.database.url.is_empty() {
        info!("No database configured, using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    info!("Connecting to Postgres");
    let db = Database::new(&cfg.database.url, cfg.database.max_connections)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(db))
}

async fn collaborators(cfg: &AppCfg, simulate: bool) -> Result<Collaborators> {
    let store = store(cfg).await?;

    if simulate {
        info!("Simulation mode: scripted LLM, synthetic data, generated sources");
        let sources: Vec<Arc<dyn IdeaSource>> = vec![
            Arc::new(StaticSource::generated("sim-screener", "SC", 60, ConfidenceTier::High)),
            Arc::new(StaticSource::generated("sim-newsletter", "NL", 40, ConfidenceTier::Medium)),
            Arc::new(StaticSource::generated("sim-filings", "FL", 20, ConfidenceTier::Low)),
        ];
        let data: Arc<dyn DataAggregator> = Arc::new(SimDataAggregator::synthesizing());
        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlm::canned());
        return Ok(Collaborators {
            store,
            sources,
            data,
            llm,
        });
    }

    cfg.validate_live()?;
    let client = http_client(cfg)?;
    let sources = cfg
        .sources
        .iter()
        .map(|s| Arc::new(ScreenerSource::new(client.clone(), s.clone())) as Arc<dyn IdeaSource>)
        .collect();
    Ok(Collaborators {
        store,
        sources,
        data: Arc::new(HttpDataAggregator::new(client, cfg.data.clone())),
        llm: Arc::new(OpenAiClient::new(cfg.llm.clone())),
    })
}

async fn serve(pipeline: Arc<Pipeline>) -> Result<()> {
    let shutdown = CancellationToken::new();

    info!("Spawning actors");
    let mut actors = tokio::task::JoinSet::new();
    let reports = ReportActor::new(pipeline.bus().clone(), shutdown.clone());
    actors.spawn(reports.run().instrument(info_span!("Reports")));
    for lane in [Lane::Lane0, Lane::LaneA, Lane::LaneB, Lane::Bundle] {
        let actor = LaneActor::new(pipeline.clone(), lane, shutdown.clone());
        actors.spawn(actor.run().instrument(info_span!("Lane", lane = %lane)));
    }

    info!("Waiting for actors");
    tokio::select! {
        _ = async {
            while let Some(res) = actors.join_next().await {
                match res {
                    Ok(Ok(())) => info!("Actor exited cleanly"),
                    Ok(Err(e)) => error!(?e, "Actor returned error"),
                    Err(panic) => error!(?panic, "Actor panicked/cancelled"),
                }
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down supervisor loop");
            shutdown.cancel();
        }
    }

    info!("Waiting for graceful shutdown of actors");
    while let Some(res) = actors.join_next().await {
        match res {
            Ok(Ok(())) => info!("Actor exited cleanly"),
            Ok(Err(e)) => error!(?e, "Actor returned error"),
            Err(panic) => error!(?panic, "Actor panicked/cancelled"),
        }
    }
    Ok(())
}

async fn run_once(pipeline: &Pipeline, lane: LaneArg, opts: RunOptions) -> Result<Vec<RunReport>> {
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let reports = match lane.lane() {
        Some(lane) => vec![pipeline.run(lane, opts, &cancel).await],
        None => pipeline.run_all(opts, &cancel).await,
    };
    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(reports)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    let cfg = AppCfg::load(&cli.config)?;
    init_tracing(cfg.logging.json);

    // Root span for the supervisor/main thread
    let span = info_span!(
        "Supervisor",
        pid = %std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
    );

    async move {
        info!("Starting up");
        let bus = Bus::new();
        let c = collaborators(&cfg, cli.simulate).await?;
        let pipeline = Arc::new(Pipeline::build(&cfg, c, bus).await?);

        match cli.command {
            Command::Serve => serve(pipeline).await?,
            Command::Run {
                lane,
                dry_run,
                stretch,
            } => {
                let opts = RunOptions {
                    dry_run,
                    stretch,
                    ..RunOptions::now()
                };
                let reports = run_once(&pipeline, lane, opts).await?;
                if reports.iter().any(|r| r.status == RunStatus::Aborted) {
                    anyhow::bail!("lane run aborted");
                }
            }
        }

        info!("Supervisor exit");
        Ok(())
    }
    .instrument(span)
    .await
}
