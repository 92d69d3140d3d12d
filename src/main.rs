mod backend;
mod cli;
mod config;
mod error;
mod orchestrator;
mod planner;
mod pool;
mod queue;
mod state_machine;
mod store;
mod ui;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use console::Style;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use backend::{
    HttpRenderBackend, LocalArtifactStorage, PassthroughMutator, RenderBackend, SimulatedBackend,
    TemplateMutator, WorkflowMutator,
};
use cli::{Cli, Command, StreamSource};
use config::{InstanceConfig, PlanFile, RenderflowConfig};
use orchestrator::{CancelToken, Orchestrator};
use planner::{StreamRequest, plan};
use state_machine::{Category, JobId};
use store::{RunLease, StateStore};
use ui::RunProgress;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", Style::new().red().bold().apply_to("error:"));
            1
        }
    };
    std::process::exit(code);
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "renderflow=debug" } else { "renderflow=warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config = RenderflowConfig::load(cli.config.as_deref())?;
    if let Some(max_retries) = cli.max_retries {
        config.max_retries = max_retries;
    }
    if let Some(dir) = cli.state_dir {
        config.state_dir = dir;
    }

    match cli.command {
        Command::Run {
            source,
            run_id,
            dry_run,
            instances,
        } => {
            let requests = requests_from(&source, &config)?;
            if dry_run {
                ui::print_plan(&plan(&requests, config.retry_config())?);
                return Ok(0);
            }
            if !instances.is_empty() {
                config.instances = instances;
            }
            let run_id = run_id.unwrap_or_else(new_run_id);
            println!("run {run_id}");

            let orch = http_orchestrator(&config, cli.no_upload)?;
            let cancel = cancel_on_ctrl_c();
            let report = orch.start(&run_id, requests, &cancel).await?;
            ui::print_report(&report);
            Ok(report.status.exit_code())
        }
        Command::Resume {
            run_id,
            break_lease,
            instances,
        } => {
            if break_lease && !RunLease::break_stale(&config.state_dir, &run_id)? {
                warn!(run_id, "no lease to break");
            }
            if !instances.is_empty() {
                config.instances = instances;
            }

            let orch = http_orchestrator(&config, cli.no_upload)?;
            let cancel = cancel_on_ctrl_c();
            let report = orch.resume(&run_id, &cancel).await?;
            ui::print_report(&report);
            Ok(report.status.exit_code())
        }
        Command::Status { run_id } => {
            let store = StateStore::new(&config.state_dir);
            match run_id {
                Some(run_id) => ui::print_checkpoint(&store.load(&run_id)?),
                None => {
                    let states = store
                        .list()?
                        .iter()
                        .map(|id| store.load(id))
                        .collect::<Result<Vec<_>, _>>()?;
                    ui::print_runs(&states);
                }
            }
            Ok(0)
        }
        Command::Plan { source } => {
            let requests = requests_from(&source, &config)?;
            ui::print_plan(&plan(&requests, config.retry_config())?);
            Ok(0)
        }
        Command::Demo { units, latency_ms } => demo(config, units, latency_ms).await,
    }
}

/// Streams from `--plan` first, then `--stream` flags.
fn requests_from(source: &StreamSource, config: &RenderflowConfig) -> Result<Vec<StreamRequest>> {
    let chunk_size = source.chunk_size.unwrap_or(config.chunk_size);
    let mut requests = match &source.plan {
        Some(path) => PlanFile::load(path)?.into_requests(chunk_size),
        None => Vec::new(),
    };
    requests.extend(
        source
            .streams
            .iter()
            .map(|s| StreamRequest::new(s.name.clone(), s.units, s.chunk_size.unwrap_or(chunk_size))),
    );
    if requests.is_empty() {
        bail!("nothing to render: pass --plan FILE or --stream NAME:UNITS");
    }
    Ok(requests)
}

fn new_run_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", chrono::Utc::now().format("%Y%m%d-%H%M%S"), &suffix[..8])
}

fn cancel_on_ctrl_c() -> CancelToken {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancelling: waiting for in-flight jobs to finish");
            token.cancel();
        }
    });
    cancel
}

fn mutator(config: &RenderflowConfig) -> Result<Box<dyn WorkflowMutator>> {
    if config.workflows.is_empty() {
        Ok(Box::new(PassthroughMutator))
    } else {
        Ok(Box::new(TemplateMutator::load(&config.workflows)?))
    }
}

fn orchestrator<B: RenderBackend>(
    config: &RenderflowConfig,
    backend: B,
    mutator: Box<dyn WorkflowMutator>,
    no_upload: bool,
) -> Orchestrator<B> {
    let mut orch = Orchestrator::new(
        config.run_settings(),
        config.effective_instances(),
        Arc::new(backend),
        mutator,
        StateStore::new(&config.state_dir),
    )
    .with_progress(Box::new(RunProgress::new()));

    if let Some(dir) = &config.upload_dir
        && !no_upload
    {
        orch = orch.with_storage(Box::new(LocalArtifactStorage::new(
            config.artifact_root.clone(),
            dir.clone(),
        )));
    }
    orch
}

fn http_orchestrator(config: &RenderflowConfig, no_upload: bool) -> Result<Orchestrator<HttpRenderBackend>> {
    let backend = HttpRenderBackend::new(Duration::from_millis(config.poll_interval_ms))?;
    Ok(orchestrator(config, backend, mutator(config)?, no_upload))
}

/// Two streams on two simulated instances. One primary job fails once so
/// the retry path shows up, and one refinement is slow.
async fn demo(mut config: RenderflowConfig, units: u64, latency_ms: u64) -> Result<i32> {
    config.instances = vec![
        InstanceConfig {
            max_concurrent: 2,
            ..InstanceConfig::parse_override("sim-a=sim://a@primary,refinement").map_err(anyhow::Error::msg)?
        },
        InstanceConfig {
            fallback: true,
            ..InstanceConfig::parse_override("sim-b=sim://b@combine").map_err(anyhow::Error::msg)?
        },
    ];
    config.base_delay_ms = config.base_delay_ms.min(500);
    config.workflows = Default::default();
    config.upload_dir = None;
    if config.state_dir == PathBuf::from(".renderflow") {
        config.state_dir = std::env::temp_dir().join("renderflow-demo");
    }

    let requests = vec![
        StreamRequest::new("intro", units, 2),
        StreamRequest::new("outro", units, 2),
    ];
    let flaky = JobId::new("intro", Category::Primary, 2);
    let slow = JobId::new("outro", Category::Refinement, 1);
    let backend = SimulatedBackend::new(Duration::from_millis(latency_ms))
        .fail_job(flaky, 1)
        .slow_job(slow, Duration::from_millis(latency_ms * 4));

    let run_id = format!("demo-{}", new_run_id());
    info!(run_id, state_dir = %config.state_dir.display(), "starting demo run");
    ui::print_plan(&plan(&requests, config.retry_config())?);

    let orch = orchestrator(&config, backend, Box::new(PassthroughMutator), true);
    let cancel = cancel_on_ctrl_c();
    let report = orch.start(&run_id, requests, &cancel).await?;
    ui::print_report(&report);
    Ok(report.status.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::StreamArg;

    fn source(streams: Vec<StreamArg>, chunk_size: Option<u64>) -> StreamSource {
        StreamSource {
            plan: None,
            streams,
            chunk_size,
        }
    }

    #[test]
    fn stream_flags_use_chunk_fallbacks() {
        let config = RenderflowConfig::default();
        let streams = vec![
            StreamArg {
                name: "a".into(),
                units: 10,
                chunk_size: None,
            },
            StreamArg {
                name: "b".into(),
                units: 10,
                chunk_size: Some(4),
            },
        ];
        let requests = requests_from(&source(streams.clone(), None), &config).unwrap();
        assert_eq!(requests[0], StreamRequest::new("a", 10, 161));
        assert_eq!(requests[1], StreamRequest::new("b", 10, 4));

        let requests = requests_from(&source(streams, Some(5)), &config).unwrap();
        assert_eq!(requests[0].chunk_size, 5);
    }

    #[test]
    fn empty_source_is_rejected() {
        assert!(requests_from(&source(Vec::new(), None), &RenderflowConfig::default()).is_err());
    }

    #[test]
    fn generated_run_ids_are_valid_and_distinct() {
        let a = new_run_id();
        let b = new_run_id();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }
}
