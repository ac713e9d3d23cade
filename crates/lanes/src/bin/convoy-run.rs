//! Convoy local runner
//!
//! Runs a manifest locally: loads it, runs every leaf path through the lane
//! scheduler and prints the event stream. With `--server` it instead
//! connects to convoyd as an agent and executes the runs it is sent.
//!
//! Exit codes: 0 when everything passed (or the server closed the agent
//! connection), 1 on test failures, 2 on errors.

use clap::Parser;
use futures::{future, SinkExt, StreamExt};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use convoy_common::{Mailbox, RunCommand, RunEvent, TestEvent};
use convoy_lanes::manifest::{FileManifestLoader, ManifestLoader};
use convoy_lanes::{Agent, LaneConfig, LaneScheduler, RunSummary};

#[derive(Parser, Debug)]
#[command(name = "convoy-run")]
#[command(about = "Run a Convoy manifest locally, one process per lane")]
#[command(version)]
struct Args {
    /// Manifest URL or path (YAML or JSON)
    #[arg(required_unless_present = "server")]
    manifest: Option<String>,

    /// Serve runs from a convoy server instead, e.g. ws://127.0.0.1:24001/agent
    #[arg(long, env = "CONVOY_SERVER", conflicts_with = "manifest")]
    server: Option<String>,

    /// Agent id to request from the server (assigned by the server if omitted)
    #[arg(long, requires = "server")]
    agent_id: Option<String>,

    /// Run id (random if omitted)
    #[arg(long)]
    test_run_id: Option<String>,

    /// Path to the convoy-lane worker binary
    #[arg(long, env = "CONVOY_LANE_BINARY")]
    worker: Option<PathBuf>,

    /// Step and assertion deadline in milliseconds
    #[arg(long)]
    step_timeout_ms: Option<u64>,

    /// Grace period between SIGTERM and SIGKILL when halting lanes
    #[arg(long, default_value = "2000")]
    kill_grace_ms: u64,

    /// Print events as JSON lines on stdout
    #[arg(long)]
    json: bool,

    /// Write the run summary to this file as JSON
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() {
    let args = Args::parse();
    convoy_lanes::init_logging(args.debug);

    let result = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt.block_on(async_main(args)),
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(true) => std::process::exit(0),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(2);
        }
    }
}

async fn async_main(args: Args) -> anyhow::Result<bool> {
    let mut config = LaneConfig {
        kill_grace: Duration::from_millis(args.kill_grace_ms),
        step_timeout: args.step_timeout_ms.map(Duration::from_millis),
        ..Default::default()
    };
    if let Some(worker) = args.worker.clone() {
        config.worker_binary = worker;
    }

    match (args.server.clone(), args.manifest.clone()) {
        (Some(server), _) => serve_agent(&server, args.agent_id, config).await,
        (None, Some(manifest)) => run_local(manifest, args, config).await,
        (None, None) => anyhow::bail!("either a manifest or --server is required"),
    }
}

/// Agent mode: execute runs sent by convoyd until it closes the connection.
async fn serve_agent(server: &str, agent_id: Option<String>, config: LaneConfig) -> anyhow::Result<bool> {
    let (socket, _) = tokio_tungstenite::connect_async(server).await?;
    info!("Connected to {}", server);

    let (write, read) = socket.split();
    let sink = write.with(|text: String| future::ready(Ok::<_, tungstenite::Error>(Message::Text(text))));
    let frames = read
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
        });

    let agent = Agent::new(config, agent_id);
    tokio::select! {
        result = agent.serve(frames, sink) => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted, disconnecting..."),
    }
    Ok(true)
}

async fn run_local(manifest: String, args: Args, config: LaneConfig) -> anyhow::Result<bool> {
    let tree = FileManifestLoader.load(&manifest).await?;
    let command = RunCommand {
        test_run_id: args
            .test_run_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        manifest_url: manifest,
        tree,
    };

    let events: Mailbox<RunEvent> = Mailbox::new();
    let scheduler = LaneScheduler::new(config, events.clone());
    let cancel = CancellationToken::new();

    let run = {
        let command = command.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(&command, cancel).await })
    };

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, halting lanes...");
            interrupt.cancel();
        }
    });

    let start = Instant::now();
    let mut summary = RunSummary::default();
    let test_run_id = command.test_run_id.clone();
    loop {
        let id = test_run_id.clone();
        let tagged = events.receive(move |e: &RunEvent| e.test_run_id == id).await;
        summary.record(&tagged.event);

        if args.json {
            println!("{}", serde_json::to_string(&tagged)?);
        } else {
            log_event(&tagged.event);
        }
        if tagged.event == TestEvent::RunEnd {
            break;
        }
    }
    run.await?;
    summary.duration_ms = start.elapsed().as_millis() as u64;

    info!("{}", summary);
    if let Some(path) = args.output {
        std::fs::write(&path, serde_json::to_string_pretty(&summary)?)?;
        info!("Summary written to: {}", path.display());
    }

    Ok(summary.success() && !cancel.is_cancelled())
}

fn log_event(event: &TestEvent) {
    match event {
        TestEvent::StepResult { path, description, error, timeout, .. } if event.is_failure() => {
            let reason = if *timeout { "timed out" } else { "failed" };
            error!(
                "✗ {} › {} {}: {}",
                path.join(" › "),
                description,
                reason,
                error.as_deref().unwrap_or("unknown error")
            );
        }
        TestEvent::AssertionResult { path, description, error, .. } if event.is_failure() => {
            error!(
                "✗ {} › {}: {}",
                path.join(" › "),
                description,
                error.as_deref().unwrap_or("unknown error")
            );
        }
        TestEvent::AssertionResult { path, description, .. } => {
            info!("✓ {} › {}", path.join(" › "), description);
        }
        TestEvent::LaneEnd { path, crashed: true, exit_code } => {
            error!("✗ lane {:?} crashed (exit code: {:?})", path, exit_code);
        }
        _ => {}
    }
}
