//! Convoy lane worker
//!
//! Speaks the lane protocol on stdio: announces `{"ready":true}`, reads one
//! run command, executes that path and writes one JSON event per line. Logs
//! go to stderr. Exiting ends the event stream.

use anyhow::Context as _;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::mpsc;
use tracing::info;

use convoy_common::{LaneCommand, WorkerMessage};
use convoy_lanes::manifest::{FileManifestLoader, ManifestLoader};
use convoy_lanes::{LaneWorker, WorkerConfig};

async fn write_line<T: Serialize>(stdout: &mut Stdout, message: &T) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    stdout.write_all(line.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    convoy_lanes::init_logging(false);

    let mut stdout = tokio::io::stdout();
    write_line(&mut stdout, &WorkerMessage::ready()).await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let line = stdin
        .next_line()
        .await?
        .context("stdin closed before a run command arrived")?;
    let LaneCommand::Run {
        manifest_url,
        path,
        test_run_id,
    } = serde_json::from_str(&line).context("invalid run command")?;

    info!(%test_run_id, ?path, "Running lane from {}", manifest_url);
    let tree = FileManifestLoader.load(&manifest_url).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            write_line(&mut stdout, &WorkerMessage::Event(event)).await?;
        }
        Ok::<_, anyhow::Error>(())
    });

    let worker = LaneWorker::new(WorkerConfig::from_env(), tx);
    worker.run(&tree, &path).await;
    drop(worker);

    writer.await??;
    info!(%test_run_id, ?path, "Lane complete");
    Ok(())
}
