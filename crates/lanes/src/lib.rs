//! Convoy lane runtime
//!
//! Runs a test tree as a set of isolated lanes, one OS process per leaf path,
//! either locally or as an [`Agent`] serving runs from a convoy server:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  LaneScheduler (agent side)                                  │
//! │    ├── leaf_paths(tree) -> [path]                            │
//! │    ├── per path: spawn convoy-lane (own process group)       │
//! │    │     ├── <- {"ready":true}                               │
//! │    │     ├── -> {"type":"run", manifestUrl, path, testRunId} │
//! │    │     └── <- TestEvent* until exit                        │
//! │    └── publish RunEvent {testRunId, ...} into a Mailbox      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  LaneWorker (convoy-lane process)                            │
//! │    ├── load manifest                                         │
//! │    └── per node on path: steps (sequential, timeboxed)       │
//! │                          assertions (concurrent, timeboxed)  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod actions;
pub mod agent;
pub mod error;
pub mod manifest;
pub mod process;
pub mod scheduler;
pub mod summary;
pub mod worker;

pub use agent::Agent;
pub use error::{LaneError, LaneResult};
pub use manifest::{FileManifestLoader, ManifestLoader};
pub use scheduler::{LaneConfig, LaneScheduler};
pub use summary::RunSummary;
pub use worker::{LaneWorker, WorkerConfig};

/// Install the stderr log subscriber used by the lane binaries.
///
/// stdout is reserved for protocol output.
pub fn init_logging(debug: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
