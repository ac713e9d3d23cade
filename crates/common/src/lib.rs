//! Convoy Common Library
//!
//! Building blocks shared by the agent server and the lane runtime:
//! - [`mailbox`]: pattern-matched, at-most-once message bus
//! - [`timebox`]: hard deadlines for asynchronous operations
//! - [`tree`]: the hierarchical test tree and leaf path enumeration
//! - [`protocol`]: agent and lane wire types

pub mod error;
pub mod mailbox;
pub mod protocol;
pub mod timebox;
pub mod tree;

// Re-export commonly used types
pub use error::{Error, Result};
pub use mailbox::{Mailbox, Matcher, Watch};
pub use protocol::{
    AgentFrame, LaneCommand, ResultStatus, RunCommand, RunEvent, ServerFrame, TestEvent,
    WorkerMessage,
};
pub use timebox::{timebox, TimeboxError, DEFAULT_DEADLINE};
pub use tree::{Assertion, Check, Context, Step, StepAction, TestNode};

/// Convoy version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
