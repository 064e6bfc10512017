//! # Storyloom
//!
//! A workflow state machine and resilient synchronization engine for
//! staged story generation pipelines.
//!
//! Storyloom drives a long-running generation pipeline (concept → outline
//! → characters → scenes → storyboard → artifact) produced by a slow,
//! unreliable remote service. It provides:
//!
//! - **Pure stage transitions**: all session mutation flows through a
//!   total, synchronous state machine that rejects illegal events instead
//!   of corrupting state
//! - **Resilient observation**: redundant polling and realtime push paths,
//!   with duplicate terminal reports collapsing into no-ops
//! - **Snapshot resumption**: an in-progress session is reconstructed from
//!   an opaque remote snapshot through a total classification table
//! - **Bounded recovery**: transient failures retry with capped backoff;
//!   exhausting the budget surfaces a failed stage awaiting explicit retry
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use storyloom::prelude::*;
//! use std::sync::Arc;
//!
//! let backend: Arc<dyn GenerationBackend> = Arc::new(MyBackend::connect()?);
//! let coordinator = WorkflowCoordinator::new(backend, EngineConfig::default());
//!
//! let state = coordinator.start_new_session(serde_json::json!("a sunset scene")).await?;
//! let mut updates = coordinator.subscribe_state();
//! // ... render on change, confirm stages as they become ready:
//! coordinator.confirm_stage(PipelineStage::Outline).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod coordinator;
pub mod core;
pub mod errors;
pub mod machine;
pub mod observability;
pub mod polling;
pub mod realtime;
pub mod resume;
pub mod retry;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::coordinator::{GenerationBackend, WorkflowCoordinator};
    pub use crate::core::{
        ConnectionPhase, ConnectionState, ErrorInfo, PipelineStage, SessionState,
        StagePayload, StageStatus,
    };
    pub use crate::errors::{ErrorClass, SyncError};
    pub use crate::machine::{transition, StageEvent, Transition, TransitionEffect};
    pub use crate::polling::{PollConfig, PollingScheduler, StatusSource, WatchHandle};
    pub use crate::realtime::{
        ChannelConfig, ChannelHandle, ChannelMessage, MessageConnection, MessageTransport,
        RealtimeChannel,
    };
    pub use crate::resume::{classify_token, resolve, RemoteSnapshot, Resolution, TokenClass};
    pub use crate::retry::{
        reconnect_delay, BackoffStrategy, JitterStrategy, RetryConfig, RetryDecision,
        RetryState,
    };
    pub use crate::utils::{generate_session_id, iso_timestamp, Timestamp};
}
