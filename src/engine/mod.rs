//! Engine orchestration and the UI-facing surface:
//! - [`ChatEngine`] over pluggable backends
//! - send phases, snapshots, and broadcast change notifications

pub mod chat;
pub mod updates;

pub use chat::{ChatBackends, ChatEngine};
pub use updates::{EngineSnapshot, EngineUpdate, SendPhase};

/// Install a `tracing` subscriber reading `RUST_LOG` with an `info` default.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .try_init();
}
