//! Logging setup and pipeline step reporting.

use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;
use crate::error::Result;
use crate::event::{events, EventEmitter, MirrorEvent};

/// Status symbol logged when a step completes.
pub const STEP_OK: &str = "✅";

/// Status symbol logged when a step fails.
pub const STEP_FAILED: &str = "❌";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `level`. Calling this twice is harmless.
pub fn init_tracing(level: LogLevel) {
    let default = tracing::Level::from(level).to_string().to_lowercase();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .try_init();
}

/// A named pipeline phase.
///
/// Emits `step.started` on creation and a ✅/❌ line plus the matching event
/// when [`Step::finish`] sees the phase result.
pub struct Step<'a> {
    name: String,
    events: &'a EventEmitter,
}

impl<'a> Step<'a> {
    pub fn start(name: impl Into<String>, emitter: &'a EventEmitter) -> Self {
        let name = name.into();
        tracing::info!(step = %name, "Starting");
        emitter.emit(MirrorEvent::with_string(events::STEP_STARTED, name.clone()));
        Self {
            name,
            events: emitter,
        }
    }

    /// Report the outcome of the phase and hand the result back.
    pub fn finish<T>(self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => {
                tracing::info!("{} {}", STEP_OK, self.name);
                self.events
                    .emit(MirrorEvent::with_string(events::STEP_COMPLETED, self.name));
            }
            Err(e) => {
                tracing::error!(error = %e, "{} {}", STEP_FAILED, self.name);
                self.events.emit(MirrorEvent::with_fields(
                    events::STEP_FAILED,
                    [
                        ("step", serde_json::json!(self.name)),
                        ("error", serde_json::json!(e.to_string())),
                    ],
                ));
            }
        }
        result
    }
}
