//! Logging initialisation.
//!
//! Stdout belongs to the protocol; all human-readable output goes to
//! stderr, filtered by `RUST_LOG` and scrubbed through the redaction
//! registry so secret values never reach the terminal.

use std::sync::Once;

use pywatt_secrets::redact::RedactingStderr;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs the stderr subscriber with secret redaction.
///
/// The first call in a module's `main`; later calls are no-ops, so
/// library code may call it without coordinating.
pub fn init_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(RedactingStderr::new)
            .with_ansi(false)
            .try_init();
    });
}
