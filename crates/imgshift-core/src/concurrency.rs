use imgshift_registry::CancelToken;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Cancel `token` on the first Ctrl-C and exit on the second.
///
/// A cancelled token wakes any retry wait at once; the copy in flight is left
/// to finish or time out.
pub fn install_signal_handler(token: CancelToken) {
    let result = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        token.cancel();
        eprintln!("\ncancellation requested, stopping after the current request...");
    });
    if let Err(e) = result {
        warn!("failed to install Ctrl-C handler: {e}");
    }
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
