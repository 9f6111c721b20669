//! Utilities shared by the workspace's tests.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use observability_deps::tracing;
use std::sync::Once;

static LOG_SETUP: Once = Once::new();

/// Enables tracing output in tests when `RUST_LOG` is set.
///
/// Safe to call from every test; initialization happens once per process.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Enables tracing output for tests unconditionally.
pub fn start_logging() {
    // ensure the global subscriber is only registered once
    LOG_SETUP.call_once(|| {
        let _ = tracing_log::LogTracer::init();
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
