//! Logger construction, split out of `main.rs` the way the teacher keeps
//! it in its own `log.rs`.

use tracing_error::ErrorLayer;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{Layer as _, layer::SubscriberExt as _};

/// Build (but don't install) the process's `tracing` subscriber.
///
/// Filtering reads `OPS2DEB_LOG` if set (standard `EnvFilter` syntax);
/// otherwise falls back to `debug` when `--verbose` was passed, `info`
/// otherwise.
pub fn make_logger(verbose: bool) -> impl tracing::Subscriber {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_env_var("OPS2DEB_LOG")
        .with_default_directive(default_filter.parse().expect("valid default directive"))
        .from_env_lossy();

    tracing_subscriber::registry().with(ErrorLayer::default()).with(
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_writer(std::io::stderr)
            .without_time()
            .with_filter(filter),
    )
}
