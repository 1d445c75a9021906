use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// `RUST_LOG` wins over `verbose` when set.
pub fn init_logging(verbose: bool) {
    let fallback = if verbose {
        "atn_client=debug,atn=debug,tower_http=debug"
    } else {
        "atn_client=info,atn=info"
    };

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into()))
        .with(tracing_subscriber::fmt::layer().with_target(verbose))
        .try_init();
}
