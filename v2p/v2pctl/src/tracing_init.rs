// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::anyhow;
use anyhow::Context as _;
use std::io::IsTerminal;

/// Enables tracing output to stderr, filtered by `V2P_LOG`.
pub fn enable_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = if let Ok(filter) = std::env::var("V2P_LOG") {
        tracing_subscriber::EnvFilter::try_new(filter).context("invalid V2P_LOG")?
    } else {
        tracing_subscriber::EnvFilter::default()
            .add_directive(tracing::metadata::LevelFilter::INFO.into())
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_ansi(std::io::stderr().is_terminal())
        .log_internal_errors(true)
        .with_writer(std::io::stderr);

    tracing_subscriber::Registry::default()
        .with(fmt_layer)
        .with(filter)
        .try_init()
        .map_err(|e| anyhow!(e).context("failed to enable tracing"))?;

    Ok(())
}
