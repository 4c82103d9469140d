use clconform::{harness, result::Result};
use libtest_mimic::Arguments;
use tracing::Level;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_target(false)
        .init();
    let args = Arguments::from_args();
    let config = harness::Config::from_env()?;
    tracing::debug!(?config);
    #[cfg(feature = "device")]
    let trials = {
        use std::sync::Arc;

        let ctx = Arc::new(harness::TestContext::new(config)?);
        harness::host_trials()
            .into_iter()
            .chain(harness::device_trials(&ctx)?)
            .collect()
    };
    #[cfg(not(feature = "device"))]
    let trials = {
        tracing::warn!("built without the \"device\" feature, running host checks only");
        let _ = config;
        harness::host_trials()
    };
    libtest_mimic::run(&args, trials).exit()
}
