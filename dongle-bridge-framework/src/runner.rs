//! Process driver: configuration, startup, park, teardown.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tracing::Instrument;

use dongle_common::{ConfigLoader, ConfigMap, Identity, init_tracing};

use crate::BridgeArgs;
use crate::driver::DriverFactory;
use crate::error::Result;
use crate::middleware::Middleware;
use crate::mqtt::MqttMiddleware;
use crate::orchestrator::BridgeOrchestrator;
use crate::shutdown::{ShutdownCoordinator, TerminationSignal};

/// Exit status reported for any startup failure.
pub const FAILURE_EXIT_CODE: u8 = 255;

/// Static description of a bridge binary.
#[derive(Debug, Clone, Copy)]
pub struct BridgeInfo {
    /// Bridge name for logging.
    pub name: &'static str,
    /// Configuration file looked up in the working directory.
    pub config_file: &'static str,
    /// Configuration compiled into the binary, used when no file is found.
    pub bundled_config: Option<&'static str>,
    /// Device type used when `device_type` is not configured.
    pub default_device_type: Option<&'static str>,
}

impl BridgeInfo {
    fn loader(&self) -> ConfigLoader {
        let loader = ConfigLoader::new(self.config_file);
        match self.bundled_config {
            Some(content) => loader.with_bundled_default(content),
            None => loader,
        }
    }
}

/// Run a bridge to completion and map the outcome to an exit status.
///
/// `drivers` builds the driver factory from the loaded options.
///
/// # Example
///
/// ```ignore
/// #[tokio::main]
/// async fn main() -> ExitCode {
///     run_bridge(MY_BRIDGE, |options| Ok(Box::new(MyDriverFactory::from_options(options)?))).await
/// }
/// ```
pub async fn run_bridge<F>(bridge: BridgeInfo, drivers: F) -> ExitCode
where
    F: FnOnce(&ConfigMap) -> Result<Box<dyn DriverFactory>>,
{
    let args = BridgeArgs::parse();

    if let Err(e) = init_tracing(&args.logging()) {
        eprintln!("{}", e);
    }

    match launch(bridge, &args, drivers).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(bridge = bridge.name, error = %format!("{:#}", e), "Bridge failed");
            ExitCode::from(FAILURE_EXIT_CODE)
        }
    }
}

/// Load configuration, start the bridge and block until a termination signal.
///
/// Returns an error for any startup failure. The middleware is released on
/// every path once it has connected.
pub async fn launch<F>(bridge: BridgeInfo, args: &BridgeArgs, drivers: F) -> anyhow::Result<()>
where
    F: FnOnce(&ConfigMap) -> Result<Box<dyn DriverFactory>>,
{
    launch_with(
        bridge,
        args,
        |identity: &Identity| -> Arc<dyn Middleware> {
            Arc::new(MqttMiddleware::new(identity.dongle_id.clone()))
        },
        drivers,
    )
    .await
}

/// [`launch`] with the middleware built by `middleware` instead of MQTT.
pub async fn launch_with<M, F>(
    bridge: BridgeInfo,
    args: &BridgeArgs,
    middleware: M,
    drivers: F,
) -> anyhow::Result<()>
where
    M: FnOnce(&Identity) -> Arc<dyn Middleware>,
    F: FnOnce(&ConfigMap) -> Result<Box<dyn DriverFactory>>,
{
    let span = tracing::info_span!("bridge", name = bridge.name);
    tracing::info!(
        parent: &span,
        version = env!("CARGO_PKG_VERSION"),
        "Starting bridge"
    );

    let loader = bridge.loader();
    let loaded = match &args.config {
        Some(path) => loader.load_file(path),
        None => {
            let cwd = std::env::current_dir().context("resolving the working directory")?;
            loader.load_from_dir(cwd)
        }
    }
    .context("loading configuration")?;

    let identity = Identity::from_options(&loaded.options, bridge.default_device_type)
        .context("resolving identity")?;
    let endpoint = loaded.options.device_port()?.to_string();
    let drivers = drivers(&loaded.options).context("configuring the driver")?;

    let middleware = middleware(&identity);
    let mut orchestrator =
        BridgeOrchestrator::new(identity, loaded.options, middleware.clone(), drivers);

    orchestrator
        .start_middleware()
        .await
        .context("starting middleware")?;

    let coordinator = ShutdownCoordinator::new(middleware)
        .with_span(tracing::info_span!(parent: orchestrator.span(), "shutdown"));

    // Listen before the driver starts so a request during startup still
    // releases the broker link.
    let mut signal = match TerminationSignal::install() {
        Ok(signal) => signal,
        Err(e) => {
            coordinator.shutdown().await;
            return Err(e).context("installing signal handlers");
        }
    };

    let started = tokio::select! {
        started = orchestrator.start_driver(&endpoint) => Some(started),
        _ = signal.recv() => None,
    };
    match started {
        Some(Ok(())) => {}
        Some(Err(e)) => {
            orchestrator.stop_driver();
            coordinator.shutdown().await;
            return Err(e).context("starting driver");
        }
        None => {
            tracing::info!(parent: &span, "Terminated during startup");
            orchestrator.stop_driver();
            coordinator.shutdown().await;
            return Ok(());
        }
    }

    let parked = orchestrator.span().clone();
    coordinator
        .scoped(
            async {
                tracing::info!("Bridge running; waiting for termination signal");
                signal.recv().await;
                orchestrator.stop_driver();
            }
            .instrument(parked),
        )
        .await;

    tracing::info!(parent: &span, "Goodbye!");
    Ok(())
}
