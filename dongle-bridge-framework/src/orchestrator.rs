//! Startup sequencing and data-path wiring.

use std::sync::Arc;

use tracing::{Instrument, Span};

use dongle_common::{Clock, ConfigMap, Identity, SystemClock};

use crate::driver::{Driver, DriverFactory, Subscription};
use crate::error::{BridgeError, Result};
use crate::middleware::{ConnectOverrides, Middleware};
use crate::pipeline::{DataPath, PipelineStats};

/// Owns the dongle identity and configuration and brings the bridge up.
///
/// Startup order is fixed:
/// 1. [`start_middleware`](Self::start_middleware): `init` then `connect`
/// 2. [`start_driver`](Self::start_driver): create the driver, `subscribe`,
///    then `add_device`
///
/// The device is announced after the subscription is opened, so the first
/// readings may be published before the registration lands.
pub struct BridgeOrchestrator {
    identity: Identity,
    options: ConfigMap,
    middleware: Arc<dyn Middleware>,
    drivers: Box<dyn DriverFactory>,
    clock: Arc<dyn Clock>,
    span: Span,
    middleware_started: bool,
    driver: Option<Box<dyn Driver>>,
    subscription: Option<Subscription>,
    data_path: Option<Arc<DataPath>>,
}

impl BridgeOrchestrator {
    /// Create an orchestrator. Nothing is started until the `start_*` calls.
    pub fn new(
        identity: Identity,
        options: ConfigMap,
        middleware: Arc<dyn Middleware>,
        drivers: Box<dyn DriverFactory>,
    ) -> Self {
        let span = tracing::info_span!(
            "dongle",
            dongle = %identity.dongle_id,
            device = %identity.device.device_id
        );
        Self {
            identity,
            options,
            middleware,
            drivers,
            clock: Arc::new(SystemClock),
            span,
            middleware_started: false,
            driver: None,
            subscription: None,
            data_path: None,
        }
    }

    /// Use a different clock for envelope timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Log under the given span instead of the default `dongle` span.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn options(&self) -> &ConfigMap {
        &self.options
    }

    /// Shared handle to the middleware.
    pub fn middleware(&self) -> Arc<dyn Middleware> {
        self.middleware.clone()
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// The active driver subscription, once started.
    pub fn subscription(&self) -> Option<&Subscription> {
        self.subscription.as_ref()
    }

    /// Data-path counters, once the driver is started.
    pub fn pipeline_stats(&self) -> Option<&PipelineStats> {
        self.data_path.as_deref().map(DataPath::stats)
    }

    /// Initialize the middleware with the options and connect it.
    pub async fn start_middleware(&mut self) -> Result<()> {
        let span = self.span.clone();
        async {
            tracing::info!("Starting middleware");
            self.middleware.init(&self.options)?;
            self.middleware.connect(ConnectOverrides::default()).await?;
            tracing::info!("Middleware connected");
            Ok::<_, BridgeError>(())
        }
        .instrument(span)
        .await?;

        self.middleware_started = true;
        Ok(())
    }

    /// Open the driver on `endpoint`, wire the data path and announce the device.
    ///
    /// Fails if [`start_middleware`](Self::start_middleware) has not succeeded.
    pub async fn start_driver(&mut self, endpoint: &str) -> Result<()> {
        if !self.middleware_started {
            return Err(BridgeError::driver(
                "middleware must be connected before the driver starts",
            ));
        }

        let span = self.span.clone();
        {
            let _entered = span.enter();
            tracing::info!(endpoint = %endpoint, "Starting driver");

            let mut driver = self.drivers.create(endpoint).map_err(as_driver_error)?;

            let data_path = Arc::new(DataPath::new(
                self.identity.device.device_id.clone(),
                self.middleware.clone(),
                self.clock.clone(),
                tracing::debug_span!(parent: &span, "data_path"),
            ));

            let subscription = driver
                .subscribe(None, data_path.clone())
                .map_err(as_driver_error)?;
            self.driver = Some(driver);
            self.subscription = Some(subscription);
            self.data_path = Some(data_path);
        }

        self.middleware
            .add_device(&self.identity.device)
            .instrument(span.clone())
            .await
            .map_err(|e| match e {
                BridgeError::Registration(_) => e,
                other => BridgeError::Registration(other.to_string()),
            })?;

        span.in_scope(|| tracing::info!("Device registered"));
        Ok(())
    }

    /// Run both startup steps using the configured `device_port`.
    pub async fn start(&mut self) -> Result<()> {
        let endpoint = self.options.device_port()?.to_string();
        self.start_middleware().await?;
        self.start_driver(&endpoint).await
    }

    /// Stop delivery from the driver.
    pub fn stop_driver(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.cancel();
            self.driver = None;
            self.span.in_scope(|| tracing::info!("Driver subscription cancelled"));
        }
    }
}

fn as_driver_error(e: BridgeError) -> BridgeError {
    match e {
        BridgeError::DriverStartup(_) => e,
        other => BridgeError::driver(other.to_string()),
    }
}
