use crate::config::Config;
use crate::controls::DeviceControls;
use crate::error::ControlError;
use crate::media::Relay;
use crate::messages::{ACTION_TOPIC, Action, Inbound, SETTINGS_TOPIC, Setting};
use crate::services::Controller;
use crate::status::{self, StatusPublisher};

use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

/// How long the startup device query may take
const DEVICE_RESET_TIMEOUT: Duration = Duration::from_secs(2);
/// Pause between the device query and opening the device for the relay
const DEVICE_SETTLE: Duration = Duration::from_millis(500);

pub struct App {
    controller: Controller,
    controls: DeviceControls,
    publisher: Arc<dyn StatusPublisher>,
    relay: Relay,
    inbound_rx: mpsc::Receiver<Inbound>,
    handlers: TaskTracker,
}

impl App {
    /// Bring the device up: query it once, start the relay, then accept commands.
    pub async fn new(
        config: Config,
        publisher: Arc<dyn StatusPublisher>,
        inbound_rx: mpsc::Receiver<Inbound>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.captures_dir).with_context(|| {
            format!("Failed to create captures directory {:?}", config.captures_dir)
        })?;

        let controls = DeviceControls::new(
            config.v4l2_ctl_path.clone(),
            config.device.clone(),
            config.control_timeout(),
        );
        controls.reset(DEVICE_RESET_TIMEOUT).await;
        tokio::time::sleep(DEVICE_SETTLE).await;

        let relay = Relay::start(&config.ffmpeg_path, &config.relay_params())
            .with_context(|| format!("Failed to start live relay for {}", config.device))?;

        let controller = Controller::new(&config, publisher.clone());
        let mut states = controller.subscribe();
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                tracing::info!("Device state: {:?}", state);
            }
        });
        controller.mark_streaming();

        tracing::info!(
            "Ready! Streaming {} to {}; listening on {} and {}",
            config.device,
            config.stream_url,
            ACTION_TOPIC,
            SETTINGS_TOPIC
        );

        Ok(Self {
            controller,
            controls,
            publisher,
            relay,
            inbound_rx,
            handlers: TaskTracker::new(),
        })
    }

    /// Serve until SIGINT or SIGTERM
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        let mut input_open = true;

        loop {
            tracing::debug!("Main loop: waiting for message");
            tokio::select! {
                message = self.inbound_rx.recv(), if input_open => match message {
                    Some(message) => {
                        // One task per message so a long capture never blocks a stop
                        self.handlers.spawn(handle_message(
                            message,
                            self.controller.clone(),
                            self.controls.clone(),
                            self.publisher.clone(),
                        ));
                    }
                    None => {
                        tracing::info!("No more control messages, running until interrupted");
                        input_open = false;
                    }
                },
                _ = &mut shutdown => break,
            }
        }

        tracing::info!("Shutting down");
        self.handlers.close();
        self.handlers.wait().await;
        self.controller.shutdown().await;

        if !self.relay.is_running() {
            tracing::warn!("Relay had already exited before shutdown");
        }
        self.relay.shutdown().await;

        tracing::info!("camctl shutdown complete");
        Ok(())
    }
}

async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT, shutting down...");
        }
        _ = terminate() => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

/// Route one inbound message by topic. Every reply goes out as a status.
async fn handle_message(
    message: Inbound,
    controller: Controller,
    controls: DeviceControls,
    publisher: Arc<dyn StatusPublisher>,
) {
    match message.topic.as_str() {
        SETTINGS_TOPIC => match Setting::parse(&message.payload) {
            Ok(setting) => {
                let reply = controls.apply(&setting).await;
                publisher.publish(&reply).await;
            }
            Err(e) => publisher.publish(&status::error(e.to_string())).await,
        },
        ACTION_TOPIC => match Action::parse(&message.payload) {
            Ok(Some(action)) => run_action(action, &controller).await,
            Ok(None) => tracing::debug!("Ignoring empty action"),
            Err(e) => publisher.publish(&status::error(e.to_string())).await,
        },
        topic => tracing::debug!("Ignoring message on unknown topic {}", topic),
    }
}

async fn run_action(action: Action, controller: &Controller) {
    tracing::debug!("Running {:?} in state {:?}", action, controller.state());

    let result = match action {
        Action::Picture => controller
            .capture_picture()
            .await
            .map(|path| tracing::debug!("Picture at {:?}", path)),
        Action::Record { duration } => controller
            .start_recording(duration)
            .await
            .map(|path| tracing::debug!("Recording into {:?}", path)),
        Action::Stop => controller.stop_recording().await,
    };

    // The controller has already published the outcome
    match result {
        Ok(()) => {}
        Err(ControlError::RejectedByState { state, reason }) => {
            tracing::debug!(?state, "Rejected: {}", reason)
        }
        Err(e) => tracing::warn!("Action failed: {}", e),
    }
}
