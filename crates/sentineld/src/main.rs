use anyhow::{Context, Result};
use sentinel_core::{EnrollmentError, EnrollmentStore, MotionDebouncer, OnnxRecognizer};
use sentinel_hw::{BuzzerLine, Camera, GpioBuzzer, PirSensor, PwmBuzzer, SysfsGpio};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

mod actuator;
mod config;
mod dbus_interface;
mod engine;
mod monitor;
mod workers;

use actuator::AlertActuator;
use config::{Config, ConfigError};
use engine::{DecisionEngine, EngineStatus};
use monitor::MotionMonitor;

const ACTUATOR_QUEUE: usize = 8;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "sentineld starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        camera = %config.camera_device,
        pir_gpio = config.pir_gpio,
        buzzer_gpio = config.buzzer_gpio,
        threshold = config.authorization_threshold,
        metric = ?config.distance_metric,
        "configuration loaded"
    );

    let store = Arc::new(open_enrollment(&config)?);
    tracing::info!(identities = store.snapshot().len(), "enrollment store loaded");

    let mut recognizer = OnnxRecognizer::load(&config.model_dir, config.detection_confidence_floor)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
    if config.embedding_dim > 0 {
        recognizer = recognizer.with_embedding_dim(config.embedding_dim);
    }

    let capture = workers::spawn_capture_worker(Box::new(Camera::new(config.camera_settings())))
        .context("spawning capture worker")?;
    let inference = workers::spawn_inference_worker(Box::new(recognizer))
        .context("spawning inference worker")?;

    let pir = SysfsGpio::input(config.pir_gpio).context("exporting PIR GPIO")?;
    let buzzer: Box<dyn BuzzerLine> = match &config.buzzer_pwm {
        Some(pwm) => Box::new(
            PwmBuzzer::new(pwm.chip, pwm.channel, pwm.frequency_hz, pwm.duty)
                .context("configuring PWM buzzer")?,
        ),
        None => Box::new(GpioBuzzer::new(
            SysfsGpio::output(config.buzzer_gpio).context("exporting buzzer GPIO")?,
        )),
    };

    let (event_tx, event_rx) = mpsc::channel(config.motion_queue_capacity);
    let (command_tx, command_rx) = mpsc::channel(ACTUATOR_QUEUE);
    let (status_tx, status_rx) = watch::channel(EngineStatus::default());

    let actuator_task = tokio::spawn(actuator::run(
        AlertActuator::new(buzzer, config.alert_duration()),
        command_rx,
    ));

    let monitor = MotionMonitor::new(
        Box::new(PirSensor::new(pir, config.pir_active_low)),
        MotionDebouncer::new(config.motion_confirm(), config.motion_release()),
        config.sensor_poll(),
        config.sensor_backoff_max(),
        event_tx,
    );
    let monitor_task = tokio::spawn(monitor.run());

    let engine = DecisionEngine::new(
        config.engine_settings(),
        capture,
        inference,
        store.clone(),
        command_tx,
        status_tx,
    );
    let mut engine_task = tokio::spawn(engine.run(event_rx));

    if config.enrollment_reload_secs > 0 {
        tokio::spawn(watch_enrollment(
            store.clone(),
            Duration::from_secs(config.enrollment_reload_secs),
        ));
    }

    let service = dbus_interface::SentinelService::new(status_rx, store.clone());
    let _conn = match dbus_interface::serve(config.dbus, service).await {
        Ok(Some(conn)) => {
            tracing::info!(name = dbus_interface::BUS_NAME, "D-Bus interface registered");
            Some(conn)
        }
        Ok(None) => {
            tracing::info!("D-Bus interface disabled");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "D-Bus unavailable, continuing without status interface");
            None
        }
    };

    tracing::info!("sentineld ready");

    let engine_stopped = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("sentineld shutting down");
            false
        }
        _ = &mut engine_task => {
            tracing::error!("decision engine stopped unexpectedly");
            true
        }
    };

    // Dropping the engine closes the actuator channel; the actuator turns
    // the buzzer off on its way out.
    monitor_task.abort();
    if !engine_stopped {
        engine_task.abort();
        let _ = engine_task.await;
    }
    if tokio::time::timeout(Duration::from_secs(2), actuator_task).await.is_err() {
        tracing::warn!("actuator did not stop in time");
    }

    Ok(())
}

/// Open the enrollment store, holding it to the model's embedding size.
/// A file enrolled with another model is a configuration error.
fn open_enrollment(config: &Config) -> Result<EnrollmentStore> {
    let path = &config.enrollment_path;
    match EnrollmentStore::open_with_dim(path.clone(), config.expected_embedding_dim()) {
        Ok(store) => Ok(store),
        Err(e @ EnrollmentError::ModelDimensionMismatch { .. }) => Err(ConfigError::Invalid {
            field: "embedding_dim",
            reason: format!("{}: {e}", path.display()),
        }
        .into()),
        Err(e) => Err(e).with_context(|| format!("opening enrollment store {}", path.display())),
    }
}

/// Reload the enrollment store whenever its file changes.
async fn watch_enrollment(store: Arc<EnrollmentStore>, every: Duration) {
    let Some(path) = store.path().map(PathBuf::from) else {
        return;
    };
    let mtime = |p: &PathBuf| -> Option<SystemTime> { std::fs::metadata(p).and_then(|m| m.modified()).ok() };
    let mut last = mtime(&path);
    let mut interval = tokio::time::interval(every);
    interval.tick().await;

    loop {
        interval.tick().await;
        let current = mtime(&path);
        if current == last {
            continue;
        }
        last = current;
        match store.reload() {
            Ok(count) => tracing::info!(identities = count, "enrollment file changed, reloaded"),
            Err(e) => tracing::warn!(error = %e, "enrollment reload failed, keeping previous set"),
        }
    }
}
