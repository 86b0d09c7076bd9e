use anyhow::{Context, Result};
use clap::{Arg, Command, value_parser};
use log::{error, info, warn};
use markertrack::assets::ALERT_CHANNEL_CAPACITY;
use markertrack::capture::{CameraSource, StillCamera};
use markertrack::config::{TrackerConfig, app_name, version};
use markertrack::detection::TemplateEngine;
use markertrack::display::LogRenderer;
use markertrack::pipeline::{HealthAlert, HealthMonitor, TrackingCoordinator};
use std::{panic, process};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn main() {
    tracing_subscriber::fmt::init();

    let matches = Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Tracker configuration (JSON).")
                .required(true),
        )
        .arg(
            Arg::new("frame")
                .short('f')
                .long("frame")
                .value_name("IMAGE")
                .help("Camera image replayed on every tick.")
                .required(true),
        )
        .arg(
            Arg::new("ticks")
                .short('t')
                .long("ticks")
                .value_name("COUNT")
                .help("Stop after this many display ticks.")
                .value_parser(value_parser!(u64))
                .required(false),
        )
        .get_matches();

    // kill the process as soon as a worker thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(105);
    }));

    let (Some(config), Some(frame)) = (
        matches.get_one::<String>("config"),
        matches.get_one::<String>("frame"),
    ) else {
        return;
    };
    let ticks = matches.get_one::<u64>("ticks").copied();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(track(config, frame, ticks)) {
        error!("Tracking failed: {:#}", e);
        process::exit(1);
    }
}

async fn track(config_path: &str, frame_path: &str, ticks: Option<u64>) -> Result<()> {
    let config = TrackerConfig::load(config_path)?;
    let mut camera = StillCamera::open(frame_path)?;
    let mut renderer = LogRenderer::new();

    let mut coordinator = TrackingCoordinator::new(config.clone());
    for source in &config.markers {
        coordinator
            .register_marker(source.as_str())
            .with_context(|| format!("cannot register marker {}", source))?;
    }
    coordinator.start(TemplateEngine::new(), camera.resolution())?;

    let cancel = CancellationToken::new();

    let (alert_tx, mut alert_rx) = mpsc::channel::<HealthAlert>(ALERT_CHANNEL_CAPACITY);
    tokio::spawn(HealthMonitor::new(coordinator.health().clone(), alert_tx).run(cancel.child_token()));
    tokio::spawn(async move {
        while let Some(alert) = alert_rx.recv().await {
            warn!("Health alert: {}", alert);
        }
    });

    // stop gracefully on SIGINT
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping");
            interrupt.cancel();
        }
    });

    let result = coordinator
        .run(&mut camera, &mut renderer, cancel.clone(), ticks)
        .await;
    cancel.cancel();

    info!(
        "Presented {} frames. {}",
        renderer.presented(),
        coordinator.health().summary()
    );
    for (index, marker) in coordinator.registry().markers().enumerate() {
        info!(
            "Marker {} ({}): {:?}, last pose {:?}",
            index,
            marker.source(),
            marker.tracking(),
            marker.pose()
        );
    }
    result
}
