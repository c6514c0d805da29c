mod api;
mod cli;
mod config;
mod core;
mod prelude;
mod quantity;
mod snapshot;
mod transport;

use std::{sync::Arc, time::Duration};

use chrono::Local;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::{
    api::wttr::{CloudForecast, ForecastDay, Wttr},
    cli::{Args, Command, CurveArgs, RouteArgs, WeatherArgs},
    config::Settings,
    core::{calibration::CalibrationCurve, engine::Engine, equipment::Equipment},
    prelude::*,
    snapshot::Snapshot,
    transport::Publisher,
};

#[tokio::main]
async fn main() -> Result {
    let _ = dotenvy::dotenv();
    // Stdout carries the broker bridge frames, all logging goes to stderr:
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Args::parse().command {
        Command::Route(args) => route(args).await,
        Command::Curve(args) => curve(&args),
        Command::Weather(args) => weather(&args).await,
    }
}

async fn route(args: RouteArgs) -> Result {
    let settings = Settings::read_from(&args.config)?;
    let (publisher, outbound) = Publisher::channel(true);
    let commands = publisher.with_enabled(!args.dry_run);
    let equipments = settings
        .equipment
        .iter()
        .map(|equipment| Equipment::from_settings(equipment, commands.clone()))
        .collect::<Result<Vec<_>>>()?;
    ensure!(!equipments.is_empty(), "no equipment is configured");

    let weather = Arc::new(Wttr::new(
        &settings.weather.location,
        settings.weather.retries,
        Duration::from_secs(settings.weather.retry_delay_secs),
    )?);
    let snapshot_path = settings.persistence.path.clone();
    let save_period = Duration::from_secs(settings.persistence.save_period_secs);

    let mut engine = Engine::new(settings, equipments, publisher, weather);
    engine.restore(Snapshot::read_from(&snapshot_path));
    engine.start(Local::now());

    let (inbound_sender, mut inbound) = tokio::sync::mpsc::unbounded_channel();
    let _reader = tokio::spawn(transport::run_stdin_reader(inbound_sender));
    let _writer = tokio::spawn(transport::run_stdout_writer(outbound));

    let mut save_timer = tokio::time::interval(save_period);
    save_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    save_timer.tick().await; // the first tick completes immediately

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    info!("routing…");
    loop {
        tokio::select! {
            frame = inbound.recv() => match frame {
                Some(frame) => engine.dispatch(frame, Local::now()).await,
                None => {
                    info!("the inbound stream is closed, leaving");
                    break;
                }
            },
            _ = save_timer.tick() => {
                engine.snapshot(Local::now()).write_to(&snapshot_path);
            }
            () = &mut shutdown => break,
        }
    }

    // The mandatory exit sequence: shed everything and let the command frames
    // drain before persisting the accounting.
    let now = Local::now();
    engine.shutdown(now);
    tokio::time::sleep(Duration::from_millis(500)).await;
    engine.snapshot(now).write_to(&snapshot_path);
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(error) => {
                warn!(%error, "failed to install the SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("received a shutdown signal");
}

fn curve(args: &CurveArgs) -> Result {
    let curve = CalibrationCurve::from_csv_file(&args.calibration_file)?;
    let mut table = comfy_table::Table::new();
    table.set_header(["Percent", "Watts"]);
    // Every 5th percent is plenty for eyeballing the fit:
    for (percent, watts) in curve.table().step_by(10) {
        table.add_row([format!("{percent:.1}"), format!("{watts:.0}")]);
    }
    println!("{table}");
    println!("maximum power: {}", curve.max_power());
    Ok(())
}

async fn weather(args: &WeatherArgs) -> Result {
    let api = Wttr::new(&args.location, 1, Duration::from_secs(1))?;
    let day = if args.tomorrow { ForecastDay::Tomorrow } else { ForecastDay::Today };
    let cover = api.cloud_cover(day).await?;
    println!("cloud cover: {cover} %");
    Ok(())
}
