use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Main command: run the regulation daemon against the broker bridge on
    /// stdin/stdout.
    #[clap(name = "route")]
    Route(RouteArgs),

    /// Fit a calibration file and print the resulting percent/watts table.
    #[clap(name = "curve")]
    Curve(CurveArgs),

    /// One-shot cloud-cover lookup.
    #[clap(name = "weather")]
    Weather(WeatherArgs),
}

#[derive(Parser)]
pub struct RouteArgs {
    #[clap(long, env = "SUNFLOWER_CONFIG", default_value = "sunflower.toml")]
    pub config: PathBuf,

    /// Log equipment commands instead of sending them.
    #[clap(long)]
    pub dry_run: bool,
}

#[derive(Parser)]
pub struct CurveArgs {
    #[clap(long = "calibration-file")]
    pub calibration_file: PathBuf,
}

#[derive(Parser)]
pub struct WeatherArgs {
    #[clap(long, env = "SUNFLOWER_LOCATION")]
    pub location: String,

    /// Look up tomorrow instead of today.
    #[clap(long)]
    pub tomorrow: bool,
}
