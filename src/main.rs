mod apsystems;
mod collector;
mod config;
mod influx;
mod points;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{CommandFactory, Parser, error::ErrorKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::apsystems::{ApSystemsClient, PortalEndpoints};
use crate::collector::{RunOutcome, days_to_fetch};
use crate::config::{Config, DEFAULT_INFLUX_CONFIG_PATH, DEFAULT_PORTAL_CONFIG_PATH};
use crate::influx::InfluxWriter;

/// Copy daily APsystems inverter reports into InfluxDB.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// First day to fetch, counted back from today (0 is today).
    #[arg(default_value_t = 0)]
    days_back: u32,
    /// Last day to fetch, counted back from today. Defaults to `days_back`.
    days_back_to: Option<u32>,
    /// Portal credentials and device ids (`key=value` lines).
    #[arg(long, env = "APSYSTEMS_CONFIG", default_value = DEFAULT_PORTAL_CONFIG_PATH)]
    config: PathBuf,
    /// InfluxDB connection parameters (`key=value` lines).
    #[arg(long, env = "INFLUX_CONFIG", default_value = DEFAULT_INFLUX_CONFIG_PATH)]
    influx_config: PathBuf,
}

impl Cli {
    fn day_range(&self) -> Result<(u32, u32), clap::Error> {
        let last = self.days_back_to.unwrap_or(self.days_back);
        if last < self.days_back {
            return Err(Cli::command().error(
                ErrorKind::ValueValidation,
                format!(
                    "days_back_to ({}) must not be smaller than days_back ({})",
                    last, self.days_back
                ),
            ));
        }
        Ok((self.days_back, last))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let (first, last) = cli.day_range().unwrap_or_else(|e| e.exit());

    let config = Config::load(&cli.config, &cli.influx_config).context("loading configuration")?;
    info!(
        system_id = %config.portal.system_id,
        ecu_id = %config.portal.ecu_id,
        database = %config.influx.database,
        "loaded config"
    );

    let days = days_to_fetch(Local::now().date_naive(), first, last);

    let mut portal = ApSystemsClient::new(PortalEndpoints::default(), &config.portal);
    portal
        .login()
        .await
        .context("logging in to the APsystems portal")?;

    let writer = InfluxWriter::new(&config.influx).context("setting up the InfluxDB writer")?;
    let tags = points::run_tags(&config.portal);

    match collector::run(&portal, &writer, &tags, &days).await? {
        RunOutcome::Completed(summary) => {
            info!(
                days_written = summary.days_written,
                days_skipped = summary.days_skipped,
                points = summary.points_written,
                readings_skipped = summary.readings_skipped,
                "run complete"
            );
            Ok(ExitCode::SUCCESS)
        }
        RunOutcome::NoData(day) => {
            error!(%day, "could not get APsystems data");
            Ok(ExitCode::FAILURE)
        }
    }
}
