use crate::aggregator::ErrorAggregator;
use crate::cancel::CancellationToken;
use crate::config::{read, Config, UserConfig, DEFAULT_CONFIG};
use crate::crm::CrmRegistry;
use crate::error::exit_if_handle_fatal;
use crate::ics::{Calendar, CalendarSink, LogSink};
use crate::model::DecoratedEvent;
use crate::reservations::ReservationService;
use crate::weather::rate_limit::RateLimiter;
use crate::weather::service::WeatherService;
use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;

mod aggregator;
mod cancel;
mod config;
mod crm;
mod error;
mod http;
mod ics;
mod logging;
mod model;
mod pipeline;
mod reservations;
mod units;
mod weather;

#[cfg(debug_assertions)]
#[derive(Copy, Clone, Debug, Default)]
struct DebugLevel;

#[cfg(debug_assertions)]
impl clap_verbosity_flag::LogLevel for DebugLevel {
    fn default() -> Option<log::Level> {
        Some(log::Level::Debug)
    }
}

#[cfg(debug_assertions)]
type DefaultLogLevel = DebugLevel;

#[cfg(not(debug_assertions))]
type DefaultLogLevel = clap_verbosity_flag::InfoLevel;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[clap(flatten)]
    verbose: clap_verbosity_flag::Verbosity<DefaultLogLevel>,

    // Custom config file location
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Only generate the calendar for this user
    #[arg(short, long)]
    user: Option<String>,

    /// Run the pipeline without dispatching to the calendar emitter
    #[arg(long)]
    dry_run: bool,

    /// Drop cached weather responses, optionally for one provider only
    #[arg(long, value_name = "PROVIDER", num_args = 0..=1, default_missing_value = "")]
    flush_cache: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let log_level = args
        .verbose
        .log_level()
        .expect("Log level cannot be not available");

    logging::init(log_level).expect("Logging successfully initialized");

    let config = read(args.config.clone()).unwrap_or_else(exit_if_handle_fatal);

    run(args, config).await.unwrap_or_else(exit_if_handle_fatal);
}

async fn run(args: Args, config: Config) -> anyhow::Result<()> {
    let (response_cache, location_cache) = weather::cache::open(&config.cache_db)?;

    if let Some(provider) = &args.flush_cache {
        let provider = (!provider.is_empty()).then_some(provider.as_str());
        let cleared = response_cache.clear(provider, None)?;
        info!("Flushed {cleared} cached weather responses");
        return Ok(());
    }

    let rate_limiter = Arc::new(RateLimiter::new());
    let aggregator = Arc::new(ErrorAggregator::default());

    let weather_service = Arc::new(WeatherService::new(
        config.providers.clone().into_iter().collect(),
        response_cache,
        location_cache,
        Arc::clone(&rate_limiter),
        Arc::clone(&aggregator),
    )?);

    let reservation_service = Arc::new(ReservationService::new(
        config.clubs.clone(),
        CrmRegistry::default(),
        Arc::clone(&weather_service),
        Arc::clone(&aggregator),
        config.fan_outs,
        config.horizon_days,
    )?);

    let sink = LogSink::default();

    let users: Vec<(&String, &UserConfig)> = config
        .users
        .iter()
        .filter(|(name, _)| args.user.as_ref().map_or(true, |wanted| wanted == *name))
        .collect();

    if users.is_empty() {
        warn!("No matching users configured, nothing to do");
        return Ok(());
    }

    for (name, user) in users {
        let cancel = CancellationToken::new();

        let run = run_user(
            Arc::clone(&reservation_service),
            user,
            &cancel,
            config.buffer_minutes,
        );

        match tokio::time::timeout(config.run_timeout, run).await {
            Ok(calendar) => {
                if args.dry_run {
                    info!(
                        "Dry run: calendar for {name:?} has {} events and {} conflicts",
                        calendar.events.len(),
                        calendar.conflicts.len()
                    );
                } else {
                    sink.write(&user.calendar_path, &calendar)
                        .with_context(|| format!("Emitting calendar for {name:?}"))?;
                }
            }
            Err(_) => {
                // Partial output is discarded wholesale on timeout.
                cancel.cancel();
                error!(
                    "Pipeline run for {name:?} exceeded {:?} and was cancelled",
                    config.run_timeout
                );
            }
        }
    }

    aggregator.flush();

    Ok(())
}

async fn run_user(
    reservations: Arc<ReservationService>,
    user: &UserConfig,
    cancel: &CancellationToken,
    buffer_minutes: i64,
) -> Calendar {
    let (mut events, failures) = Arc::clone(&reservations)
        .decorated_events(user, cancel)
        .await;

    for external in user.external_events.clone() {
        let reservations = Arc::clone(&reservations);
        let cancel = cancel.clone();

        let decorated: DecoratedEvent = tokio::task::spawn_blocking(move || {
            reservations.decorate_external(external, &cancel)
        })
        .await
        .expect("Decoration does not panic");

        events.push(decorated);
    }

    let (events, conflicts) = pipeline::assemble(events, buffer_minutes);

    Calendar {
        events,
        conflicts,
        notes: failures,
        reminder: chrono::Duration::minutes(user.reminder_minutes),
    }
}
