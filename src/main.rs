use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};
use nightlight_controller::schedule::fields;
use nightlight_controller::store::decode_record;
use nightlight_controller::*;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info, instrument, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Store image, overrides the configuration
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the stored schedule
    Show,
    /// Validate and store a schedule, as the configuration form would
    Set {
        /// Day start (HH:MM)
        #[arg(long, default_value = "08:00")]
        day_start: String,
        /// Day end (HH:MM)
        #[arg(long, default_value = "20:00")]
        day_end: String,
        /// Night start (HH:MM)
        #[arg(long, default_value = "20:00")]
        night_start: String,
        /// Night end (HH:MM)
        #[arg(long, default_value = "08:00")]
        night_end: String,
        /// Day intensity (1-100)
        #[arg(long, default_value_t = 100)]
        day_intensity: u8,
        /// Night intensity (1-100)
        #[arg(long, default_value_t = 30)]
        night_intensity: u8,
        /// Daylight saving active
        #[arg(long)]
        dst: bool,
        /// Weekend day start (HH:MM); all four weekend times or none
        #[arg(long)]
        weekend_day_start: Option<String>,
        /// Weekend day end (HH:MM)
        #[arg(long)]
        weekend_day_end: Option<String>,
        /// Weekend night start (HH:MM)
        #[arg(long)]
        weekend_night_start: Option<String>,
        /// Weekend night end (HH:MM)
        #[arg(long)]
        weekend_night_end: Option<String>,
        /// Validate and print without writing the store
        #[arg(long)]
        dry_run: bool,
    },
    /// Erase the stored schedule so the next boot awaits configuration
    Reset,
}

#[instrument]
fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| EnvFilter::new("nightlight_controller=warn,nightlightc=info")),
        )
        .compact()
        .init();

    color_eyre::install()?;

    let cli = Cli::parse();
    debug!("Parsed command line arguments");

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::default(),
    };
    if let Some(store) = cli.store {
        config.store_path = store;
    }

    match cli.command.unwrap_or(Commands::Show) {
        Commands::Show => show(&config)?,
        Commands::Set {
            day_start,
            day_end,
            night_start,
            night_end,
            day_intensity,
            night_intensity,
            dst,
            weekend_day_start,
            weekend_day_end,
            weekend_night_start,
            weekend_night_end,
            dry_run,
        } => {
            let mut form = HashMap::from([
                (fields::DAY_START.to_string(), day_start),
                (fields::DAY_END.to_string(), day_end),
                (fields::NIGHT_START.to_string(), night_start),
                (fields::NIGHT_END.to_string(), night_end),
                (fields::DAY_INTENSITY.to_string(), day_intensity.to_string()),
                (fields::NIGHT_INTENSITY.to_string(), night_intensity.to_string()),
            ]);
            if dst {
                form.insert(fields::DST.to_string(), "on".to_string());
            }
            for (name, value) in [
                (fields::WEEKEND_DAY_START, weekend_day_start),
                (fields::WEEKEND_DAY_END, weekend_day_end),
                (fields::WEEKEND_NIGHT_START, weekend_night_start),
                (fields::WEEKEND_NIGHT_END, weekend_night_end),
            ] {
                if let Some(value) = value {
                    form.insert(name.to_string(), value);
                }
            }
            let request = ScheduleRequest::from_form(&form)?;

            if dry_run {
                let state = apply(&config, MemoryStore::new(), &request)?;
                println!("{}", describe(&state));
                info!("Dry run, store left untouched");
            } else {
                let store = FileStore::new(&config.store_path);
                let state = apply(&config, store, &request)?;
                println!("{}", describe(&state));
                info!("Schedule written to {}", config.store_path.display());
            }
        }
        Commands::Reset => {
            let mut store = FileStore::new(&config.store_path);
            store.write_at(config.store_address, &[0; RECORD_LEN])?;
            info!("Stored schedule erased");
        }
    }

    Ok(())
}

/// Installs and persists `request` through a controller over `store`
#[instrument(skip(config, store))]
fn apply<S: Store>(config: &Config, store: S, request: &ScheduleRequest) -> Result<ScheduleState> {
    let mut controller = ScheduleController::new(
        SystemClock::new(config.utc_offset_secs),
        store,
        LogDriver::new(),
        config.utc_offset_secs,
    )
    .with_address(config.store_address);
    controller.set_schedule(request);
    if !controller.persist() {
        return Err(eyre!("failed to persist schedule"));
    }
    Ok(controller.state().clone())
}

fn show(config: &Config) -> Result<()> {
    let store = FileStore::new(&config.store_path);
    let Some(bytes) = store.load(config.store_address, RECORD_LEN) else {
        println!("no valid schedule stored");
        return Ok(());
    };
    match decode_record(&bytes) {
        Ok(state) if state.persisted => println!("{}", describe(&state)),
        Ok(_) => println!("no valid schedule stored"),
        Err(e) => {
            warn!("{}", e);
            println!("no valid schedule stored");
        }
    }
    Ok(())
}

fn describe(state: &ScheduleState) -> String {
    let mut lines = vec![
        format!("day:     {} at {}%", state.day, state.day_intensity),
        format!("night:   {} at {}%", state.night, state.night_intensity),
    ];
    match &state.weekend {
        Some(weekend) => lines.push(format!(
            "weekend: day {}, night {}",
            weekend.day, weekend.night
        )),
        None => lines.push("weekend: none".to_string()),
    }
    lines.push(format!("dst:     {}", if state.dst_active { "on" } else { "off" }));
    lines.push(format!(
        "outputs: day {}, night {}",
        if state.output.day_active { "on" } else { "off" },
        if state.output.night_active { "on" } else { "off" }
    ));
    lines.join("\n")
}
