/*!
 # Day/Night Schedule Controller Library

 A Rust library for driving two lighting outputs ("day" and "night") from
 a weekly schedule that survives power loss and can be reconfigured remotely.

 ## Features

 * Day and night windows, including windows spanning midnight
 * Optional weekend override (Friday to Sunday)
 * Daylight saving toggle
 * Alarm engine with stale-alarm cleanup on reconfiguration
 * Fixed-size persisted record, restored at boot
 * PWM output drivers (logging, Linux sysfs)
 * HTTP form interface for remote configuration

 ## Example

 ```rust
 use nightlight_controller::*;
 use std::collections::HashMap;

 fn main() -> Result<()> {
     let mut controller = ScheduleController::new(
         SystemClock::new(3600),
         MemoryStore::new(),
         LogDriver::new(),
         3600,
     );

     let form: HashMap<String, String> = [
         ("dayStart", "08:00"),
         ("dayEnd", "20:00"),
         ("nightStart", "20:00"),
         ("nightEnd", "08:00"),
         ("dayIntensity", "80"),
         ("nightIntensity", "30"),
     ]
     .into_iter()
     .map(|(k, v)| (k.to_string(), v.to_string()))
     .collect();

     let request = ScheduleRequest::from_form(&form)?;
     controller.set_schedule(&request);
     assert!(controller.persist());

     // Called periodically from the main loop
     controller.tick();
     Ok(())
 }
 ```
*/

use thiserror::Error;

/// Custom error types for the schedule controller library
#[derive(Error, Debug)]
pub enum Error {
    /// A required configuration field is missing or empty
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// A time value is not in `HH:MM` form or out of range
    #[error("Invalid time of day: {0:?}")]
    InvalidTime(String),

    /// A numeric value could not be parsed
    #[error("Invalid value: {0:?}")]
    InvalidValue(String),

    /// Value out of range
    #[error("Value {0} out of range ({1}..{2})")]
    ValueOutOfRange(u32, u32, u32),

    /// Only some of the weekend fields were given
    #[error("Weekend schedule needs all four times or none")]
    PartialWeekend,

    /// The store could not be written
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The stored record does not decode to a valid schedule
    #[error("Corrupt schedule record: {0}")]
    CorruptRecord(String),

    /// An output could not be driven
    #[error("Output error: {0}")]
    Output(String),

    /// Configuration file problem
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod alarm;
pub mod clock;
pub mod config;
pub mod controller;
pub mod http;
pub mod output;
pub mod schedule;
pub mod store;

// Re-export key types
pub use alarm::{Action, AlarmEngine, AlarmId, Recurrence};
pub use clock::{Clock, SystemClock};
pub use config::{Config, OutputConfig};
pub use controller::{ScheduleController, Status, DST_OFFSET_SECS};
pub use output::{duty_for, LogDriver, OutputDriver, SysfsPwmDriver, PWM_MAX};
pub use schedule::{
    AlarmHandles, Channel, DayClass, Days, OutputState, ScheduleRequest, ScheduleState,
    TimeOfDay, WeekendOverride, Window, WEEK_DAYS,
};
pub use store::{FileStore, MemoryStore, Store, RECORD_LEN, SCHEDULE_ADDRESS};
