/*!
 # Schedule controller

 Owns the live [`ScheduleState`] and the [`AlarmEngine`], and is the only
 place the state is mutated: reconfiguration, restore at boot, alarm
 firings and the per-tick weekend gate all go through here.
*/

use chrono::{Datelike, NaiveDateTime, Weekday};
use tracing::{debug, error, info, instrument, warn};

use crate::alarm::{Action, AlarmEngine};
use crate::clock::Clock;
use crate::output::OutputDriver;
use crate::schedule::{Channel, DayClass, ScheduleRequest, ScheduleState, WEEK_DAYS};
use crate::store::{decode_record, encode_record, Store, RECORD_LEN, SCHEDULE_ADDRESS};
use crate::Result;

/// Extra wall-clock offset while daylight saving is active
pub const DST_OFFSET_SECS: i64 = 3600;

/// Point-in-time view for status pages and diagnostics
#[derive(Debug, Clone)]
pub struct Status {
    pub now: NaiveDateTime,
    pub weekday: Weekday,
    pub day_class: DayClass,
    pub state: ScheduleState,
    pub live_alarms: usize,
    pub offset_secs: i64,
}

/// Orchestrates validate, uninstall, install and persist
pub struct ScheduleController<C, S, D> {
    clock: C,
    store: S,
    driver: D,
    engine: AlarmEngine,
    state: ScheduleState,
    utc_offset_secs: i64,
    dst_offset_secs: i64,
    address: usize,
}

impl<C: Clock, S: Store, D: OutputDriver> ScheduleController<C, S, D> {
    /// Creates an uninitialized controller; nothing is scheduled until
    /// [`set_schedule`](Self::set_schedule) or
    /// [`restore_from_store`](Self::restore_from_store) succeeds.
    pub fn new(clock: C, store: S, driver: D, utc_offset_secs: i64) -> Self {
        let mut controller = Self {
            clock,
            store,
            driver,
            engine: AlarmEngine::new(),
            state: ScheduleState::default(),
            utc_offset_secs,
            dst_offset_secs: 0,
            address: SCHEDULE_ADDRESS,
        };
        controller.clock.set_offset(utc_offset_secs);
        controller
    }

    /// Uses a different record address in the store
    pub fn with_address(mut self, address: usize) -> Self {
        self.address = address;
        self
    }

    pub fn state(&self) -> &ScheduleState {
        &self.state
    }

    pub fn engine(&self) -> &AlarmEngine {
        &self.engine
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Total wall-clock offset currently requested from the clock
    pub fn wall_clock_offset(&self) -> i64 {
        self.utc_offset_secs + self.dst_offset_secs
    }

    /// Installs a new schedule, replacing any previous one.
    ///
    /// The new schedule is live immediately but not yet durable; call
    /// [`persist`](Self::persist) to save it.
    #[instrument(skip(self, request), fields(day = %request.day, night = %request.night, dst = request.dst))]
    pub fn set_schedule(&mut self, request: &ScheduleRequest) -> &ScheduleState {
        if self.state.initialized {
            self.engine.uninstall(&self.state.handles);
            self.state.handles.clear();
        }

        self.state.day = request.day;
        self.state.night = request.night;
        self.state.weekend = request.weekend;
        self.state.day_intensity = request.day_intensity;
        self.state.night_intensity = request.night_intensity;
        self.state.dst_active = request.dst;
        self.resync_offset();

        let now = self.clock.now();
        self.state.handles = self.engine.install(&self.state, now);
        self.state.initialized = true;
        self.state.persisted = false;
        self.apply_weekend_gate();

        info!(
            "Schedule set: day {} @{}%, night {} @{}%, weekend {}",
            self.state.day,
            self.state.day_intensity,
            self.state.night,
            self.state.night_intensity,
            match &self.state.weekend {
                Some(w) => format!("day {} night {}", w.day, w.night),
                None => "none".to_string(),
            }
        );
        &self.state
    }

    /// Adopts the stored record if it was validly persisted, re-installing its
    /// alarms and re-applying its output state. Otherwise the controller stays
    /// as it is, awaiting configuration.
    #[instrument(skip(self))]
    pub fn restore_from_store(&mut self) -> Option<&ScheduleState> {
        let Some(bytes) = self.store.load(self.address, RECORD_LEN) else {
            info!("No stored schedule, awaiting configuration");
            return None;
        };
        let mut restored = match decode_record(&bytes) {
            Ok(record) if record.persisted => record,
            Ok(_) => {
                info!("Stored schedule was never committed, awaiting configuration");
                return None;
            }
            Err(e) => {
                warn!("Ignoring stored schedule: {}", e);
                return None;
            }
        };

        if self.state.initialized {
            self.engine.uninstall(&self.state.handles);
        }
        // handles in the record belong to a previous run
        restored.handles.clear();
        self.state = restored;
        self.resync_offset();

        let now = self.clock.now();
        self.state.handles = self.engine.install(&self.state, now);
        self.state.initialized = true;
        self.apply_weekend_gate();
        if let Err(e) = self.apply_outputs() {
            error!("Failed to re-apply outputs: {}", e);
        }

        info!(
            "Restored schedule: day {}, night {}, dst {}, outputs day={} night={}",
            self.state.day,
            self.state.night,
            self.state.dst_active,
            self.state.output.day_active,
            self.state.output.night_active
        );
        Some(&self.state)
    }

    /// Writes the full state to the store and reports whether the commit
    /// succeeded. The live `persisted` flag follows the outcome.
    #[instrument(skip(self))]
    pub fn persist(&mut self) -> bool {
        let mut record = self.state.clone();
        record.persisted = true;
        let saved = self.store.store(self.address, &encode_record(&record));
        self.state.persisted = saved;
        if saved {
            debug!("Schedule persisted");
        } else {
            warn!("Failed to persist schedule");
        }
        saved
    }

    /// Disarms the regular daily alarms from Friday through Sunday when a
    /// weekend override is configured, and re-arms them otherwise.
    pub fn apply_weekend_gate(&mut self) {
        if !self.state.has_weekend() {
            return;
        }
        let weekday = self.clock.weekday();
        let enabled = !WEEK_DAYS.contains(WEEK_DAYS.weekend_days, weekday);
        self.engine.set_enabled(&self.state.handles.regular(), enabled);
    }

    /// Applies one alarm firing to the output flags and persists right away
    pub fn handle(&mut self, action: Action) {
        let channel = action.channel();
        let active = action.turns_on();
        self.state.output.set(channel, active);
        info!(
            "{} channel {}",
            channel.name(),
            if active { "on" } else { "off" }
        );
        self.persist();
    }

    /// Drives the outputs from the current flags. Safe to repeat.
    pub fn apply_outputs(&mut self) -> Result<()> {
        for channel in Channel::ALL {
            if self.state.output.is_active(channel) {
                self.driver.set(channel, self.state.intensity(channel))?;
            } else {
                self.driver.off(channel)?;
            }
        }
        Ok(())
    }

    /// Writes a raw duty to one output. The schedule takes the output back
    /// on the next tick.
    pub fn drive_raw(&mut self, channel: Channel, duty: u16) -> Result<()> {
        info!("Manual {} output duty {}", channel.name(), duty);
        self.driver.set_duty(channel, duty)
    }

    /// One pass of the periodic loop: sync the clock, gate the weekday alarms,
    /// fire due alarms and drive the outputs. Returns the fired actions.
    pub fn tick(&mut self) -> Vec<Action> {
        self.clock.set_offset(self.wall_clock_offset());
        if !self.clock.sync() {
            warn!("Clock sync failed, keeping previous time");
        }
        self.apply_weekend_gate();

        let now = self.clock.now();
        debug!(
            "Tick at {} ({}), {} alarms live, outputs day={} night={}",
            now,
            now.weekday(),
            self.engine.len(),
            self.state.output.day_active,
            self.state.output.night_active
        );
        let fired = self.engine.service(now);
        for action in &fired {
            self.handle(*action);
        }

        if let Err(e) = self.apply_outputs() {
            error!("Failed to drive outputs: {}", e);
        }
        fired
    }

    pub fn status(&self) -> Status {
        let now = self.clock.now();
        let weekday = now.weekday();
        Status {
            now,
            weekday,
            day_class: DayClass::of(weekday, self.state.has_weekend()),
            state: self.state.clone(),
            live_alarms: self.engine.len(),
            offset_secs: self.wall_clock_offset(),
        }
    }

    fn resync_offset(&mut self) {
        self.dst_offset_secs = if self.state.dst_active {
            DST_OFFSET_SECS
        } else {
            0
        };
        self.clock.set_offset(self.wall_clock_offset());
        if !self.clock.sync() {
            warn!("Clock sync failed after offset change");
        }
    }
}
