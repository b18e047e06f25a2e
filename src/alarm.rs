/*!
 # Alarm engine

 Recurring, time-of-day triggered alarms. Each alarm carries one of four
 transition actions; the engine only reports which actions came due; the
 controller applies them.
*/

use chrono::{Datelike, Duration, NaiveDateTime, Weekday};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, instrument, trace, warn};

use crate::schedule::{AlarmHandles, Channel, ScheduleState, TimeOfDay, Window};

/// Opaque identifier of one installed alarm
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AlarmId(u16);

impl AlarmId {
    pub fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for AlarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transition carried by an alarm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    StartDay,
    EndDay,
    StartNight,
    EndNight,
}

impl Action {
    /// Channel switched by this action
    pub fn channel(&self) -> Channel {
        match self {
            Action::StartDay | Action::EndDay => Channel::Day,
            Action::StartNight | Action::EndNight => Channel::Night,
        }
    }

    /// Whether the channel is switched on
    pub fn turns_on(&self) -> bool {
        matches!(self, Action::StartDay | Action::StartNight)
    }
}

/// How often an alarm repeats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
    Daily,
    Weekly(Weekday),
}

#[derive(Debug, Clone)]
struct Alarm {
    recurrence: Recurrence,
    time: TimeOfDay,
    action: Action,
    enabled: bool,
    next: NaiveDateTime,
}

/// Weekend night alarms: Friday's night is closed on Saturday, Saturday's on
/// Sunday, and Sunday's by the regular night end on Monday.
const WEEKEND_NIGHT_PLAN: [(Weekday, bool); 5] = [
    (Weekday::Fri, true),
    (Weekday::Sat, false),
    (Weekday::Sat, true),
    (Weekday::Sun, false),
    (Weekday::Sun, true),
];

const WEEKEND_DAYS: [Weekday; 3] = [Weekday::Fri, Weekday::Sat, Weekday::Sun];

/// Owns every live alarm
#[derive(Debug, Default)]
pub struct AlarmEngine {
    alarms: BTreeMap<AlarmId, Alarm>,
    next_id: u16,
}

impl AlarmEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live alarms
    pub fn len(&self) -> usize {
        self.alarms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alarms.is_empty()
    }

    pub fn contains(&self, id: AlarmId) -> bool {
        self.alarms.contains_key(&id)
    }

    pub fn is_enabled(&self, id: AlarmId) -> Option<bool> {
        self.alarms.get(&id).map(|a| a.enabled)
    }

    pub fn next_trigger(&self, id: AlarmId) -> Option<NaiveDateTime> {
        self.alarms.get(&id).map(|a| a.next)
    }

    /// Creates one recurring alarm, armed for its first occurrence after `now`
    pub fn create(
        &mut self,
        recurrence: Recurrence,
        time: TimeOfDay,
        action: Action,
        now: NaiveDateTime,
    ) -> AlarmId {
        let id = self.allocate_id();
        let next = next_occurrence(recurrence, time, now);
        trace!("Alarm {} {:?} at {} ({:?}), first at {}", id, action, time, recurrence, next);
        self.alarms.insert(
            id,
            Alarm {
                recurrence,
                time,
                action,
                enabled: true,
                next,
            },
        );
        id
    }

    /// Releases one alarm; unknown ids are ignored
    pub fn free(&mut self, id: AlarmId) -> bool {
        self.alarms.remove(&id).is_some()
    }

    /// Installs every alarm implied by `state` and returns the handles per window
    #[instrument(skip(self, state))]
    pub fn install(&mut self, state: &ScheduleState, now: NaiveDateTime) -> AlarmHandles {
        let mut handles = AlarmHandles {
            day: self.daily_pair(&state.day, Action::StartDay, Action::EndDay, now),
            night: self.daily_pair(&state.night, Action::StartNight, Action::EndNight, now),
            ..AlarmHandles::default()
        };

        if let Some(weekend) = &state.weekend {
            if !weekend.day.is_inert() {
                for weekday in WEEKEND_DAYS {
                    let recurrence = Recurrence::Weekly(weekday);
                    handles.weekend_day.push(self.create(
                        recurrence,
                        weekend.day.start,
                        Action::StartDay,
                        now,
                    ));
                    handles.weekend_day.push(self.create(
                        recurrence,
                        weekend.day.end,
                        Action::EndDay,
                        now,
                    ));
                }
            }

            if !weekend.night.is_inert() {
                for (weekday, start) in WEEKEND_NIGHT_PLAN {
                    let (time, action) = if start {
                        (weekend.night.start, Action::StartNight)
                    } else {
                        (weekend.night.end, Action::EndNight)
                    };
                    handles.weekend_night.push(self.create(
                        Recurrence::Weekly(weekday),
                        time,
                        action,
                        now,
                    ));
                }
            }
        }

        debug!(
            "Installed {} alarms (day {}, night {}, weekend day {}, weekend night {})",
            handles.total(),
            handles.day.len(),
            handles.night.len(),
            handles.weekend_day.len(),
            handles.weekend_night.len()
        );
        handles
    }

    /// Releases every handle in the set
    #[instrument(skip(self, handles), fields(count = handles.total()))]
    pub fn uninstall(&mut self, handles: &AlarmHandles) {
        let mut released = 0;
        for id in handles.iter() {
            if self.free(*id) {
                released += 1;
            } else {
                warn!("Alarm {} was not live", id);
            }
        }
        debug!("Released {} alarms", released);
    }

    /// Arms or disarms alarms without releasing them
    pub fn set_enabled(&mut self, ids: &[AlarmId], enabled: bool) {
        for id in ids {
            if let Some(alarm) = self.alarms.get_mut(id) {
                if alarm.enabled != enabled {
                    trace!("Alarm {} enabled: {}", id, enabled);
                    alarm.enabled = enabled;
                }
            }
        }
    }

    /// Fires every alarm due at `now` and returns the actions of enabled ones
    /// in trigger order. Due alarms are re-armed for their next occurrence
    /// after `now`, whether they fired or not.
    pub fn service(&mut self, now: NaiveDateTime) -> Vec<Action> {
        let mut due: Vec<(NaiveDateTime, AlarmId)> = Vec::new();
        for (id, alarm) in self.alarms.iter_mut() {
            if alarm.next <= now {
                due.push((alarm.next, *id));
            } else if alarm.next - now > Duration::days(8) {
                // wall clock stepped backwards
                let rearmed = next_occurrence(alarm.recurrence, alarm.time, now);
                warn!("Alarm {} re-armed from {} to {}", id, alarm.next, rearmed);
                alarm.next = rearmed;
            }
        }
        due.sort();

        let mut fired = Vec::new();
        for (_, id) in due {
            let Some(alarm) = self.alarms.get_mut(&id) else {
                continue;
            };
            alarm.next = next_occurrence(alarm.recurrence, alarm.time, now);
            if alarm.enabled {
                debug!("Alarm {} fired: {:?}", id, alarm.action);
                fired.push(alarm.action);
            } else {
                trace!("Alarm {} due but disabled", id);
            }
        }
        fired
    }

    fn daily_pair(
        &mut self,
        window: &Window,
        start: Action,
        end: Action,
        now: NaiveDateTime,
    ) -> Vec<AlarmId> {
        if window.is_inert() {
            return Vec::new();
        }
        vec![
            self.create(Recurrence::Daily, window.start, start, now),
            self.create(Recurrence::Daily, window.end, end, now),
        ]
    }

    fn allocate_id(&mut self) -> AlarmId {
        loop {
            let id = AlarmId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1);
            if !self.alarms.contains_key(&id) {
                return id;
            }
        }
    }
}

/// First instant strictly after `after` at which the alarm is due
fn next_occurrence(recurrence: Recurrence, time: TimeOfDay, after: NaiveDateTime) -> NaiveDateTime {
    let mut date = after.date();
    for _ in 0..=7 {
        let candidate = date.and_time(time.as_naive());
        let day_matches = match recurrence {
            Recurrence::Daily => true,
            Recurrence::Weekly(weekday) => date.weekday() == weekday,
        };
        if day_matches && candidate > after {
            return candidate;
        }
        match date.succ_opt() {
            Some(next) => date = next,
            None => break,
        }
    }
    NaiveDateTime::MAX
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::WeekendOverride;
    use chrono::NaiveDate;

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        // 2024-01-01 is a Monday
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    fn weekday_state() -> ScheduleState {
        ScheduleState {
            day: Window::new(t("08:00"), t("20:00")),
            night: Window::new(t("20:00"), t("08:00")),
            ..ScheduleState::default()
        }
    }

    #[test]
    fn test_next_occurrence_daily() {
        let time = t("08:00");
        assert_eq!(next_occurrence(Recurrence::Daily, time, at(1, 7, 0)), at(1, 8, 0));
        assert_eq!(next_occurrence(Recurrence::Daily, time, at(1, 8, 0)), at(2, 8, 0));
        assert_eq!(next_occurrence(Recurrence::Daily, time, at(1, 9, 0)), at(2, 8, 0));
    }

    #[test]
    fn test_next_occurrence_weekly() {
        let time = t("22:00");
        // Monday -> Friday of the same week
        assert_eq!(
            next_occurrence(Recurrence::Weekly(Weekday::Fri), time, at(1, 0, 0)),
            at(5, 22, 0)
        );
        // Friday after the alarm -> next Friday
        assert_eq!(
            next_occurrence(Recurrence::Weekly(Weekday::Fri), time, at(5, 22, 0)),
            at(12, 22, 0)
        );
    }

    #[test]
    fn test_install_weekday_only() {
        let mut engine = AlarmEngine::new();
        let handles = engine.install(&weekday_state(), at(1, 7, 0));
        assert_eq!(handles.day.len(), 2);
        assert_eq!(handles.night.len(), 2);
        assert!(handles.weekend_day.is_empty());
        assert!(handles.weekend_night.is_empty());
        assert_eq!(engine.len(), 4);
    }

    #[test]
    fn test_install_weekend_override() {
        let mut state = weekday_state();
        state.weekend = Some(WeekendOverride {
            day: Window::new(t("10:00"), t("22:00")),
            night: Window::new(t("22:00"), t("10:00")),
        });
        let mut engine = AlarmEngine::new();
        let handles = engine.install(&state, at(1, 7, 0));
        assert_eq!(handles.weekend_day.len(), 6);
        assert_eq!(handles.weekend_night.len(), 5);
        assert_eq!(engine.len(), 4 + 6 + 5);
        assert_eq!(handles.total(), engine.len());
    }

    #[test]
    fn test_inert_window_installs_nothing() {
        let mut state = weekday_state();
        state.day = Window::new(t("10:00"), t("10:00"));
        let mut engine = AlarmEngine::new();
        let handles = engine.install(&state, at(1, 7, 0));
        assert!(handles.day.is_empty());
        assert_eq!(engine.len(), 2);
    }

    #[test]
    fn test_uninstall_is_idempotent() {
        let mut engine = AlarmEngine::new();
        engine.uninstall(&AlarmHandles::default());
        let handles = engine.install(&weekday_state(), at(1, 7, 0));
        engine.uninstall(&handles);
        engine.uninstall(&handles);
        assert!(engine.is_empty());
    }

    #[test]
    fn test_service_fires_once_and_rearms() {
        let mut engine = AlarmEngine::new();
        let handles = engine.install(&weekday_state(), at(1, 7, 0));
        assert!(engine.service(at(1, 7, 59)).is_empty());
        assert_eq!(
            engine.service(at(1, 8, 0)),
            vec![Action::StartDay, Action::EndNight]
        );
        assert!(engine.service(at(1, 8, 0)).is_empty());
        assert!(engine.service(at(1, 8, 1)).is_empty());
        assert_eq!(engine.next_trigger(handles.day[0]), Some(at(2, 8, 0)));
    }

    #[test]
    fn test_service_orders_simultaneous_alarms_by_handle() {
        let mut engine = AlarmEngine::new();
        engine.install(&weekday_state(), at(1, 7, 0));
        engine.service(at(1, 8, 0));
        assert_eq!(
            engine.service(at(1, 20, 0)),
            vec![Action::EndDay, Action::StartNight]
        );
    }

    #[test]
    fn test_disabled_alarm_is_skipped_but_rearmed() {
        let mut engine = AlarmEngine::new();
        let handles = engine.install(&weekday_state(), at(1, 7, 0));
        engine.set_enabled(&handles.regular(), false);
        assert!(engine.service(at(1, 8, 0)).is_empty());
        engine.set_enabled(&handles.regular(), true);
        assert!(engine.service(at(1, 8, 30)).is_empty());
        assert_eq!(engine.next_trigger(handles.day[0]), Some(at(2, 8, 0)));
    }

    #[test]
    fn test_backwards_clock_step_rearms() {
        let mut engine = AlarmEngine::new();
        let handles = engine.install(&weekday_state(), at(20, 7, 0));
        assert!(engine.service(at(1, 7, 0)).is_empty());
        assert_eq!(engine.next_trigger(handles.day[0]), Some(at(1, 8, 0)));
        assert_eq!(
            engine.service(at(1, 8, 0)),
            vec![Action::StartDay, Action::EndNight]
        );
    }
}
