/*!
 # Schedule model

 Configured on/off windows for the day and night channels, the optional
 weekend override, and the persisted aggregate that ties them together
 with the live output flags and the alarm handles installed for them.
*/

use chrono::{NaiveTime, Weekday};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::alarm::AlarmId;
use crate::{Error, Result};

/// Represents days of the week as bits, used for day-class decisions
#[derive(Debug, Clone, Copy)]
pub struct Days {
    /// Monday (0x01)
    pub monday: u8,
    /// Tuesday (0x02)
    pub tuesday: u8,
    /// Wednesday (0x04)
    pub wednesday: u8,
    /// Thursday (0x08)
    pub thursday: u8,
    /// Friday (0x10)
    pub friday: u8,
    /// Saturday (0x20)
    pub saturday: u8,
    /// Sunday (0x40)
    pub sunday: u8,
    /// Days gated over to the weekend override (Friday-Sunday, 0x70)
    pub weekend_days: u8,
}

/// Predefined day constants
pub const WEEK_DAYS: Days = Days {
    monday: 0x01,
    tuesday: 0x02,
    wednesday: 0x04,
    thursday: 0x08,
    friday: 0x10,
    saturday: 0x20,
    sunday: 0x40,
    weekend_days: 0x10 + 0x20 + 0x40,
};

impl Days {
    /// Bit for a single weekday
    pub fn bit(&self, weekday: Weekday) -> u8 {
        match weekday {
            Weekday::Mon => self.monday,
            Weekday::Tue => self.tuesday,
            Weekday::Wed => self.wednesday,
            Weekday::Thu => self.thursday,
            Weekday::Fri => self.friday,
            Weekday::Sat => self.saturday,
            Weekday::Sun => self.sunday,
        }
    }

    /// Whether `weekday` is part of `mask`
    pub fn contains(&self, mask: u8, weekday: Weekday) -> bool {
        mask & self.bit(weekday) != 0
    }
}

/// A minute-resolution time of day
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    /// Creates a time of day, rejecting hours above 23 and minutes above 59
    pub fn new(hour: u8, minute: u8) -> Result<Self> {
        if hour > 23 {
            return Err(Error::ValueOutOfRange(hour as u32, 0, 23));
        }
        if minute > 59 {
            return Err(Error::ValueOutOfRange(minute as u32, 0, 59));
        }
        Ok(Self { hour, minute })
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }

    pub fn as_naive(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour as u32, self.minute as u32, 0).unwrap_or(NaiveTime::MIN)
    }
}

impl FromStr for TimeOfDay {
    type Err = Error;

    /// Parses `"HH:MM"`: the first two characters are the hour and
    /// everything from index 3 onwards is the minute.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidTime(s.to_string());
        let hour = s.get(0..2).ok_or_else(invalid)?;
        let minute = s.get(3..).ok_or_else(invalid)?;
        let hour: u8 = hour.parse().map_err(|_| invalid())?;
        let minute: u8 = minute.trim().parse().map_err(|_| invalid())?;
        Self::new(hour, minute).map_err(|_| invalid())
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// One on/off cycle of a channel. `end` earlier than `start` spans midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl Window {
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Self {
        Self { start, end }
    }

    /// Zero-duration windows never switch anything
    pub fn is_inert(&self) -> bool {
        self.start == self.end
    }
}

impl Default for Window {
    fn default() -> Self {
        let midnight = TimeOfDay { hour: 0, minute: 0 };
        Self::new(midnight, midnight)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// The two physical outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Day,
    Night,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Day, Channel::Night];

    pub fn name(&self) -> &'static str {
        match self {
            Channel::Day => "day",
            Channel::Night => "night",
        }
    }
}

/// Which window set governs a calendar day
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayClass {
    Weekday,
    Weekend,
}

impl DayClass {
    /// Friday through Sunday belong to the weekend override when one is configured
    pub fn of(weekday: Weekday, has_weekend: bool) -> Self {
        if has_weekend && WEEK_DAYS.contains(WEEK_DAYS.weekend_days, weekday) {
            DayClass::Weekend
        } else {
            DayClass::Weekday
        }
    }
}

/// Weekend-specific windows, replacing the weekday ones from Friday to Sunday
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeekendOverride {
    pub day: Window,
    pub night: Window,
}

/// Last known on/off state per channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputState {
    pub day_active: bool,
    pub night_active: bool,
}

impl OutputState {
    pub fn is_active(&self, channel: Channel) -> bool {
        match channel {
            Channel::Day => self.day_active,
            Channel::Night => self.night_active,
        }
    }

    pub fn set(&mut self, channel: Channel, active: bool) {
        match channel {
            Channel::Day => self.day_active = active,
            Channel::Night => self.night_active = active,
        }
    }
}

/// Alarm handles owned per window
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlarmHandles {
    pub day: Vec<AlarmId>,
    pub night: Vec<AlarmId>,
    pub weekend_day: Vec<AlarmId>,
    pub weekend_night: Vec<AlarmId>,
}

impl AlarmHandles {
    /// Largest number of handles a single window can own (weekend day: Fri, Sat, Sun x start/end)
    pub const MAX_PER_WINDOW: usize = 6;

    /// The regular daily alarms, which the weekend gate switches on and off
    pub fn regular(&self) -> Vec<AlarmId> {
        self.day.iter().chain(self.night.iter()).copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AlarmId> {
        self.day
            .iter()
            .chain(self.night.iter())
            .chain(self.weekend_day.iter())
            .chain(self.weekend_night.iter())
    }

    pub fn total(&self) -> usize {
        self.day.len() + self.night.len() + self.weekend_day.len() + self.weekend_night.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn clear(&mut self) {
        self.day.clear();
        self.night.clear();
        self.weekend_day.clear();
        self.weekend_night.clear();
    }
}

/// The root persisted aggregate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleState {
    /// Set only once a write-back of this exact state succeeded
    pub persisted: bool,
    /// Set once any schedule was installed in the current run
    pub initialized: bool,
    pub dst_active: bool,
    pub day: Window,
    pub night: Window,
    pub weekend: Option<WeekendOverride>,
    /// 1-100
    pub day_intensity: u8,
    /// 1-100
    pub night_intensity: u8,
    pub output: OutputState,
    pub handles: AlarmHandles,
}

impl Default for ScheduleState {
    fn default() -> Self {
        Self {
            persisted: false,
            initialized: false,
            dst_active: false,
            day: Window::default(),
            night: Window::default(),
            weekend: None,
            day_intensity: 100,
            night_intensity: 100,
            output: OutputState::default(),
            handles: AlarmHandles::default(),
        }
    }
}

impl ScheduleState {
    pub fn has_weekend(&self) -> bool {
        self.weekend.is_some()
    }

    pub fn intensity(&self, channel: Channel) -> u8 {
        match channel {
            Channel::Day => self.day_intensity,
            Channel::Night => self.night_intensity,
        }
    }
}

/// A validated configuration request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRequest {
    pub day: Window,
    pub night: Window,
    pub day_intensity: u8,
    pub night_intensity: u8,
    pub dst: bool,
    pub weekend: Option<WeekendOverride>,
}

/// Form field names of the configuration interface
pub mod fields {
    pub const DAY_START: &str = "dayStart";
    pub const DAY_END: &str = "dayEnd";
    pub const NIGHT_START: &str = "nightStart";
    pub const NIGHT_END: &str = "nightEnd";
    pub const DAY_INTENSITY: &str = "dayIntensity";
    pub const NIGHT_INTENSITY: &str = "nightIntensity";
    pub const DST: &str = "dst";
    pub const WEEKEND_DAY_START: &str = "weekendDayStart";
    pub const WEEKEND_DAY_END: &str = "weekendDayEnd";
    pub const WEEKEND_NIGHT_START: &str = "weekendNightStart";
    pub const WEEKEND_NIGHT_END: &str = "weekendNightEnd";

    pub const WEEKEND: [&str; 4] = [
        WEEKEND_DAY_START,
        WEEKEND_DAY_END,
        WEEKEND_NIGHT_START,
        WEEKEND_NIGHT_END,
    ];
}

impl ScheduleRequest {
    /// Builds a request from submitted form fields.
    ///
    /// Empty values count as missing. The weekend group is all-or-nothing.
    pub fn from_form(form: &HashMap<String, String>) -> Result<Self> {
        let get = |name: &'static str| form.get(name).map(|v| v.trim()).filter(|v| !v.is_empty());
        let required = |name: &'static str| get(name).ok_or(Error::MissingField(name));
        let time = |name: &'static str| required(name)?.parse::<TimeOfDay>();

        let day = Window::new(time(fields::DAY_START)?, time(fields::DAY_END)?);
        let night = Window::new(time(fields::NIGHT_START)?, time(fields::NIGHT_END)?);
        let day_intensity = parse_intensity(required(fields::DAY_INTENSITY)?)?;
        let night_intensity = parse_intensity(required(fields::NIGHT_INTENSITY)?)?;
        let dst = get(fields::DST) == Some("on");

        let present = fields::WEEKEND
            .into_iter()
            .filter(|name| get(*name).is_some())
            .count();
        let weekend = match present {
            0 => None,
            4 => Some(WeekendOverride {
                day: Window::new(
                    time(fields::WEEKEND_DAY_START)?,
                    time(fields::WEEKEND_DAY_END)?,
                ),
                night: Window::new(
                    time(fields::WEEKEND_NIGHT_START)?,
                    time(fields::WEEKEND_NIGHT_END)?,
                ),
            }),
            _ => return Err(Error::PartialWeekend),
        };

        Ok(Self {
            day,
            night,
            day_intensity,
            night_intensity,
            dst,
            weekend,
        })
    }
}

fn parse_intensity(value: &str) -> Result<u8> {
    let parsed: u32 = value
        .parse()
        .map_err(|_| Error::InvalidValue(value.to_string()))?;
    if !(1..=100).contains(&parsed) {
        return Err(Error::ValueOutOfRange(parsed, 1, 100));
    }
    Ok(parsed as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn base_form() -> Vec<(&'static str, &'static str)> {
        vec![
            ("dayStart", "08:00"),
            ("dayEnd", "20:00"),
            ("nightStart", "20:00"),
            ("nightEnd", "08:00"),
            ("dayIntensity", "80"),
            ("nightIntensity", "30"),
        ]
    }

    #[test]
    fn test_parse_time_of_day() {
        let t: TimeOfDay = "07:45".parse().unwrap();
        assert_eq!((t.hour(), t.minute()), (7, 45));
        assert_eq!(t.to_string(), "07:45");
    }

    #[test]
    fn test_parse_time_of_day_rejects_garbage() {
        assert!("7:45".parse::<TimeOfDay>().is_err());
        assert!("24:00".parse::<TimeOfDay>().is_err());
        assert!("12:60".parse::<TimeOfDay>().is_err());
        assert!("ab:cd".parse::<TimeOfDay>().is_err());
        assert!("12".parse::<TimeOfDay>().is_err());
    }

    #[test]
    fn test_window_shape() {
        let night = Window::new("20:00".parse().unwrap(), "08:00".parse().unwrap());
        assert!(!night.is_inert());
        assert!(Window::default().is_inert());
    }

    #[test]
    fn test_day_class() {
        assert_eq!(DayClass::of(Weekday::Fri, true), DayClass::Weekend);
        assert_eq!(DayClass::of(Weekday::Sun, true), DayClass::Weekend);
        assert_eq!(DayClass::of(Weekday::Thu, true), DayClass::Weekday);
        assert_eq!(DayClass::of(Weekday::Sat, false), DayClass::Weekday);
    }

    #[test]
    fn test_request_without_weekend() {
        let req = ScheduleRequest::from_form(&form(&base_form())).unwrap();
        assert_eq!(req.day.to_string(), "08:00-20:00");
        assert_eq!(req.night_intensity, 30);
        assert!(!req.dst);
        assert!(req.weekend.is_none());
    }

    #[test]
    fn test_request_with_weekend_and_dst() {
        let mut pairs = base_form();
        pairs.extend([
            ("weekendDayStart", "10:00"),
            ("weekendDayEnd", "22:00"),
            ("weekendNightStart", "22:00"),
            ("weekendNightEnd", "10:00"),
            ("dst", "on"),
        ]);
        let req = ScheduleRequest::from_form(&form(&pairs)).unwrap();
        assert!(req.dst);
        let weekend = req.weekend.unwrap();
        assert_eq!(weekend.night.to_string(), "22:00-10:00");
    }

    #[test]
    fn test_request_rejects_partial_weekend() {
        let mut pairs = base_form();
        pairs.push(("weekendDayStart", "10:00"));
        let err = ScheduleRequest::from_form(&form(&pairs)).unwrap_err();
        assert!(matches!(err, Error::PartialWeekend));
    }

    #[test]
    fn test_request_rejects_missing_and_empty_fields() {
        let mut pairs = base_form();
        pairs.retain(|(k, _)| *k != "nightEnd");
        let err = ScheduleRequest::from_form(&form(&pairs)).unwrap_err();
        assert!(matches!(err, Error::MissingField("nightEnd")));

        let mut pairs = base_form();
        pairs[0] = ("dayStart", "");
        let err = ScheduleRequest::from_form(&form(&pairs)).unwrap_err();
        assert!(matches!(err, Error::MissingField("dayStart")));
    }

    #[test]
    fn test_request_rejects_intensity_out_of_range() {
        let mut pairs = base_form();
        pairs[4] = ("dayIntensity", "0");
        assert!(ScheduleRequest::from_form(&form(&pairs)).is_err());
        pairs[4] = ("dayIntensity", "101");
        assert!(ScheduleRequest::from_form(&form(&pairs)).is_err());
    }
}
