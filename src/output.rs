/*!
 # Output drivers

 The controller drives two PWM channels. Intensities (0-100) map linearly
 onto a 10-bit duty cycle.
*/

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

use crate::schedule::Channel;
use crate::{Error, Result};

/// Full-scale 10-bit duty cycle
pub const PWM_MAX: u16 = 1023;

/// Maps an intensity (0-100, clamped) onto a 10-bit duty cycle
pub fn duty_for(intensity: u8) -> u16 {
    (intensity.min(100) as u32 * PWM_MAX as u32 / 100) as u16
}

/// Physical output primitives
pub trait OutputDriver {
    /// Writes a raw 10-bit duty (clamped to [`PWM_MAX`]); 0 turns the channel off
    fn set_duty(&mut self, channel: Channel, duty: u16) -> Result<()>;

    /// Turns `channel` on at `intensity` (0-100)
    fn set(&mut self, channel: Channel, intensity: u8) -> Result<()> {
        self.set_duty(channel, duty_for(intensity))
    }

    /// Turns `channel` off
    fn off(&mut self, channel: Channel) -> Result<()> {
        self.set_duty(channel, 0)
    }
}

impl<D: OutputDriver + ?Sized> OutputDriver for Box<D> {
    fn set_duty(&mut self, channel: Channel, duty: u16) -> Result<()> {
        (**self).set_duty(channel, duty)
    }

    fn set(&mut self, channel: Channel, intensity: u8) -> Result<()> {
        (**self).set(channel, intensity)
    }

    fn off(&mut self, channel: Channel) -> Result<()> {
        (**self).off(channel)
    }
}

fn slot(channel: Channel) -> usize {
    match channel {
        Channel::Day => 0,
        Channel::Night => 1,
    }
}

/// Driver without hardware that logs every change of duty
#[derive(Debug, Default)]
pub struct LogDriver {
    duty: [Option<u16>; 2],
}

impl LogDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last written duty per channel
    pub fn duty(&self, channel: Channel) -> Option<u16> {
        self.duty[slot(channel)]
    }

    fn write(&mut self, channel: Channel, duty: u16) {
        let last = self.duty[slot(channel)].replace(duty);
        if last != Some(duty) {
            info!("{} output duty {}/{}", channel.name(), duty, PWM_MAX);
        }
    }
}

impl OutputDriver for LogDriver {
    fn set_duty(&mut self, channel: Channel, duty: u16) -> Result<()> {
        self.write(channel, duty.min(PWM_MAX));
        Ok(())
    }
}

/// Driver for Linux sysfs PWM channels (`/sys/class/pwm/pwmchipN/pwmM`)
#[derive(Debug)]
pub struct SysfsPwmDriver {
    channels: [PathBuf; 2],
    period_ns: u64,
    written: [Option<u64>; 2],
}

impl SysfsPwmDriver {
    /// Opens both channels and programs their period
    #[instrument]
    pub fn new(day: &Path, night: &Path, period_ns: u64) -> Result<Self> {
        if period_ns == 0 {
            return Err(Error::Output("PWM period must be non-zero".into()));
        }
        let driver = Self {
            channels: [day.to_path_buf(), night.to_path_buf()],
            period_ns,
            written: [None; 2],
        };
        for dir in &driver.channels {
            write_attr(dir, "period", period_ns)?;
        }
        debug!("PWM channels ready, period {}ns", period_ns);
        Ok(driver)
    }

    fn write_duty(&mut self, channel: Channel, duty: u16) -> Result<()> {
        let duty_ns = self.period_ns * duty as u64 / PWM_MAX as u64;
        let index = slot(channel);
        if self.written[index] == Some(duty_ns) {
            return Ok(());
        }
        let dir = &self.channels[index];
        write_attr(dir, "duty_cycle", duty_ns)?;
        write_attr(dir, "enable", u64::from(duty_ns > 0))?;
        self.written[index] = Some(duty_ns);
        info!("{} output duty {}ns of {}ns", channel.name(), duty_ns, self.period_ns);
        Ok(())
    }
}

impl OutputDriver for SysfsPwmDriver {
    fn set_duty(&mut self, channel: Channel, duty: u16) -> Result<()> {
        self.write_duty(channel, duty.min(PWM_MAX))
    }
}

fn write_attr(dir: &Path, attr: &str, value: u64) -> Result<()> {
    let path = dir.join(attr);
    fs::write(&path, value.to_string())
        .map_err(|e| Error::Output(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(dir: &Path, attr: &str) -> String {
        fs::read_to_string(dir.join(attr)).unwrap()
    }

    #[test]
    fn test_duty_mapping() {
        assert_eq!(duty_for(0), 0);
        assert_eq!(duty_for(30), 306);
        assert_eq!(duty_for(80), 818);
        assert_eq!(duty_for(100), PWM_MAX);
        assert_eq!(duty_for(250), PWM_MAX);
    }

    #[test]
    fn test_log_driver_tracks_duty() {
        let mut driver = LogDriver::new();
        assert_eq!(driver.duty(Channel::Day), None);
        driver.set(Channel::Day, 100).unwrap();
        driver.off(Channel::Night).unwrap();
        assert_eq!(driver.duty(Channel::Day), Some(PWM_MAX));
        assert_eq!(driver.duty(Channel::Night), Some(0));
        driver.set_duty(Channel::Night, 4000).unwrap();
        assert_eq!(driver.duty(Channel::Night), Some(PWM_MAX));
    }

    #[test]
    fn test_sysfs_driver_writes_attributes() {
        let root = tempfile::tempdir().unwrap();
        let day = root.path().join("pwm0");
        let night = root.path().join("pwm1");
        fs::create_dir_all(&day).unwrap();
        fs::create_dir_all(&night).unwrap();

        let mut driver = SysfsPwmDriver::new(&day, &night, 1_023_000).unwrap();
        assert_eq!(read(&day, "period"), "1023000");

        driver.set(Channel::Day, 100).unwrap();
        assert_eq!(read(&day, "duty_cycle"), "1023000");
        assert_eq!(read(&day, "enable"), "1");

        driver.off(Channel::Day).unwrap();
        assert_eq!(read(&day, "duty_cycle"), "0");
        assert_eq!(read(&day, "enable"), "0");

        driver.set_duty(Channel::Night, 512).unwrap();
        assert_eq!(read(&night, "duty_cycle"), "512000");
        assert_eq!(read(&night, "enable"), "1");
    }

    #[test]
    fn test_sysfs_driver_reports_missing_channel() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("nope");
        assert!(SysfsPwmDriver::new(&missing, &missing, 1000).is_err());
    }
}
