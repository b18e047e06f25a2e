/*!
 # Persistence

 The schedule is kept as one fixed-size binary record at a well-known
 address of a small byte store, the way an EEPROM image would hold it.

 ## Record layout (little-endian)

 | bytes | field |
 |-------|-------|
 | 1     | flags: persisted, initialized, dst, weekend, day active, night active |
 | 16    | day, night, weekend day, weekend night windows (start h/m, end h/m) |
 | 2     | day intensity, night intensity |
 | 52    | per window: handle count + 6 handle slots (u16) |

 Absent weekend windows are written with an hour byte of `0xFF`.
 There is no version field.
*/

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, instrument, warn};

use crate::alarm::AlarmId;
use crate::schedule::{
    AlarmHandles, OutputState, ScheduleState, TimeOfDay, WeekendOverride, Window,
};
use crate::{Error, Result};

/// Address of the schedule record
pub const SCHEDULE_ADDRESS: usize = 0;

/// Capacity of the emulated EEPROM image
pub const EEPROM_SIZE: usize = 512;

const SLOTS: usize = AlarmHandles::MAX_PER_WINDOW;

/// Size of an encoded record
pub const RECORD_LEN: usize = 1 + 4 * 4 + 2 + 4 * (1 + 2 * SLOTS);

const UNSET: u8 = 0xFF;

const FLAG_PERSISTED: u8 = 0x01;
const FLAG_INITIALIZED: u8 = 0x02;
const FLAG_DST: u8 = 0x04;
const FLAG_WEEKEND: u8 = 0x08;
const FLAG_DAY_ACTIVE: u8 = 0x10;
const FLAG_NIGHT_ACTIVE: u8 = 0x20;

/// Key-addressed byte store
pub trait Store {
    /// Reads `len` bytes at `address`, or `None` when nothing was ever stored
    fn load(&self, address: usize, len: usize) -> Option<Vec<u8>>;

    /// Writes and commits `bytes` at `address`, returning whether the commit succeeded
    fn store(&mut self, address: usize, bytes: &[u8]) -> bool;
}

/// Encodes the full state into a fixed-size record
pub fn encode_record(state: &ScheduleState) -> Vec<u8> {
    let mut flags = 0;
    for (set, bit) in [
        (state.persisted, FLAG_PERSISTED),
        (state.initialized, FLAG_INITIALIZED),
        (state.dst_active, FLAG_DST),
        (state.weekend.is_some(), FLAG_WEEKEND),
        (state.output.day_active, FLAG_DAY_ACTIVE),
        (state.output.night_active, FLAG_NIGHT_ACTIVE),
    ] {
        if set {
            flags |= bit;
        }
    }

    let mut buf = Vec::with_capacity(RECORD_LEN);
    buf.push(flags);
    put_window(&mut buf, Some(&state.day));
    put_window(&mut buf, Some(&state.night));
    put_window(&mut buf, state.weekend.as_ref().map(|w| &w.day));
    put_window(&mut buf, state.weekend.as_ref().map(|w| &w.night));
    buf.push(state.day_intensity);
    buf.push(state.night_intensity);
    for ids in [
        &state.handles.day,
        &state.handles.night,
        &state.handles.weekend_day,
        &state.handles.weekend_night,
    ] {
        put_handles(&mut buf, ids);
    }
    debug_assert_eq!(buf.len(), RECORD_LEN);
    buf
}

/// Decodes a record, rejecting anything out of range
pub fn decode_record(bytes: &[u8]) -> Result<ScheduleState> {
    if bytes.len() < RECORD_LEN {
        return Err(Error::CorruptRecord(format!(
            "record is {} bytes, expected {}",
            bytes.len(),
            RECORD_LEN
        )));
    }
    let mut cur = Cursor::new(&bytes[..RECORD_LEN]);
    let flags = cur.read_u8()?;
    if flags & !(FLAG_PERSISTED
        | FLAG_INITIALIZED
        | FLAG_DST
        | FLAG_WEEKEND
        | FLAG_DAY_ACTIVE
        | FLAG_NIGHT_ACTIVE)
        != 0
    {
        return Err(Error::CorruptRecord(format!("unknown flags {:#04x}", flags)));
    }

    let day = get_window(&mut cur)?;
    let night = get_window(&mut cur)?;
    let weekend_day = get_window(&mut cur)?;
    let weekend_night = get_window(&mut cur)?;
    let (Some(day), Some(night)) = (day, night) else {
        return Err(Error::CorruptRecord("weekday windows unset".into()));
    };
    let weekend = if flags & FLAG_WEEKEND != 0 {
        match (weekend_day, weekend_night) {
            (Some(day), Some(night)) => Some(WeekendOverride { day, night }),
            _ => return Err(Error::CorruptRecord("weekend flagged but unset".into())),
        }
    } else {
        None
    };

    let day_intensity = get_intensity(&mut cur)?;
    let night_intensity = get_intensity(&mut cur)?;
    let handles = AlarmHandles {
        day: get_handles(&mut cur)?,
        night: get_handles(&mut cur)?,
        weekend_day: get_handles(&mut cur)?,
        weekend_night: get_handles(&mut cur)?,
    };

    Ok(ScheduleState {
        persisted: flags & FLAG_PERSISTED != 0,
        initialized: flags & FLAG_INITIALIZED != 0,
        dst_active: flags & FLAG_DST != 0,
        day,
        night,
        weekend,
        day_intensity,
        night_intensity,
        output: OutputState {
            day_active: flags & FLAG_DAY_ACTIVE != 0,
            night_active: flags & FLAG_NIGHT_ACTIVE != 0,
        },
        handles,
    })
}

fn put_window(buf: &mut Vec<u8>, window: Option<&Window>) {
    match window {
        Some(w) => buf.extend_from_slice(&[
            w.start.hour(),
            w.start.minute(),
            w.end.hour(),
            w.end.minute(),
        ]),
        None => buf.extend_from_slice(&[UNSET; 4]),
    }
}

fn put_handles(buf: &mut Vec<u8>, ids: &[AlarmId]) {
    let count = ids.len().min(SLOTS);
    if ids.len() > SLOTS {
        warn!("Dropping {} alarm handles beyond the record's capacity", ids.len() - SLOTS);
    }
    buf.push(count as u8);
    for slot in 0..SLOTS {
        let raw = ids.get(slot).filter(|_| slot < count).map_or(0, |id| id.raw());
        // writing into a Vec cannot fail
        let _ = buf.write_u16::<LittleEndian>(raw);
    }
}

fn get_window(cur: &mut Cursor<&[u8]>) -> Result<Option<Window>> {
    let mut raw = [0u8; 4];
    std::io::Read::read_exact(cur, &mut raw)?;
    if raw[0] == UNSET {
        return Ok(None);
    }
    let corrupt = |_| Error::CorruptRecord(format!("window bytes {:?}", raw));
    let start = TimeOfDay::new(raw[0], raw[1]).map_err(corrupt)?;
    let end = TimeOfDay::new(raw[2], raw[3]).map_err(corrupt)?;
    Ok(Some(Window::new(start, end)))
}

fn get_intensity(cur: &mut Cursor<&[u8]>) -> Result<u8> {
    let value = cur.read_u8()?;
    if !(1..=100).contains(&value) {
        return Err(Error::CorruptRecord(format!("intensity {}", value)));
    }
    Ok(value)
}

fn get_handles(cur: &mut Cursor<&[u8]>) -> Result<Vec<AlarmId>> {
    let count = cur.read_u8()? as usize;
    if count > SLOTS {
        return Err(Error::CorruptRecord(format!("{} alarm handles", count)));
    }
    let mut ids = Vec::with_capacity(count);
    for slot in 0..SLOTS {
        let raw = cur.read_u16::<LittleEndian>()?;
        if slot < count {
            ids.push(AlarmId::from_raw(raw));
        }
    }
    Ok(ids)
}

/// File-backed fixed-capacity image, emulating an EEPROM
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
    capacity: usize,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::with_capacity(path, EEPROM_SIZE)
    }

    pub fn with_capacity(path: impl AsRef<Path>, capacity: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            capacity,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Patches `bytes` into the image at `address` and commits it
    pub fn write_at(&mut self, address: usize, bytes: &[u8]) -> Result<()> {
        let end = address
            .checked_add(bytes.len())
            .filter(|end| *end <= self.capacity)
            .ok_or_else(|| {
                Error::Persistence(format!(
                    "write of {} bytes at {} exceeds capacity {}",
                    bytes.len(),
                    address,
                    self.capacity
                ))
            })?;
        self.read_image()
            .and_then(|mut image| {
                image[address..end].copy_from_slice(bytes);
                self.commit(&image)
            })
            .map_err(|e| Error::Persistence(format!("{}: {}", self.path.display(), e)))
    }

    fn read_image(&self) -> std::io::Result<Vec<u8>> {
        let mut image = match fs::read(&self.path) {
            Ok(image) => image,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        image.resize(self.capacity, 0);
        Ok(image)
    }

    fn commit(&self, image: &[u8]) -> std::io::Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(image)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
    }
}

impl Store for FileStore {
    fn load(&self, address: usize, len: usize) -> Option<Vec<u8>> {
        if !self.path.exists() {
            debug!("No image at {}", self.path.display());
            return None;
        }
        let image = match self.read_image() {
            Ok(image) => image,
            Err(e) => {
                error!("Failed to read {}: {}", self.path.display(), e);
                return None;
            }
        };
        image.get(address..address.checked_add(len)?).map(<[u8]>::to_vec)
    }

    #[instrument(skip(self, bytes), fields(path = %self.path.display(), len = bytes.len()))]
    fn store(&mut self, address: usize, bytes: &[u8]) -> bool {
        match self.write_at(address, bytes) {
            Ok(()) => {
                debug!("Committed {} bytes at {}", bytes.len(), address);
                true
            }
            Err(e) => {
                error!("{}", e);
                false
            }
        }
    }
}

/// In-memory image, for tests and dry runs
#[derive(Debug, Clone)]
pub struct MemoryStore {
    image: Vec<u8>,
    written: bool,
    /// Makes the next commit fail
    pub fail_next_commit: bool,
    /// Number of successful commits
    pub commits: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            image: vec![0; EEPROM_SIZE],
            written: false,
            fail_next_commit: false,
            commits: 0,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn load(&self, address: usize, len: usize) -> Option<Vec<u8>> {
        if !self.written {
            return None;
        }
        self.image
            .get(address..address.checked_add(len)?)
            .map(<[u8]>::to_vec)
    }

    fn store(&mut self, address: usize, bytes: &[u8]) -> bool {
        if self.fail_next_commit {
            self.fail_next_commit = false;
            return false;
        }
        let Some(target) = address
            .checked_add(bytes.len())
            .and_then(|end| self.image.get_mut(address..end))
        else {
            return false;
        };
        target.copy_from_slice(bytes);
        self.written = true;
        self.commits += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    fn sample() -> ScheduleState {
        ScheduleState {
            persisted: true,
            initialized: true,
            dst_active: true,
            day: Window::new(t("08:00"), t("20:00")),
            night: Window::new(t("20:00"), t("08:00")),
            weekend: Some(WeekendOverride {
                day: Window::new(t("10:00"), t("22:30")),
                night: Window::new(t("22:30"), t("10:00")),
            }),
            day_intensity: 80,
            night_intensity: 30,
            output: OutputState {
                day_active: false,
                night_active: true,
            },
            handles: AlarmHandles {
                day: vec![AlarmId::from_raw(0), AlarmId::from_raw(1)],
                night: vec![AlarmId::from_raw(2), AlarmId::from_raw(3)],
                weekend_day: (4..10).map(AlarmId::from_raw).collect(),
                weekend_night: (10..15).map(AlarmId::from_raw).collect(),
            },
        }
    }

    #[test]
    fn test_record_has_fixed_length() {
        assert_eq!(encode_record(&sample()).len(), RECORD_LEN);
        assert_eq!(encode_record(&ScheduleState::default()).len(), RECORD_LEN);
    }

    #[test]
    fn test_record_round_trip() {
        let state = sample();
        assert_eq!(decode_record(&encode_record(&state)).unwrap(), state);
    }

    #[test]
    fn test_absent_weekend_uses_sentinel() {
        let mut state = sample();
        state.weekend = None;
        let bytes = encode_record(&state);
        assert_eq!(&bytes[9..17], &[UNSET; 8]);
        assert_eq!(decode_record(&bytes).unwrap().weekend, None);
    }

    #[test]
    fn test_erased_images_are_rejected() {
        assert!(decode_record(&[0xFF; RECORD_LEN]).is_err());
        assert!(decode_record(&[0x00; RECORD_LEN]).is_err());
        assert!(decode_record(&[0x01; 4]).is_err());
    }

    #[test]
    fn test_memory_store_commit_failure() {
        let mut store = MemoryStore::new();
        assert!(store.load(SCHEDULE_ADDRESS, RECORD_LEN).is_none());
        store.fail_next_commit = true;
        assert!(!store.store(SCHEDULE_ADDRESS, &[1, 2, 3]));
        assert!(store.load(SCHEDULE_ADDRESS, 3).is_none());
        assert!(store.store(SCHEDULE_ADDRESS, &[1, 2, 3]));
        assert_eq!(store.load(SCHEDULE_ADDRESS, 3), Some(vec![1, 2, 3]));
        assert_eq!(store.commits, 1);
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(dir.path().join("image.bin"));
        assert!(store.load(SCHEDULE_ADDRESS, RECORD_LEN).is_none());

        let bytes = encode_record(&sample());
        assert!(store.store(16, &bytes));
        assert_eq!(store.load(16, RECORD_LEN), Some(bytes));
        assert_eq!(fs::metadata(store.path()).unwrap().len(), EEPROM_SIZE as u64);
    }

    #[test]
    fn test_file_store_rejects_writes_past_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::with_capacity(dir.path().join("image.bin"), 32);
        assert!(!store.store(0, &encode_record(&sample())));
        assert!(store.load(0, 1).is_none());
        assert!(matches!(
            store.write_at(16, &[0; 17]),
            Err(Error::Persistence(_))
        ));
        assert!(store.write_at(16, &[0; 16]).is_ok());
    }

    #[test]
    fn test_file_store_reports_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(dir.path().join("missing").join("image.bin"));
        assert!(matches!(
            store.write_at(SCHEDULE_ADDRESS, &[1, 2, 3]),
            Err(Error::Persistence(_))
        ));
        assert!(!store.store(SCHEDULE_ADDRESS, &[1, 2, 3]));
    }
}
