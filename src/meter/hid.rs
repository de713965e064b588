//! USB sound-level meter over Linux hidraw
//!
//! Readings are requested with a GET_REPORT for input report 5. The kernel returns
//! the report id followed by the payload: payload bytes 0..4 carry the reading's
//! unix time in seconds and bytes 6..8 the level in tenths of a decibel, both
//! big-endian.

use super::{LevelDevice, LevelSample, ReadError};
use anyhow::{Context, Result, anyhow};
use jiff::Timestamp;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub const DEFAULT_VENDOR_ID: u16 = 0x10c4;
pub const DEFAULT_PRODUCT_ID: u16 = 0x82cd;

const HIDRAW_CLASS_DIR: &str = "/sys/class/hidraw";
const REPORT_BUFFER_LEN: usize = 64;

/// Input report carrying the current reading
pub const LEVEL_REPORT_ID: u8 = 0x05;

// HIDIOCGINPUT(len): _IOC(_IOC_WRITE | _IOC_READ, 'H', 0x0A, len)
nix::ioctl_readwrite_buf!(hid_get_input_report, b'H', 0x0A, u8);

/// Decode a report as returned by hidraw, report id first
pub fn decode_numbered_report(report: &[u8]) -> Result<LevelSample, ReadError> {
    let Some((&id, payload)) = report.split_first() else {
        return Err(ReadError::ShortReport(0));
    };
    if id != LEVEL_REPORT_ID {
        return Err(ReadError::UnexpectedReport(id));
    }
    decode_report(payload)
}

/// Decode one input report payload into a level sample
pub fn decode_report(report: &[u8]) -> Result<LevelSample, ReadError> {
    if report.len() <= 8 {
        return Err(ReadError::ShortReport(report.len()));
    }

    let seconds = u32::from_be_bytes([report[0], report[1], report[2], report[3]]);
    let decibels = u16::from_be_bytes([report[6], report[7]]);
    let timestamp =
        Timestamp::from_second(i64::from(seconds)).map_err(|_| ReadError::Timestamp(seconds))?;

    Ok(LevelSample {
        timestamp,
        level: f64::from(decibels) / 10.0,
    })
}

/// Sound-level meter attached through hidraw
///
/// Without a device every read reports [`ReadError::Disconnected`]; a fatal I/O
/// error drops the handle and the meter stays in that mode.
pub struct HidMeter {
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
}

impl HidMeter {
    /// Find and open the first hidraw node with the given USB ids
    pub fn open(vendor_id: u16, product_id: u16) -> Result<Self> {
        let path = find_hidraw(Path::new(HIDRAW_CLASS_DIR), vendor_id, product_id)?
            .ok_or_else(|| {
                anyhow!(
                    "No hidraw device with id {:04x}:{:04x}",
                    vendor_id,
                    product_id
                )
            })?;
        Self::open_path(path)
    }

    /// Open a specific hidraw node
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        info!(device = %path.display(), "sound level meter opened");
        Ok(Self {
            path: Some(path),
            file: Mutex::new(Some(file)),
        })
    }

    /// Open the meter, or fall back to no-device mode when it is unavailable
    pub fn open_or_disconnected(vendor_id: u16, product_id: u16) -> Self {
        match Self::open(vendor_id, product_id) {
            Ok(meter) => meter,
            Err(e) => {
                warn!("Sound level meter unavailable: {:#}", e);
                Self::disconnected()
            }
        }
    }

    pub fn disconnected() -> Self {
        Self {
            path: None,
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl LevelDevice for HidMeter {
    fn read(&self) -> Result<LevelSample, ReadError> {
        let mut guard = self.file.lock().map_err(|_| ReadError::Disconnected)?;
        let Some(file) = guard.as_mut() else {
            return Err(ReadError::Disconnected);
        };

        match request_report(file) {
            Ok(report) => decode_numbered_report(&report),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(ReadError::NoReport),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Err(ReadError::NoReport),
            Err(e) => {
                warn!("Sound level meter read failed, disconnecting: {}", e);
                *guard = None;
                Err(ReadError::Io(e))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.file.lock().map(|file| file.is_some()).unwrap_or(false)
    }
}

/// Ask the device for a fresh level report
fn request_report(file: &File) -> io::Result<Vec<u8>> {
    let mut report = vec![0u8; REPORT_BUFFER_LEN];
    report[0] = LEVEL_REPORT_ID;

    // SAFETY: `report` is a valid, exclusively borrowed buffer for the whole call and
    // the ioctl encodes its length, so the kernel never writes past it.
    let len = unsafe { hid_get_input_report(file.as_raw_fd(), &mut report) }?;
    report.truncate(usize::try_from(len).unwrap_or(0).min(REPORT_BUFFER_LEN));
    Ok(report)
}

/// Scan hidraw class entries for a matching `HID_ID` in their uevent
fn find_hidraw(class_dir: &Path, vendor_id: u16, product_id: u16) -> Result<Option<PathBuf>> {
    let entries = match fs::read_dir(class_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", class_dir.display()));
        }
    };

    let mut names: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name())
        .collect();
    names.sort();

    for name in names {
        let uevent = class_dir.join(&name).join("device").join("uevent");
        let Ok(contents) = fs::read_to_string(&uevent) else {
            continue;
        };
        if let Some((vendor, product)) = parse_hid_id(&contents) {
            debug!(node = ?name, vendor, product, "hidraw device");
            if vendor == vendor_id && product == product_id {
                return Ok(Some(Path::new("/dev").join(name)));
            }
        }
    }

    Ok(None)
}

/// Parse `HID_ID=<bus>:<vendor>:<product>` from a uevent file
fn parse_hid_id(uevent: &str) -> Option<(u16, u16)> {
    let id = uevent
        .lines()
        .find_map(|line| line.strip_prefix("HID_ID="))?;
    let mut parts = id.trim().split(':');
    let _bus = parts.next()?;
    let vendor = u32::from_str_radix(parts.next()?, 16).ok()?;
    let product = u32::from_str_radix(parts.next()?, 16).ok()?;
    Some((u16::try_from(vendor).ok()?, u16::try_from(product).ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(seconds: u32, decibels: u16) -> Vec<u8> {
        let mut report = vec![0u8; 16];
        report[..4].copy_from_slice(&seconds.to_be_bytes());
        report[4] = 0xaa;
        report[5] = 0x55;
        report[6..8].copy_from_slice(&decibels.to_be_bytes());
        report
    }

    #[test]
    fn test_decode_report() {
        let sample = decode_report(&report(1_700_000_000, 653)).unwrap();
        assert_eq!(sample.timestamp.as_second(), 1_700_000_000);
        assert_eq!(sample.level, 65.3);
    }

    #[test]
    fn test_short_report_is_rejected() {
        assert!(matches!(
            decode_report(&[0u8; 8]),
            Err(ReadError::ShortReport(8))
        ));
        assert!(matches!(decode_report(&[]), Err(ReadError::ShortReport(0))));
    }

    #[test]
    fn test_minimum_report_length() {
        let mut short = report(1, 400);
        short.truncate(9);
        assert_eq!(decode_report(&short).unwrap().level, 40.0);
    }

    #[test]
    fn test_parse_hid_id() {
        let uevent = "DRIVER=hid-generic\nHID_ID=0003:000010C4:000082CD\nHID_NAME=Meter\n";
        assert_eq!(parse_hid_id(uevent), Some((0x10c4, 0x82cd)));
        assert_eq!(parse_hid_id("HID_NAME=Meter\n"), None);
        assert_eq!(parse_hid_id("HID_ID=0003:zz:01\n"), None);
    }

    #[test]
    fn test_find_hidraw_in_class_dir() {
        let dir = tempfile::tempdir().unwrap();
        for (node, id) in [
            ("hidraw0", "0003:0000046D:0000C52B"),
            ("hidraw1", "0003:000010C4:000082CD"),
        ] {
            let device = dir.path().join(node).join("device");
            fs::create_dir_all(&device).unwrap();
            fs::write(device.join("uevent"), format!("HID_ID={}\n", id)).unwrap();
        }

        let found = find_hidraw(dir.path(), DEFAULT_VENDOR_ID, DEFAULT_PRODUCT_ID).unwrap();
        assert_eq!(found, Some(PathBuf::from("/dev/hidraw1")));
        assert_eq!(find_hidraw(dir.path(), 0x1234, 0x5678).unwrap(), None);
    }

    #[test]
    fn test_missing_class_dir_finds_nothing() {
        let found = find_hidraw(Path::new("/nonexistent/hidraw"), 1, 2).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_disconnected_meter_reads_nothing() {
        let meter = HidMeter::disconnected();
        assert!(!meter.is_connected());
        assert!(matches!(meter.read(), Err(ReadError::Disconnected)));
    }

    #[test]
    fn test_non_hid_node_disconnects_on_first_read() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("not-hidraw");
        fs::write(&node, report(1_700_000_100, 712)).unwrap();

        let meter = HidMeter::open_path(&node).unwrap();
        assert!(meter.is_connected());
        // GET_REPORT is not supported on a regular file
        assert!(matches!(meter.read(), Err(ReadError::Io(_))));
        assert!(!meter.is_connected());
        assert!(matches!(meter.read(), Err(ReadError::Disconnected)));
    }

    #[test]
    fn test_numbered_report_skips_report_id() {
        let mut numbered = vec![LEVEL_REPORT_ID];
        numbered.extend(report(1_700_000_000, 653));

        let sample = decode_numbered_report(&numbered).unwrap();
        assert_eq!(sample.timestamp.as_second(), 1_700_000_000);
        assert_eq!(sample.level, 65.3);
    }

    #[test]
    fn test_numbered_report_length_excludes_report_id() {
        let mut numbered = vec![LEVEL_REPORT_ID];
        numbered.extend(&report(1, 400)[..8]);
        assert!(matches!(
            decode_numbered_report(&numbered),
            Err(ReadError::ShortReport(8))
        ));
        assert!(matches!(
            decode_numbered_report(&[]),
            Err(ReadError::ShortReport(0))
        ));
    }

    #[test]
    fn test_numbered_report_with_other_id_is_rejected() {
        let mut numbered = vec![0x01];
        numbered.extend(report(1_700_000_000, 653));
        assert!(matches!(
            decode_numbered_report(&numbered),
            Err(ReadError::UnexpectedReport(0x01))
        ));
    }
}
