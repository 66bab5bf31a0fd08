use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use log::{error, trace};
use nix::fcntl::OFlag;

use crate::config::{DEFAULT_SYSFS_ROOT, Direction, EdgeMode};
use crate::error::Error;
use crate::gpio::GpioDriver;

const EXPORT: &str = "export";
const UNEXPORT: &str = "unexport";
const DIRECTION: &str = "direction";
const VALUE: &str = "value";
const EDGE: &str = "edge";

/// Driver for the legacy `/sys/class/gpio` interface. Every attribute is
/// opened, accessed once and closed again.
#[derive(Debug, Clone)]
pub struct SysfsGpioDriver {
    root: PathBuf,
}

impl Default for SysfsGpioDriver {
    fn default() -> Self {
        Self::new(DEFAULT_SYSFS_ROOT)
    }
}

impl SysfsGpioDriver {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn attribute_path(&self, pin: u32, attribute: &str) -> PathBuf {
        self.root.join(format!("gpio{pin}")).join(attribute)
    }

    fn write_file(&self, path: &Path, pin: u32, contents: &str) -> Result<(), Error> {
        trace!("write {contents:?} to {}", path.display());
        OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(path)
            .and_then(|mut file| file.write_all(contents.as_bytes()))
            .map_err(|e| {
                error!("Cant write {} for pin {pin}: {e}", path.display());
                Error::General(format!("write {}: {e}", path.display()))
            })
    }

    fn read_file(&self, path: &Path, pin: u32) -> Result<String, Error> {
        fs::read_to_string(path).map_err(|e| {
            error!("Cant read {} for pin {pin}: {e}", path.display());
            Error::General(format!("read {}: {e}", path.display()))
        })
    }
}

impl GpioDriver for SysfsGpioDriver {
    fn export(&self, pin: u32) -> Result<(), Error> {
        self.write_file(&self.root.join(EXPORT), pin, &pin.to_string())
    }

    fn unexport(&self, pin: u32) -> Result<(), Error> {
        self.write_file(&self.root.join(UNEXPORT), pin, &pin.to_string())
    }

    fn set_direction(&self, pin: u32, direction: Direction) -> Result<(), Error> {
        self.write_file(&self.attribute_path(pin, DIRECTION), pin, direction.as_str())
    }

    fn direction(&self, pin: u32) -> Result<Direction, Error> {
        self.read_file(&self.attribute_path(pin, DIRECTION), pin)?
            .parse()
    }

    fn set_value(&self, pin: u32, value: u8) -> Result<(), Error> {
        self.write_file(&self.attribute_path(pin, VALUE), pin, &value.to_string())
    }

    fn value(&self, pin: u32) -> Result<u8, Error> {
        let raw = self.read_file(&self.attribute_path(pin, VALUE), pin)?;
        raw.trim().parse().map_err(|e| {
            error!("Bad value {raw:?} on pin {pin}");
            Error::General(format!("bad value {raw:?} on pin {pin}: {e}"))
        })
    }

    fn set_edge(&self, pin: u32, edge: EdgeMode) -> Result<(), Error> {
        self.write_file(&self.attribute_path(pin, EDGE), pin, edge.as_str())
    }

    fn edge(&self, pin: u32) -> Result<EdgeMode, Error> {
        let raw = self.read_file(&self.attribute_path(pin, EDGE), pin)?;
        raw.parse().inspect_err(|_| {
            error!("Unknown edge {raw:?} on pin {pin}");
        })
    }

    fn open_edge_source(&self, pin: u32) -> Result<File, Error> {
        let path = self.attribute_path(pin, VALUE);
        OpenOptions::new()
            .read(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(&path)
            .map_err(|e| {
                error!("Cant open {} for pin {pin}: {e}", path.display());
                Error::General(format!("open {}: {e}", path.display()))
            })
    }
}
