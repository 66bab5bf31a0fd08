use std::{fmt, fs, path::Path, path::PathBuf, str::FromStr};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/gpio";
pub const DEFAULT_THREAD_STACK_SIZE: usize = 16 * 1024;

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    #[serde(rename = "in")]
    Input,
    #[serde(rename = "out")]
    Output,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Input => "in",
            Direction::Output => "out",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "in" => Ok(Direction::Input),
            "out" => Ok(Direction::Output),
            other => Err(Error::General(format!("unknown direction {other:?}"))),
        }
    }
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeMode {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

impl EdgeMode {
    pub const ALL: [EdgeMode; 4] = [
        EdgeMode::None,
        EdgeMode::Rising,
        EdgeMode::Falling,
        EdgeMode::Both,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeMode::None => "none",
            EdgeMode::Rising => "rising",
            EdgeMode::Falling => "falling",
            EdgeMode::Both => "both",
        }
    }
}

impl fmt::Display for EdgeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        EdgeMode::ALL
            .into_iter()
            .find(|edge| edge.as_str() == s)
            .ok_or_else(|| Error::General(format!("unknown edge {s:?}")))
    }
}

/// How a second `open` of an already tracked pin is handled.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OpenPolicy {
    /// One user per pin, a second open fails.
    #[default]
    Exclusive,
    /// Every open shares the same handle, close counts users down.
    Shared,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct GpioConfig {
    pub sysfs_root: PathBuf,
    pub policy: OpenPolicy,
    pub discard_initial_event: bool,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from(DEFAULT_SYSFS_ROOT),
            policy: OpenPolicy::Exclusive,
            discard_initial_event: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ThreadConfig {
    pub stack_size: usize,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            stack_size: DEFAULT_THREAD_STACK_SIZE,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PinConfig {
    pub name: String,
    pub direction: Direction,
    #[serde(default)]
    pub edge: EdgeMode,
    #[serde(default)]
    pub value: u8,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub gpio: GpioConfig,
    #[serde(default)]
    pub threads: ThreadConfig,
    #[serde(default)]
    pub pins: FxHashMap<u32, PinConfig>,
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;
        serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("Invalid config json: {e}")))
    }
}
