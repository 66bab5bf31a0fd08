use std::fs::File;
use std::io::Write;

use log::trace;
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::{Direction, EdgeMode};
use crate::error::Error;
use crate::gpio::{GpioDriver, normalize_value};

/// Driver operations, for failure injection and call counting.
#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    Export,
    Unexport,
    SetDirection,
    Direction,
    SetValue,
    Value,
    SetEdge,
    Edge,
    OpenEdgeSource,
}

impl MockOp {
    pub const READS: [MockOp; 3] = [MockOp::Direction, MockOp::Value, MockOp::Edge];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockPinState {
    pub direction: Direction,
    pub value: u8,
    pub edge: EdgeMode,
}

impl Default for MockPinState {
    fn default() -> Self {
        Self {
            direction: Direction::Input,
            value: 0,
            edge: EdgeMode::None,
        }
    }
}

#[derive(Default)]
struct MockPin {
    state: MockPinState,
    // write end of the pipe handed out by the last open_edge_source
    edge_writer: Option<File>,
}

/// In-memory stand-in for the kernel. Pins behave like exported sysfs
/// directories: every attribute access on an unexported pin fails.
#[derive(Default)]
pub struct MockGpioDriver {
    pins: RwLock<FxHashMap<u32, MockPin>>,
    failing: RwLock<FxHashSet<MockOp>>,
    calls: Mutex<FxHashMap<MockOp, usize>>,
}

impl MockGpioDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later `op` fail with a general error.
    pub fn fail(&self, op: MockOp) {
        self.failing.write().insert(op);
    }

    pub fn fail_reads(&self) {
        self.failing.write().extend(MockOp::READS);
    }

    pub fn heal(&self) {
        self.failing.write().clear();
    }

    /// Number of times `op` was invoked, failed calls included.
    pub fn calls(&self, op: MockOp) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    pub fn is_exported(&self, pin: u32) -> bool {
        self.pins.read().contains_key(&pin)
    }

    pub fn state(&self, pin: u32) -> Option<MockPinState> {
        self.pins.read().get(&pin).map(|p| p.state.clone())
    }

    /// Sets the level seen by reads of an input pin, without an edge.
    pub fn set_level(&self, pin: u32, value: u8) -> Result<(), Error> {
        let mut pins = self.pins.write();
        let entry = pins.get_mut(&pin).ok_or_else(|| not_exported(pin))?;
        entry.state.value = normalize_value(value);
        Ok(())
    }

    /// Changes the level of `pin` and signals the edge source handed out for
    /// it, if one is open.
    pub fn trigger_edge(&self, pin: u32, value: u8) -> Result<(), Error> {
        let mut pins = self.pins.write();
        let entry = pins.get_mut(&pin).ok_or_else(|| not_exported(pin))?;
        let value = normalize_value(value);
        entry.state.value = value;

        if let Some(writer) = entry.edge_writer.as_mut() {
            writer
                .write_all(&[b'0' + value])
                .map_err(|e| Error::General(format!("signal edge on pin {pin}: {e}")))?;
        }
        trace!("mock edge on pin {pin}, level {value}");
        Ok(())
    }

    fn enter(&self, op: MockOp, pin: u32) -> Result<(), Error> {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        if self.failing.read().contains(&op) {
            return Err(Error::General(format!("injected {op:?} failure on pin {pin}")));
        }
        Ok(())
    }

    fn with_pin<T>(&self, pin: u32, f: impl FnOnce(&mut MockPin) -> Result<T, Error>) -> Result<T, Error> {
        let mut pins = self.pins.write();
        let entry = pins.get_mut(&pin).ok_or_else(|| not_exported(pin))?;
        f(entry)
    }
}

fn not_exported(pin: u32) -> Error {
    Error::General(format!("pin {pin} is not exported"))
}

impl GpioDriver for MockGpioDriver {
    fn export(&self, pin: u32) -> Result<(), Error> {
        self.enter(MockOp::Export, pin)?;
        let mut pins = self.pins.write();
        if pins.contains_key(&pin) {
            return Err(Error::General(format!("pin {pin} busy")));
        }
        pins.insert(pin, MockPin::default());
        Ok(())
    }

    fn unexport(&self, pin: u32) -> Result<(), Error> {
        self.enter(MockOp::Unexport, pin)?;
        self.pins
            .write()
            .remove(&pin)
            .map(|_| ())
            .ok_or_else(|| not_exported(pin))
    }

    fn set_direction(&self, pin: u32, direction: Direction) -> Result<(), Error> {
        self.enter(MockOp::SetDirection, pin)?;
        self.with_pin(pin, |p| {
            p.state.direction = direction;
            if direction == Direction::Output {
                p.state.value = 0;
            }
            Ok(())
        })
    }

    fn direction(&self, pin: u32) -> Result<Direction, Error> {
        self.enter(MockOp::Direction, pin)?;
        self.with_pin(pin, |p| Ok(p.state.direction))
    }

    fn set_value(&self, pin: u32, value: u8) -> Result<(), Error> {
        self.enter(MockOp::SetValue, pin)?;
        self.with_pin(pin, |p| {
            if p.state.direction != Direction::Output {
                return Err(Error::General(format!("pin {pin} value is read-only")));
            }
            p.state.value = value;
            Ok(())
        })
    }

    fn value(&self, pin: u32) -> Result<u8, Error> {
        self.enter(MockOp::Value, pin)?;
        self.with_pin(pin, |p| Ok(p.state.value))
    }

    fn set_edge(&self, pin: u32, edge: EdgeMode) -> Result<(), Error> {
        self.enter(MockOp::SetEdge, pin)?;
        self.with_pin(pin, |p| {
            p.state.edge = edge;
            Ok(())
        })
    }

    fn edge(&self, pin: u32) -> Result<EdgeMode, Error> {
        self.enter(MockOp::Edge, pin)?;
        self.with_pin(pin, |p| Ok(p.state.edge))
    }

    fn open_edge_source(&self, pin: u32) -> Result<File, Error> {
        self.enter(MockOp::OpenEdgeSource, pin)?;
        self.with_pin(pin, |p| {
            let (reader, writer) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)
                .map_err(|e| Error::General(format!("edge pipe for pin {pin}: {e}")))?;
            p.edge_writer = Some(File::from(writer));
            Ok(File::from(reader))
        })
    }
}
