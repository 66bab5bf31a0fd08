use std::fs::File;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error, warn};
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use rustc_hash::FxHashMap;

use crate::config::{Direction, EdgeMode, GpioConfig, OpenPolicy};
use crate::edge::EdgeWaitCoordinator;
use crate::error::Error;

pub const VALUE_CLEAR: u8 = 0;
pub const VALUE_SET: u8 = 1;

/// Collapses any non-zero level to [`VALUE_SET`].
pub fn normalize_value(value: u8) -> u8 {
    if value == VALUE_CLEAR {
        VALUE_CLEAR
    } else {
        VALUE_SET
    }
}

/// Kernel-facing pin operations. Each call is one attribute access, with no
/// knowledge of handles or open policy.
pub trait GpioDriver: Send + Sync {
    fn export(&self, pin: u32) -> Result<(), Error>;
    fn unexport(&self, pin: u32) -> Result<(), Error>;
    fn set_direction(&self, pin: u32, direction: Direction) -> Result<(), Error>;
    fn direction(&self, pin: u32) -> Result<Direction, Error>;
    fn set_value(&self, pin: u32, value: u8) -> Result<(), Error>;
    fn value(&self, pin: u32) -> Result<u8, Error>;
    fn set_edge(&self, pin: u32, edge: EdgeMode) -> Result<(), Error>;
    fn edge(&self, pin: u32) -> Result<EdgeMode, Error>;
    /// Opens the pin value non-blocking, ready to be polled for edges.
    fn open_edge_source(&self, pin: u32) -> Result<File, Error>;
}

/// Opaque handle on an open pin. A handle outlives its pin once the pin is
/// closed; the generation makes such stale handles detectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PinHandle {
    pin: u32,
    generation: u64,
}

impl PinHandle {
    pub fn pin(&self) -> u32 {
        self.pin
    }
}

#[derive(Debug)]
struct Pin {
    generation: u64,
    direction: Direction,
    edge: EdgeMode,
    value: u8,
    waiting: bool,
    users: usize,
}

pub struct PinRegistry<D: GpioDriver + ?Sized> {
    driver: Arc<D>,
    policy: OpenPolicy,
    coordinator: EdgeWaitCoordinator,
    pins: RwLock<FxHashMap<u32, Pin>>,
    next_generation: AtomicU64,
}

fn live(pins: &FxHashMap<u32, Pin>, handle: PinHandle) -> Result<&Pin, Error> {
    pins.get(&handle.pin)
        .filter(|pin| pin.generation == handle.generation)
        .ok_or(Error::Handle(handle.pin))
}

fn live_mut(pins: &mut FxHashMap<u32, Pin>, handle: PinHandle) -> Result<&mut Pin, Error> {
    pins.get_mut(&handle.pin)
        .filter(|pin| pin.generation == handle.generation)
        .ok_or(Error::Handle(handle.pin))
}

impl<D: GpioDriver + ?Sized> PinRegistry<D> {
    pub fn new(driver: Arc<D>, config: &GpioConfig) -> Self {
        Self {
            driver,
            policy: config.policy,
            coordinator: EdgeWaitCoordinator::new(config.discard_initial_event),
            pins: RwLock::new(FxHashMap::default()),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn policy(&self) -> OpenPolicy {
        self.policy
    }

    pub fn coordinator(&self) -> &EdgeWaitCoordinator {
        &self.coordinator
    }

    /// Opens `pin`, exporting and configuring it on first use.
    ///
    /// `edge` is applied to input pins and `value` to output pins; the other
    /// one is only cached. A pin that fails any setup step is unexported
    /// again before the error is returned.
    pub fn open(
        &self,
        pin: u32,
        direction: Direction,
        edge: EdgeMode,
        value: u8,
    ) -> Result<PinHandle, Error> {
        let mut pins = self.pins.write();

        if let Some(existing) = pins.get_mut(&pin) {
            return match self.policy {
                OpenPolicy::Exclusive => {
                    error!("Pin {pin} already in use");
                    Err(Error::Used(pin))
                }
                OpenPolicy::Shared => {
                    existing.users += 1;
                    debug!("Pin {pin} shared, {} users", existing.users);
                    Ok(PinHandle {
                        pin,
                        generation: existing.generation,
                    })
                }
            };
        }

        let value = normalize_value(value);
        if let Err(e) = self.setup(pin, direction, edge, value) {
            error!("Failed to set up pin {pin}: {e}");
            if let Err(e) = self.driver.unexport(pin) {
                warn!("unexport of pin {pin} after failed setup: {e}");
            }
            return Err(e);
        }

        // setup only arms the edge of inputs
        let edge = match direction {
            Direction::Input => edge,
            Direction::Output => EdgeMode::None,
        };
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        pins.insert(
            pin,
            Pin {
                generation,
                direction,
                edge,
                value,
                waiting: false,
                users: 1,
            },
        );
        debug!("Opened pin {pin} as {direction}, edge {edge}");

        Ok(PinHandle { pin, generation })
    }

    fn setup(&self, pin: u32, direction: Direction, edge: EdgeMode, value: u8) -> Result<(), Error> {
        self.driver.export(pin)?;
        self.driver.set_direction(pin, direction)?;
        match direction {
            Direction::Output => self.driver.set_value(pin, value),
            Direction::Input => self.driver.set_edge(pin, edge),
        }
    }

    /// Drops one user of the pin; the last one unexports it.
    ///
    /// A wait still in flight on the pin is interrupted first.
    pub fn close(&self, handle: PinHandle) -> Result<(), Error> {
        let mut pins = self.pins.write();
        let pin = live_mut(&mut pins, handle).inspect_err(|_| {
            warn!("close on stale handle for pin {}", handle.pin);
        })?;

        if pin.users > 1 {
            pin.users -= 1;
            debug!("Pin {} still has {} users", handle.pin, pin.users);
            return Ok(());
        }

        if pin.waiting {
            self.coordinator.interrupt(handle.pin)?;
        }
        pins.remove(&handle.pin);
        debug!("Closed pin {}", handle.pin);

        self.driver.unexport(handle.pin)
    }

    /// Writes `value` to an output pin; any non-zero value sets the line.
    pub fn set_value(&self, handle: PinHandle, value: u8) -> Result<(), Error> {
        let mut pins = self.pins.write();
        let pin = live_mut(&mut pins, handle)?;

        if pin.direction != Direction::Output {
            return Err(Error::Direction(handle.pin));
        }

        let value = normalize_value(value);
        self.driver.set_value(handle.pin, value)?;
        pin.value = value;
        Ok(())
    }

    /// Live level of an input pin, or the last written level of an output pin.
    pub fn value(&self, handle: PinHandle) -> Result<u8, Error> {
        let pins = self.pins.upgradable_read();
        let pin = live(&pins, handle)?;

        // output value attribute only ever holds what we last wrote
        if pin.direction == Direction::Output {
            return Ok(pin.value);
        }

        let value = self.driver.value(handle.pin)?;
        let mut pins = RwLockUpgradableReadGuard::upgrade(pins);
        if let Ok(pin) = live_mut(&mut pins, handle) {
            pin.value = value;
        }
        Ok(value)
    }

    pub fn set_direction(&self, handle: PinHandle, direction: Direction) -> Result<(), Error> {
        let mut pins = self.pins.write();
        let pin = live_mut(&mut pins, handle)?;

        if pin.waiting {
            return Err(Error::Waiting(handle.pin));
        }
        if pin.direction == direction {
            return Ok(());
        }

        self.driver.set_direction(handle.pin, direction)?;
        pin.direction = direction;
        if direction == Direction::Output {
            // "out" drives the line low
            pin.value = VALUE_CLEAR;
        }
        Ok(())
    }

    pub fn direction(&self, handle: PinHandle) -> Result<Direction, Error> {
        let pins = self.pins.read();
        Ok(live(&pins, handle)?.direction)
    }

    pub fn set_edge(&self, handle: PinHandle, edge: EdgeMode) -> Result<(), Error> {
        let mut pins = self.pins.write();
        let pin = live_mut(&mut pins, handle)?;

        if pin.direction == Direction::Output {
            return Err(Error::Direction(handle.pin));
        }
        if pin.waiting {
            return Err(Error::Waiting(handle.pin));
        }
        if pin.edge == edge {
            return Ok(());
        }

        self.driver.set_edge(handle.pin, edge)?;
        pin.edge = edge;
        Ok(())
    }

    pub fn edge(&self, handle: PinHandle) -> Result<EdgeMode, Error> {
        let pins = self.pins.read();
        Ok(live(&pins, handle)?.edge)
    }

    pub fn is_waiting(&self, handle: PinHandle) -> Result<bool, Error> {
        let pins = self.pins.read();
        Ok(live(&pins, handle)?.waiting)
    }

    /// Blocks the calling thread until `edge` occurs on an input pin and
    /// returns the level read after it.
    ///
    /// The edge attribute is only rewritten when `edge` differs from the
    /// cached mode. The registry lock is not held while blocked, and the
    /// waiting flag is cleared however the wait ends.
    pub fn wait_for_edge(&self, handle: PinHandle, edge: EdgeMode) -> Result<u8, Error> {
        {
            let mut pins = self.pins.write();
            let pin = live_mut(&mut pins, handle)?;

            if pin.direction != Direction::Input {
                return Err(Error::Direction(handle.pin));
            }
            if pin.waiting {
                return Err(Error::Waiting(handle.pin));
            }
            if pin.edge != edge {
                self.driver.set_edge(handle.pin, edge)?;
                pin.edge = edge;
            }
            pin.waiting = true;
        }

        let result = self.coordinator.wait_for_edge(&*self.driver, handle.pin);

        let mut pins = self.pins.write();
        if let Ok(pin) = live_mut(&mut pins, handle) {
            pin.waiting = false;
            if let Ok(value) = result {
                pin.value = value;
            }
        }

        result
    }

    /// Ends an in-flight wait on `pin`, if there is one.
    pub fn interrupt(&self, pin: u32) -> Result<(), Error> {
        self.coordinator.interrupt(pin)
    }

    /// Pin numbers currently open, ascending.
    pub fn open_pins(&self) -> Vec<u32> {
        let mut open: Vec<u32> = self.pins.read().keys().copied().collect();
        open.sort_unstable();
        open
    }
}
