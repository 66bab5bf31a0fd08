use std::fs::File;
use std::io::{self, ErrorKind, Read, Seek, SeekFrom};
use std::os::fd::AsRawFd;

use log::{debug, error, trace};
use mio::{Events, Interest, Poll, Token, Waker, unix::SourceFd};
use nix::errno::Errno;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::Error;
use crate::gpio::GpioDriver;

const VALUE_TOKEN: Token = Token(0);
const WAKE_TOKEN: Token = Token(1);
const EVENTS_CAPACITY: usize = 2;
const VALUE_READ_SIZE: usize = 15;

/// Blocking edge waits that another thread can cut short.
///
/// Each wait owns a fresh [`Poll`] with the pin value and a [`Waker`]
/// registered on it. The waker is published per pin for the duration of the
/// wait so [`interrupt`](Self::interrupt) can reach it.
pub struct EdgeWaitCoordinator {
    discard_initial_event: bool,
    in_flight: Mutex<FxHashMap<u32, Waker>>,
}

/// Unpublishes a wait when it ends, whichever way it ends.
struct InFlight<'a> {
    coordinator: &'a EdgeWaitCoordinator,
    pin: u32,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.coordinator.in_flight.lock().remove(&self.pin);
    }
}

fn io_error(pin: u32, what: &str, e: io::Error) -> Error {
    error!("{what} for pin {pin}: {e}");
    Error::General(format!("{what} for pin {pin}: {e}"))
}

impl EdgeWaitCoordinator {
    /// With `discard_initial_event` set, every wait polls twice and ignores
    /// the first readiness report. The sysfs value attribute signals once as
    /// soon as it is registered, before any real edge.
    pub fn new(discard_initial_event: bool) -> Self {
        Self {
            discard_initial_event,
            in_flight: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn discard_initial_event(&self) -> bool {
        self.discard_initial_event
    }

    pub fn wait_for_edge<D: GpioDriver + ?Sized>(
        &self,
        driver: &D,
        pin: u32,
    ) -> Result<u8, Error> {
        let mut source = driver.open_edge_source(pin)?;
        let mut poll = Poll::new().map_err(|e| io_error(pin, "create poll", e))?;
        let waker =
            Waker::new(poll.registry(), WAKE_TOKEN).map_err(|e| io_error(pin, "create waker", e))?;
        poll.registry()
            .register(
                &mut SourceFd(&source.as_raw_fd()),
                VALUE_TOKEN,
                Interest::READABLE | Interest::PRIORITY,
            )
            .map_err(|e| io_error(pin, "register value", e))?;

        self.in_flight.lock().insert(pin, waker);
        let _in_flight = InFlight {
            coordinator: self,
            pin,
        };

        let rounds = if self.discard_initial_event { 2 } else { 1 };
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut round = 0;
        while round < rounds {
            match poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(io_error(pin, "poll", e)),
            }
            if events.iter().any(|event| event.token() == WAKE_TOKEN) {
                debug!("Wait on pin {pin} interrupted");
                return Err(Error::Interrupted(pin));
            }
            trace!("Pin {pin} ready, round {}", round + 1);
            round += 1;
        }

        read_level(&mut source, pin)
    }

    /// Wakes the wait in flight on `pin`. Without one this does nothing.
    pub fn interrupt(&self, pin: u32) -> Result<(), Error> {
        let in_flight = self.in_flight.lock();
        match in_flight.get(&pin) {
            Some(waker) => waker.wake().map_err(|e| io_error(pin, "wake", e)),
            None => {
                trace!("No wait in flight on pin {pin}");
                Ok(())
            }
        }
    }

    pub fn is_in_flight(&self, pin: u32) -> bool {
        self.in_flight.lock().contains_key(&pin)
    }

    /// Pins with a wait in progress, ascending.
    pub fn in_flight(&self) -> Vec<u32> {
        let mut pins: Vec<u32> = self.in_flight.lock().keys().copied().collect();
        pins.sort_unstable();
        pins
    }
}

fn read_level(source: &mut File, pin: u32) -> Result<u8, Error> {
    match source.seek(SeekFrom::Start(0)) {
        Ok(_) => {}
        Err(e) if e.raw_os_error() == Some(Errno::ESPIPE as i32) => {
            return drain_level(source, pin);
        }
        Err(e) => return Err(io_error(pin, "rewind value", e)),
    }

    let mut buf = [0u8; VALUE_READ_SIZE];
    let read = source
        .read(&mut buf)
        .map_err(|e| io_error(pin, "read value", e))?;
    if read == 0 {
        error!("Empty value read for pin {pin}");
        return Err(Error::General(format!("empty value read for pin {pin}")));
    }

    Ok(buf[0] & 1)
}

/// Pipes and FIFOs queue one level per edge; the newest one is the level
/// after the edge that ended the wait.
fn drain_level(source: &mut File, pin: u32) -> Result<u8, Error> {
    let mut buf = [0u8; VALUE_READ_SIZE];
    let mut level = None;
    loop {
        match source.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => {
                if let Some(digit) = buf[..read].iter().rev().find(|b| b.is_ascii_digit()) {
                    level = Some(digit & 1);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(io_error(pin, "read value", e)),
        }
    }

    level.ok_or_else(|| {
        error!("Empty value read for pin {pin}");
        Error::General(format!("empty value read for pin {pin}"))
    })
}
