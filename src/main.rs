use log::{error, info, warn};
use std::collections::BTreeMap;
use std::io::{self, BufRead};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use gpiof::{
    AppConfig, Direction, EdgeMode, Error, GpioDriver, PinHandle, PinRegistry, ThreadRegistry,
};

#[cfg(any(feature = "mock-gpio", not(feature = "sysfs-gpio")))]
use gpiof::MockGpioDriver;
#[cfg(all(feature = "sysfs-gpio", not(feature = "mock-gpio")))]
use gpiof::SysfsGpioDriver;

const INTERRUPT_RETRY: Duration = Duration::from_millis(10);

type Registry = PinRegistry<dyn GpioDriver>;

fn watch(registry: Arc<Registry>, handle: PinHandle, edge: EdgeMode) {
    loop {
        match registry.wait_for_edge(handle, edge) {
            Ok(value) => info!("Pin {} {edge} edge, level {value}", handle.pin()),
            Err(Error::Interrupted(pin)) => {
                info!("Watcher on pin {pin} stopped");
                break;
            }
            Err(e) => {
                error!("Watcher on pin {} failed: {e}", handle.pin());
                break;
            }
        }
    }
}

fn pin_arg<'a>(
    words: &mut impl Iterator<Item = &'a str>,
    handles: &BTreeMap<u32, PinHandle>,
) -> Result<PinHandle, Error> {
    let pin: u32 = words
        .next()
        .and_then(|w| w.parse().ok())
        .ok_or_else(|| Error::General("missing pin number".into()))?;
    handles.get(&pin).copied().ok_or(Error::Handle(pin))
}

fn run_command(
    registry: &Registry,
    threads: &ThreadRegistry,
    handles: &BTreeMap<u32, PinHandle>,
    line: &str,
) -> Result<bool, Error> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(true);
    };
    match command {
        "set" => {
            let handle = pin_arg(&mut words, handles)?;
            let value: u8 = words
                .next()
                .and_then(|w| w.parse().ok())
                .ok_or_else(|| Error::General("set: missing value".into()))?;
            registry.set_value(handle, value)?;
        }
        "get" => {
            let handle = pin_arg(&mut words, handles)?;
            println!("{}", registry.value(handle)?);
        }
        "interrupt" => {
            let handle = pin_arg(&mut words, handles)?;
            registry.interrupt(handle.pin())?;
        }
        "threads" => {
            for t in threads.threads() {
                println!("{} tid={}", t.name, t.tid);
            }
            println!("waiting on pins {:?}", registry.coordinator().in_flight());
        }
        "quit" => return Ok(false),
        other => warn!("Unknown command {other:?}"),
    }
    Ok(true)
}

fn main() {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("GPIOF_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = AppConfig::load_from_file(&config_path)
        .unwrap_or_else(|e| panic!("Failed to load config: {e}"));

    let driver: Arc<dyn GpioDriver> = {
        #[cfg(all(feature = "sysfs-gpio", not(feature = "mock-gpio")))]
        {
            Arc::new(SysfsGpioDriver::new(&config.gpio.sysfs_root))
        }
        #[cfg(any(feature = "mock-gpio", not(feature = "sysfs-gpio")))]
        {
            Arc::new(MockGpioDriver::new())
        }
    };

    let registry: Arc<Registry> = Arc::new(PinRegistry::new(driver, &config.gpio));
    let threads =
        ThreadRegistry::new().unwrap_or_else(|e| panic!("Failed to init thread registry: {e}"));

    let mut handles = BTreeMap::new();
    let mut watchers: Vec<(u32, JoinHandle<()>)> = Vec::new();
    let mut pins: Vec<_> = config.pins.iter().collect();
    pins.sort_by_key(|(pin, _)| **pin);

    for (&pin, cfg) in pins {
        let handle = match registry.open(pin, cfg.direction, cfg.edge, cfg.value) {
            Ok(handle) => handle,
            Err(e) => {
                error!("Cannot open pin {pin} ({}): {e}", cfg.name);
                continue;
            }
        };
        info!("Opened pin {pin} ({}) as {}", cfg.name, cfg.direction);
        handles.insert(pin, handle);

        if cfg.direction == Direction::Input && cfg.edge != EdgeMode::None {
            let registry = Arc::clone(&registry);
            let edge = cfg.edge;
            match threads.spawn("edge_watcher", config.threads.stack_size, move || {
                watch(registry, handle, edge)
            }) {
                Ok(watcher) => watchers.push((pin, watcher)),
                Err(e) => error!("No watcher for pin {pin}: {e}"),
            }
        }
    }

    for line in io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!("stdin: {e}");
                break;
            }
        };
        match run_command(&registry, &threads, &handles, &line) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => error!("{line:?} failed ({}): {e}", e.code()),
        }
    }

    // a watcher may not be blocked yet when the first interrupt lands
    for (pin, watcher) in watchers {
        while !watcher.is_finished() {
            if let Err(e) = registry.interrupt(pin) {
                warn!("Interrupt on pin {pin}: {e}");
            }
            thread::sleep(INTERRUPT_RETRY);
        }
        if watcher.join().is_err() {
            error!("Watcher on pin {pin} panicked");
        }
    }

    for (pin, handle) in handles {
        if let Err(e) = registry.close(handle) {
            error!("Cannot close pin {pin}: {e}");
        }
    }
    info!("{} tracked threads left", threads.count());
}
