mod backend;
mod config;
mod edge;
mod error;
mod gpio;
mod thread;

pub use config::{
    AppConfig, DEFAULT_SYSFS_ROOT, DEFAULT_THREAD_STACK_SIZE, Direction, EdgeMode, GpioConfig,
    OpenPolicy, PinConfig, ThreadConfig,
};
pub use edge::EdgeWaitCoordinator;
pub use error::Error;
pub use gpio::{GpioDriver, PinHandle, PinRegistry, VALUE_CLEAR, VALUE_SET, normalize_value};
pub use thread::{
    MAX_STACK_SIZE, ThreadInfo, ThreadRegistry, min_stack_size, normalize_stack_size,
    os_thread_name,
};

pub use backend::{MockGpioDriver, MockOp, MockPinState};
#[cfg(feature = "sysfs-gpio")]
pub use backend::SysfsGpioDriver;
