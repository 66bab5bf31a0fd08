pub mod mock;
#[cfg(feature = "sysfs-gpio")]
pub mod sysfs;

pub use mock::{MockGpioDriver, MockOp, MockPinState};
#[cfg(feature = "sysfs-gpio")]
pub use sysfs::SysfsGpioDriver;
