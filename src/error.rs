use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("GPIO error: {0}")]
    General(String),
    #[error("Invalid or stale handle for pin {0}")]
    Handle(u32),
    #[error("Pin {0} is waiting for an edge")]
    Waiting(u32),
    #[error("Wrong direction for pin {0}")]
    Direction(u32),
    #[error("Pin {0} already in use")]
    Used(u32),
    #[error("Wait on pin {0} interrupted")]
    Interrupted(u32),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Numeric status as reported by the C interface of the sysfs GPIO factory.
    pub fn code(&self) -> i32 {
        match self {
            Error::General(_) | Error::Interrupted(_) | Error::Config(_) => -1,
            Error::Handle(_) => -2,
            Error::Waiting(_) => -3,
            Error::Direction(_) => -4,
            Error::Used(_) => -5,
        }
    }
}
