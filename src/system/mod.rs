pub mod info;
pub mod reset;
pub mod storage;
pub mod watchdog;

pub use info::DeviceInfo;
pub use storage::{mount_fat, NvsCredentialStore};
pub use watchdog::EspTimerBank;
