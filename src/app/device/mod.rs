pub mod lease;
pub mod supervisor;

pub use lease::DeviceLease;
pub use supervisor::{BootReport, DeviceHandle, DeviceState, VirtualDeviceSupervisor};
