use std::sync::Arc;

use tracing::warn;

use crate::app::device::supervisor::VirtualDeviceSupervisor;
use crate::app::error::AppError;

/// Scoped ownership of a started device. Dropping the lease stops the device,
/// so every exit path of the owning scope cleans up.
pub struct DeviceLease {
    supervisor: Option<Arc<VirtualDeviceSupervisor>>,
}

impl DeviceLease {
    pub fn new(supervisor: Arc<VirtualDeviceSupervisor>) -> Self {
        Self {
            supervisor: Some(supervisor),
        }
    }

    /// Stops the device now and reports the outcome instead of logging it.
    pub fn release(mut self) -> Result<(), AppError> {
        match self.supervisor.take() {
            Some(supervisor) => {
                supervisor.retire();
                supervisor.stop()
            }
            None => Ok(()),
        }
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.retire();
            if let Err(err) = supervisor.stop() {
                warn!(trace_id = %err.trace_id, error = %err, "device stop on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::adb::bridge::DeviceBridge;
    use crate::app::config::{CommandSettings, DeviceSettings};
    use crate::app::device::supervisor::DeviceState;
    use crate::app::test_support::{devices_output, ok, FakeClock, FakeRunner};

    fn started() -> (Arc<VirtualDeviceSupervisor>, Arc<FakeRunner>) {
        let runner = Arc::new(FakeRunner::new(|_| ok(&devices_output(&[]))));
        let bridge = DeviceBridge::new(runner.clone(), "adb", &CommandSettings::default(), "trace-lease");
        let supervisor = Arc::new(VirtualDeviceSupervisor::new(
            runner.clone(),
            bridge,
            Arc::new(FakeClock::new()),
            "emulator",
            DeviceSettings::default(),
        ));
        supervisor.start().expect("start");
        (supervisor, runner)
    }

    #[test]
    fn drop_stops_device() {
        let (supervisor, runner) = started();
        {
            let _lease = DeviceLease::new(Arc::clone(&supervisor));
        }
        assert_eq!(supervisor.state(), DeviceState::Stopped);
        assert!(!runner.last_process().expect("process").is_alive());
    }

    #[test]
    fn drop_stops_device_during_unwind() {
        let (supervisor, runner) = started();
        let lease_target = Arc::clone(&supervisor);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _lease = DeviceLease::new(lease_target);
            panic!("later stage blew up");
        }));
        assert!(result.is_err());
        assert_eq!(supervisor.state(), DeviceState::Stopped);
        assert_eq!(runner.count("emu kill"), 1);
    }

    #[test]
    fn release_then_drop_stops_once() {
        let (supervisor, runner) = started();
        let lease = DeviceLease::new(Arc::clone(&supervisor));
        lease.release().expect("release");
        assert_eq!(runner.count("emu kill"), 1);
        supervisor.stop().expect("no-op");
        assert_eq!(runner.count("emu kill"), 1);
        assert!(supervisor.start().is_err());
    }
}
