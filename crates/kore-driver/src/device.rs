//! Driver service and device resolution.
//!
//! [`Driver`] is constructed once per process and passed by reference to
//! everything that talks to the device. Construction runs the driver's
//! one-time initialization, so no other call can precede it.

use serde::Serialize;

use crate::api::{DeviceAttribute, DeviceHandle, DriverApi};
use crate::error::{DriverError, Op, Result};
use crate::ffi::CudaDriverApi;
use crate::launch::{DeviceLimits, Dim3};
use crate::status::Status;

/// The initialized driver subsystem.
pub struct Driver {
    api: Box<dyn DriverApi>,
}

impl Driver {
    /// Initialize `api` and wrap it.
    #[track_caller]
    pub fn new(api: impl DriverApi + 'static) -> Result<Self> {
        let driver = Self { api: Box::new(api) };
        let result = driver.api.init(0);
        driver.check(Op::Init, result)?;
        tracing::debug!("driver initialized");
        Ok(driver)
    }

    /// Load the system CUDA driver and initialize it.
    #[track_caller]
    pub fn cuda() -> Result<Self> {
        let api = CudaDriverApi::load()?;
        Self::new(api)
    }

    pub fn api(&self) -> &dyn DriverApi {
        self.api.as_ref()
    }

    /// Convert a raw driver result, attaching the driver's description of
    /// the failing status and the caller's location.
    #[track_caller]
    pub fn check<T>(&self, op: Op, result: std::result::Result<T, Status>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(status) => Err(self.status_error(op, status)),
        }
    }

    #[track_caller]
    pub(crate) fn status_error(&self, op: Op, status: Status) -> DriverError {
        let description = match self.api.error_string(status) {
            Some(text) => text,
            None => status.default_description().to_string(),
        };
        tracing::debug!(%op, %status, "driver call failed");
        DriverError::driver(op, status, description)
    }

    /// Driver version as reported by the library, e.g. `12040`.
    #[track_caller]
    pub fn version(&self) -> Result<i32> {
        let result = self.api.driver_version();
        self.check(Op::DriverGetVersion, result)
    }

    #[track_caller]
    pub fn device_count(&self) -> Result<usize> {
        let result = self.api.device_count();
        self.check(Op::DeviceGetCount, result)
    }

    /// Resolve the device at 0-based `index`.
    #[track_caller]
    pub fn device(&self, index: usize) -> Result<Device> {
        let result = self.api.device_get(index);
        let handle = self.check(Op::DeviceGet, result)?;
        tracing::debug!(index, "device resolved");
        Ok(Device { index, handle })
    }

    /// Query name, memory, and launch limits of `device`.
    #[track_caller]
    pub fn device_info(&self, device: &Device) -> Result<DeviceInfo> {
        let result = self.api.device_name(device.handle);
        let name = self.check(Op::DeviceGetName, result)?;
        let result = self.api.device_total_mem(device.handle);
        let total_mem = self.check(Op::DeviceTotalMem, result)?;

        let major = self.attribute(device, DeviceAttribute::ComputeCapabilityMajor)?;
        let minor = self.attribute(device, DeviceAttribute::ComputeCapabilityMinor)?;
        let multiprocessors = self.attribute(device, DeviceAttribute::MultiprocessorCount)?;
        let limits = DeviceLimits {
            max_threads_per_block: self.attribute(device, DeviceAttribute::MaxThreadsPerBlock)?,
            max_block: Dim3::new(
                self.attribute(device, DeviceAttribute::MaxBlockDimX)?,
                self.attribute(device, DeviceAttribute::MaxBlockDimY)?,
                self.attribute(device, DeviceAttribute::MaxBlockDimZ)?,
            ),
            max_grid: Dim3::new(
                self.attribute(device, DeviceAttribute::MaxGridDimX)?,
                self.attribute(device, DeviceAttribute::MaxGridDimY)?,
                self.attribute(device, DeviceAttribute::MaxGridDimZ)?,
            ),
            max_shared_mem_per_block: self.attribute(device, DeviceAttribute::MaxSharedMemoryPerBlock)?,
        };

        Ok(DeviceInfo {
            index: device.index,
            name,
            total_mem,
            compute_capability: (major, minor),
            multiprocessors,
            limits,
        })
    }

    #[track_caller]
    fn attribute(&self, device: &Device, attr: DeviceAttribute) -> Result<u32> {
        let result = self.api.device_attribute(device.handle, attr);
        let value = self.check(Op::DeviceGetAttribute, result)?;
        Ok(value.max(0) as u32)
    }
}

/// A resolved physical device. Process-scoped; never destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Device {
    index: usize,
    handle: DeviceHandle,
}

impl Device {
    /// Logical index this device was resolved from.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }
}

/// Static properties of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub total_mem: usize,
    pub compute_capability: (u32, u32),
    pub multiprocessors: u32,
    pub limits: DeviceLimits,
}
