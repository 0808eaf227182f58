//! The raw device API seam.
//!
//! [`DriverApi`] is the status-returning surface the rest of the crate is
//! written against. [`crate::ffi::CudaDriverApi`] forwards it to the real
//! driver library; [`crate::mock::MockDriver`] implements it in-process.
//!
//! Handles are distinct newtypes so a context can never be passed where a
//! module or a device pointer is expected.

use std::path::Path;

use crate::launch::{KernelArgs, LaunchConfig};
use crate::status::Status;

/// Driver-level device ordinal handle (`CUdevice`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub i32);

/// Opaque execution context handle (`CUcontext`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub usize);

/// Opaque loaded-module handle (`CUmodule`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub usize);

/// Opaque kernel entry point handle (`CUfunction`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionHandle(pub usize);

/// Device memory address (`CUdeviceptr`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Device attributes queried by this crate (`CUdevice_attribute` values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DeviceAttribute {
    MaxThreadsPerBlock = 1,
    MaxBlockDimX = 2,
    MaxBlockDimY = 3,
    MaxBlockDimZ = 4,
    MaxGridDimX = 5,
    MaxGridDimY = 6,
    MaxGridDimZ = 7,
    MaxSharedMemoryPerBlock = 8,
    MultiprocessorCount = 16,
    ComputeCapabilityMajor = 75,
    ComputeCapabilityMinor = 76,
}

/// Raw driver operations.
///
/// Operations that touch a context act on the calling thread's current
/// context; callers bind one with [`DriverApi::ctx_set_current`] first.
/// The safe layer in [`crate::context`] does this for every call.
pub trait DriverApi: Send + Sync {
    /// Initialize the driver subsystem. Must precede every other call.
    fn init(&self, flags: u32) -> Result<(), Status>;

    fn driver_version(&self) -> Result<i32, Status>;

    fn device_count(&self) -> Result<usize, Status>;

    /// Resolve a 0-based device ordinal.
    fn device_get(&self, ordinal: usize) -> Result<DeviceHandle, Status>;

    fn device_name(&self, device: DeviceHandle) -> Result<String, Status>;

    fn device_total_mem(&self, device: DeviceHandle) -> Result<usize, Status>;

    fn device_attribute(&self, device: DeviceHandle, attr: DeviceAttribute) -> Result<i32, Status>;

    /// Create a context on `device`; it becomes current on this thread.
    fn ctx_create(&self, flags: u32, device: DeviceHandle) -> Result<ContextHandle, Status>;

    fn ctx_destroy(&self, ctx: ContextHandle) -> Result<(), Status>;

    fn ctx_set_current(&self, ctx: ContextHandle) -> Result<(), Status>;

    /// Block until all work queued in the current context has finished.
    fn ctx_synchronize(&self) -> Result<(), Status>;

    fn module_load(&self, path: &Path) -> Result<ModuleHandle, Status>;

    fn module_load_data(&self, image: &[u8]) -> Result<ModuleHandle, Status>;

    fn module_unload(&self, module: ModuleHandle) -> Result<(), Status>;

    fn module_get_function(&self, module: ModuleHandle, name: &str) -> Result<FunctionHandle, Status>;

    /// Number of parameters of `func`, or `None` when the driver cannot
    /// introspect it.
    fn function_param_count(&self, func: FunctionHandle) -> Result<Option<usize>, Status>;

    fn mem_alloc(&self, bytes: usize) -> Result<DevicePtr, Status>;

    fn mem_free(&self, ptr: DevicePtr) -> Result<(), Status>;

    /// Synchronous host-to-device copy of `src.len()` bytes.
    ///
    /// # Safety
    /// `dst` must be a live allocation of at least `src.len()` bytes in the
    /// current context.
    unsafe fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<(), Status>;

    /// Synchronous device-to-host copy of `dst.len()` bytes.
    ///
    /// # Safety
    /// `src` must be a live allocation of at least `dst.len()` bytes in the
    /// current context.
    unsafe fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), Status>;

    /// Enqueue `func` on the default stream and return without waiting.
    ///
    /// # Safety
    /// `args` must match the kernel's parameter list in order and type, and
    /// every device pointer among them must stay live until the launch
    /// completes.
    unsafe fn launch_kernel(
        &self,
        func: FunctionHandle,
        config: &LaunchConfig,
        args: &KernelArgs,
    ) -> Result<(), Status>;

    /// Driver's description for `status`, if it has one.
    fn error_string(&self, status: Status) -> Option<String>;
}
