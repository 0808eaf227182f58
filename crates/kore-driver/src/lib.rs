//! # kore-driver
//!
//! CUDA driver API orchestration for a single compute kernel run.
//!
//! Provides:
//! - Runtime-loaded driver bindings (no CUDA toolkit needed at build time)
//! - An in-process mock driver for tests
//! - RAII guards for contexts, modules, and device buffers, with lifetimes
//!   that keep kernels inside their module and modules inside their context
//! - Launch geometry, typed kernel arguments, and asynchronous dispatch
//! - A lifecycle coordinator running device → launch → teardown
//!
//! ```no_run
//! use kore_driver::{Driver, LifecycleCoordinator, RunConfig};
//!
//! let driver = Driver::cuda()?;
//! let report = LifecycleCoordinator::new(&driver, RunConfig::default()).run()?;
//! assert_eq!(report.mismatches(3.0), 0);
//! # Ok::<(), kore_driver::DriverError>(())
//! ```

pub mod api;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod ffi;
pub mod launch;
pub mod memory;
pub mod mock;
pub mod module;
pub mod report;
pub mod status;

pub use api::{ContextHandle, DeviceAttribute, DeviceHandle, DevicePtr, DriverApi, FunctionHandle, ModuleHandle};
pub use config::RunConfig;
pub use context::{Context, ContextFlags, ContextId, ContextManager};
pub use coordinator::{LifecycleCoordinator, RunReport, Stage, VectorAddSignature};
pub use device::{Device, DeviceInfo, Driver};
pub use error::{DriverError, ErrorKind, Op, Result};
pub use ffi::CudaDriverApi;
pub use launch::{
    grid_dim, DeviceLimits, Dim3, KernelArg, KernelArgs, KernelParam, KernelSignature, LaunchArg,
    LaunchArgs, LaunchConfig, TypedKernel,
};
pub use memory::DeviceBuffer;
pub use mock::{MockDriver, MockStats};
pub use module::{Kernel, Module, ModuleSource};
pub use report::{diagnostic, ErrorReporter};
pub use status::Status;
