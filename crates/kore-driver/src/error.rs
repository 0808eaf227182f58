//! Error types for driver operations.

use std::fmt;
use std::panic::Location;
use std::path::PathBuf;

use crate::status::Status;

/// Result type for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

/// A driver entry point, used to attribute a failing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Init,
    DriverGetVersion,
    DeviceGetCount,
    DeviceGet,
    DeviceGetName,
    DeviceTotalMem,
    DeviceGetAttribute,
    CtxCreate,
    CtxDestroy,
    CtxSetCurrent,
    CtxSynchronize,
    ModuleLoad,
    ModuleLoadData,
    ModuleUnload,
    ModuleGetFunction,
    FuncGetParamInfo,
    MemAlloc,
    MemFree,
    MemcpyHtoD,
    MemcpyDtoH,
    LaunchKernel,
}

impl Op {
    /// Driver symbol this operation maps to.
    pub fn symbol(self) -> &'static str {
        match self {
            Op::Init => "cuInit",
            Op::DriverGetVersion => "cuDriverGetVersion",
            Op::DeviceGetCount => "cuDeviceGetCount",
            Op::DeviceGet => "cuDeviceGet",
            Op::DeviceGetName => "cuDeviceGetName",
            Op::DeviceTotalMem => "cuDeviceTotalMem",
            Op::DeviceGetAttribute => "cuDeviceGetAttribute",
            Op::CtxCreate => "cuCtxCreate",
            Op::CtxDestroy => "cuCtxDestroy",
            Op::CtxSetCurrent => "cuCtxSetCurrent",
            Op::CtxSynchronize => "cuCtxSynchronize",
            Op::ModuleLoad => "cuModuleLoad",
            Op::ModuleLoadData => "cuModuleLoadData",
            Op::ModuleUnload => "cuModuleUnload",
            Op::ModuleGetFunction => "cuModuleGetFunction",
            Op::FuncGetParamInfo => "cuFuncGetParamInfo",
            Op::MemAlloc => "cuMemAlloc",
            Op::MemFree => "cuMemFree",
            Op::MemcpyHtoD => "cuMemcpyHtoD",
            Op::MemcpyDtoH => "cuMemcpyDtoH",
            Op::LaunchKernel => "cuLaunchKernel",
        }
    }

    fn kind(self) -> ErrorKind {
        match self {
            Op::Init | Op::DriverGetVersion | Op::DeviceGetCount => ErrorKind::Initialization,
            Op::DeviceGet | Op::ModuleLoad | Op::ModuleLoadData | Op::ModuleGetFunction => {
                ErrorKind::Resolution
            }
            Op::DeviceGetName
            | Op::DeviceTotalMem
            | Op::DeviceGetAttribute
            | Op::CtxCreate
            | Op::CtxDestroy
            | Op::CtxSetCurrent
            | Op::ModuleUnload
            | Op::FuncGetParamInfo
            | Op::MemAlloc
            | Op::MemFree => ErrorKind::Resource,
            Op::MemcpyHtoD | Op::MemcpyDtoH => ErrorKind::Transfer,
            Op::LaunchKernel | Op::CtxSynchronize => ErrorKind::Launch,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Error categories of the launch flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Driver subsystem not ready.
    Initialization,
    /// Device, module, or entry point not found.
    Resolution,
    /// Allocation failure or invalid handle.
    Resource,
    /// Host/device copy failed.
    Transfer,
    /// Bad geometry, signature mismatch, or device-side fault.
    Launch,
    /// Invalid run configuration (never reaches the driver).
    Configuration,
}

/// Driver operation errors.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The driver library could not be loaded.
    #[error("CUDA driver not available: {reason}")]
    Unavailable {
        reason: String,
        location: &'static Location<'static>,
    },

    /// A driver call returned a non-success status.
    #[error("{op} failed: {description} [{status}]")]
    Driver {
        op: Op,
        status: Status,
        /// Description reported by the driver for `status`.
        description: String,
        location: &'static Location<'static>,
    },

    /// Launch geometry rejected before reaching the driver.
    #[error("invalid launch geometry: {reason}")]
    InvalidGeometry {
        reason: String,
        location: &'static Location<'static>,
    },

    /// Argument list does not match the entry point's parameter count.
    #[error("kernel '{kernel}' expects {expected} arguments, got {actual}")]
    ArgumentCount {
        kernel: String,
        expected: usize,
        actual: usize,
        location: &'static Location<'static>,
    },

    /// Host slice larger than the device buffer it is copied to or from.
    #[error("{op}: {requested} bytes requested, buffer holds {capacity}")]
    BufferSize {
        op: Op,
        requested: usize,
        capacity: usize,
        location: &'static Location<'static>,
    },

    /// Run configuration could not be read.
    #[error("failed to read config {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Run configuration is not valid JSON for `RunConfig`.
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// Run configuration failed validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl DriverError {
    /// Build a status error attributed to the caller's location.
    #[track_caller]
    pub fn driver(op: Op, status: Status, description: impl Into<String>) -> Self {
        Self::Driver {
            op,
            status,
            description: description.into(),
            location: Location::caller(),
        }
    }

    #[track_caller]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable { reason: reason.into(), location: Location::caller() }
    }

    #[track_caller]
    pub fn invalid_geometry(reason: impl Into<String>) -> Self {
        Self::InvalidGeometry { reason: reason.into(), location: Location::caller() }
    }

    #[track_caller]
    pub fn argument_count(kernel: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::ArgumentCount {
            kernel: kernel.into(),
            expected,
            actual,
            location: Location::caller(),
        }
    }

    #[track_caller]
    pub fn buffer_size(op: Op, requested: usize, capacity: usize) -> Self {
        Self::BufferSize { op, requested, capacity, location: Location::caller() }
    }

    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable { .. } => ErrorKind::Initialization,
            Self::Driver { status, .. } if *status == Status::NOT_INITIALIZED => {
                ErrorKind::Initialization
            }
            Self::Driver { op, .. } => op.kind(),
            Self::InvalidGeometry { .. } | Self::ArgumentCount { .. } => ErrorKind::Launch,
            Self::BufferSize { .. } => ErrorKind::Transfer,
            Self::ConfigIo { .. } | Self::ConfigParse(_) | Self::InvalidConfig(_) => {
                ErrorKind::Configuration
            }
        }
    }

    /// Driver status, if this error came from a driver call.
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::Driver { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Source location of the call that failed, when known.
    pub fn location(&self) -> Option<&'static Location<'static>> {
        match self {
            Self::Unavailable { location, .. }
            | Self::Driver { location, .. }
            | Self::InvalidGeometry { location, .. }
            | Self::ArgumentCount { location, .. }
            | Self::BufferSize { location, .. } => Some(location),
            _ => None,
        }
    }

    /// Short description used in the fatal diagnostic line.
    pub fn description(&self) -> String {
        match self {
            Self::Driver { description, .. } => description.clone(),
            other => other.to_string(),
        }
    }

    /// Process exit code: the driver status, or 1 when there is none.
    ///
    /// Statuses above 255 are passed through unchanged; see
    /// [`crate::ErrorReporter::fatal`] for how the OS reports them.
    pub fn exit_code(&self) -> i32 {
        match self.status() {
            Some(status) if status.code() != 0 => status.code(),
            _ => 1,
        }
    }
}
