//! Driver status codes (`CUresult`).
//!
//! Only the codes this crate reasons about get named constants; any other
//! value round-trips untouched through [`Status`].

use std::fmt;

/// A raw driver status code. `Status::SUCCESS` is the only non-error value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub i32);

impl Status {
    pub const SUCCESS: Status = Status(0);
    pub const INVALID_VALUE: Status = Status(1);
    pub const OUT_OF_MEMORY: Status = Status(2);
    pub const NOT_INITIALIZED: Status = Status(3);
    pub const DEINITIALIZED: Status = Status(4);
    pub const NO_DEVICE: Status = Status(100);
    pub const INVALID_DEVICE: Status = Status(101);
    pub const INVALID_IMAGE: Status = Status(200);
    pub const INVALID_CONTEXT: Status = Status(201);
    pub const NO_BINARY_FOR_GPU: Status = Status(209);
    pub const INVALID_PTX: Status = Status(218);
    pub const FILE_NOT_FOUND: Status = Status(301);
    pub const INVALID_HANDLE: Status = Status(400);
    pub const NOT_FOUND: Status = Status(500);
    pub const ILLEGAL_ADDRESS: Status = Status(700);
    pub const LAUNCH_OUT_OF_RESOURCES: Status = Status(701);
    pub const LAUNCH_TIMEOUT: Status = Status(702);
    pub const LAUNCH_FAILED: Status = Status(719);
    pub const UNKNOWN: Status = Status(999);

    /// Whether this is the success code.
    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Raw integer code.
    pub fn code(self) -> i32 {
        self.0
    }

    /// Turn a raw return code into a `Result`.
    pub fn check(code: i32) -> Result<(), Status> {
        if code == 0 {
            Ok(())
        } else {
            Err(Status(code))
        }
    }

    /// Symbolic name, e.g. `CUDA_ERROR_INVALID_DEVICE`.
    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "CUDA_SUCCESS",
            1 => "CUDA_ERROR_INVALID_VALUE",
            2 => "CUDA_ERROR_OUT_OF_MEMORY",
            3 => "CUDA_ERROR_NOT_INITIALIZED",
            4 => "CUDA_ERROR_DEINITIALIZED",
            100 => "CUDA_ERROR_NO_DEVICE",
            101 => "CUDA_ERROR_INVALID_DEVICE",
            200 => "CUDA_ERROR_INVALID_IMAGE",
            201 => "CUDA_ERROR_INVALID_CONTEXT",
            209 => "CUDA_ERROR_NO_BINARY_FOR_GPU",
            218 => "CUDA_ERROR_INVALID_PTX",
            301 => "CUDA_ERROR_FILE_NOT_FOUND",
            400 => "CUDA_ERROR_INVALID_HANDLE",
            500 => "CUDA_ERROR_NOT_FOUND",
            700 => "CUDA_ERROR_ILLEGAL_ADDRESS",
            701 => "CUDA_ERROR_LAUNCH_OUT_OF_RESOURCES",
            702 => "CUDA_ERROR_LAUNCH_TIMEOUT",
            719 => "CUDA_ERROR_LAUNCH_FAILED",
            _ => "CUDA_ERROR_UNKNOWN",
        }
    }

    /// Human-readable description matching the driver's own wording.
    ///
    /// Used when the driver library cannot be asked (mock backend, or
    /// `cuGetErrorString` itself failing).
    pub fn default_description(self) -> &'static str {
        match self.0 {
            0 => "no error",
            1 => "invalid argument",
            2 => "out of memory",
            3 => "initialization error",
            4 => "driver shutting down",
            100 => "no CUDA-capable device is detected",
            101 => "invalid device ordinal",
            200 => "device kernel image is invalid",
            201 => "invalid device context",
            209 => "no kernel image is available for execution on the device",
            218 => "a PTX JIT compilation failed",
            301 => "file not found",
            400 => "invalid resource handle",
            500 => "named symbol not found",
            700 => "an illegal memory access was encountered",
            701 => "too many resources requested for launch",
            702 => "the launch timed out and was terminated",
            719 => "unspecified launch failure",
            _ => "unknown error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}
