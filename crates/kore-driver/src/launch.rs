//! Kernel launch geometry, argument packing, and dispatch.
//!
//! Launches are asynchronous: [`Context::launch`] enqueues work and returns.
//! The context remembers that work is in flight so that teardown (buffer
//! free, module unload, context destroy) synchronizes first.
//!
//! Kernels index with `blockIdx.x * blockDim.x + threadIdx.x`. When the
//! problem size is not a multiple of the block size the last block has
//! padding threads, and the kernel itself must bounds-check against `n`.

use std::ffi::c_void;
use std::marker::PhantomData;

use serde::Serialize;

use crate::api::{ContextHandle, DevicePtr};
use crate::context::Context;
use crate::error::{DriverError, Op, Result};
use crate::memory::DeviceBuffer;
use crate::module::Kernel;
use crate::status::Status;

/// Three-dimensional extent of a grid or block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// One-dimensional extent `(x, 1, 1)`.
    pub const fn x(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }

    /// Product of the three axes, or `None` if it does not fit in a `u64`.
    pub fn volume(&self) -> Option<u64> {
        (self.x as u64).checked_mul(self.y as u64)?.checked_mul(self.z as u64)
    }

    fn has_zero_axis(&self) -> bool {
        self.x == 0 || self.y == 0 || self.z == 0
    }
}

impl From<(u32, u32, u32)> for Dim3 {
    fn from((x, y, z): (u32, u32, u32)) -> Self {
        Self { x, y, z }
    }
}

/// Grid/block geometry plus dynamic shared memory for one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LaunchConfig {
    pub grid: Dim3,
    pub block: Dim3,
    pub shared_mem_bytes: u32,
}

/// Number of blocks needed to cover `problem_size` with `block_size` threads
/// each: `ceil(problem_size / block_size)`.
#[track_caller]
pub fn grid_dim(problem_size: usize, block_size: u32) -> Result<u32> {
    if block_size == 0 {
        return Err(DriverError::invalid_geometry("block size must be > 0"));
    }
    if problem_size == 0 {
        return Err(DriverError::invalid_geometry("problem size must be > 0"));
    }
    let blocks = problem_size.div_ceil(block_size as usize);
    match u32::try_from(blocks) {
        Ok(blocks) => Ok(blocks),
        Err(_) => Err(DriverError::invalid_geometry(format!(
            "{problem_size} elements need {blocks} blocks of {block_size}, more than a grid axis holds"
        ))),
    }
}

impl LaunchConfig {
    /// 1D launch covering `problem_size` elements with `block_size` threads
    /// per block.
    #[track_caller]
    pub fn linear(problem_size: usize, block_size: u32) -> Result<Self> {
        let grid = grid_dim(problem_size, block_size)?;
        Ok(Self {
            grid: Dim3::x(grid),
            block: Dim3::x(block_size),
            shared_mem_bytes: 0,
        })
    }

    pub fn with_shared_mem(mut self, bytes: u32) -> Self {
        self.shared_mem_bytes = bytes;
        self
    }

    /// Total threads launched, padding included. `None` when the count
    /// overflows a `u64`, which device limits allow for 3D grids.
    pub fn total_threads(&self) -> Option<u64> {
        self.grid.volume()?.checked_mul(self.block.volume()?)
    }

    /// Threads past `problem_size` in the last block.
    pub fn padding_threads(&self, problem_size: usize) -> Option<u64> {
        Some(self.total_threads()?.saturating_sub(problem_size as u64))
    }

    /// Reject zero-sized axes. The driver does the same, but with a less
    /// useful error.
    #[track_caller]
    pub fn validate(&self) -> Result<()> {
        if self.grid.has_zero_axis() {
            return Err(DriverError::invalid_geometry(format!("grid {:?} has a zero axis", self.grid)));
        }
        if self.block.has_zero_axis() {
            return Err(DriverError::invalid_geometry(format!("block {:?} has a zero axis", self.block)));
        }
        Ok(())
    }

    /// Check the geometry against a device's launch limits.
    #[track_caller]
    pub fn validate_against(&self, limits: &DeviceLimits) -> Result<()> {
        self.validate()?;
        match self.block.volume() {
            Some(threads) if threads <= limits.max_threads_per_block as u64 => {}
            threads => {
                return Err(DriverError::invalid_geometry(format!(
                    "block {:?} ({} threads) exceeds device limit {}",
                    self.block,
                    threads.map_or_else(|| "overflowing".to_string(), |t| t.to_string()),
                    limits.max_threads_per_block
                )));
            }
        }
        let axes = [
            ("block.x", self.block.x, limits.max_block.x),
            ("block.y", self.block.y, limits.max_block.y),
            ("block.z", self.block.z, limits.max_block.z),
            ("grid.x", self.grid.x, limits.max_grid.x),
            ("grid.y", self.grid.y, limits.max_grid.y),
            ("grid.z", self.grid.z, limits.max_grid.z),
        ];
        for (axis, value, max) in axes {
            if value > max {
                return Err(DriverError::invalid_geometry(format!(
                    "{axis} = {value} exceeds device limit {max}"
                )));
            }
        }
        if self.shared_mem_bytes > limits.max_shared_mem_per_block {
            return Err(DriverError::invalid_geometry(format!(
                "{} bytes of shared memory exceeds device limit {}",
                self.shared_mem_bytes, limits.max_shared_mem_per_block
            )));
        }
        Ok(())
    }
}

/// Per-device launch limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceLimits {
    pub max_threads_per_block: u32,
    pub max_block: Dim3,
    pub max_grid: Dim3,
    pub max_shared_mem_per_block: u32,
}

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

/// One positional kernel argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Ptr(DevicePtr),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl KernelArg {
    /// Pointer to this slot's value, as the driver's parameter array expects.
    pub(crate) fn as_param_ptr(&self) -> *mut c_void {
        match self {
            KernelArg::Ptr(p) => &p.0 as *const u64 as *mut c_void,
            KernelArg::I32(v) => v as *const i32 as *mut c_void,
            KernelArg::U32(v) => v as *const u32 as *mut c_void,
            KernelArg::I64(v) => v as *const i64 as *mut c_void,
            KernelArg::U64(v) => v as *const u64 as *mut c_void,
            KernelArg::F32(v) => v as *const f32 as *mut c_void,
            KernelArg::F64(v) => v as *const f64 as *mut c_void,
        }
    }

    pub fn as_ptr(&self) -> Option<DevicePtr> {
        match self {
            KernelArg::Ptr(p) => Some(*p),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            KernelArg::I32(v) => Some(*v),
            _ => None,
        }
    }
}

/// A value that can occupy a kernel argument slot.
pub trait KernelParam: Copy {
    fn into_arg(self) -> KernelArg;
}

macro_rules! kernel_param {
    ($ty:ty, $variant:ident) => {
        impl KernelParam for $ty {
            fn into_arg(self) -> KernelArg {
                KernelArg::$variant(self)
            }
        }
    };
}

kernel_param!(DevicePtr, Ptr);
kernel_param!(i32, I32);
kernel_param!(u32, U32);
kernel_param!(i64, I64);
kernel_param!(u64, U64);
kernel_param!(f32, F32);
kernel_param!(f64, F64);

/// Ordered argument slots, bound positionally at launch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KernelArgs {
    slots: Vec<KernelArg>,
}

impl KernelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, param: impl KernelParam) -> &mut Self {
        self.slots.push(param.into_arg());
        self
    }

    pub fn with(mut self, param: impl KernelParam) -> Self {
        self.slots.push(param.into_arg());
        self
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, KernelArg> {
        self.slots.iter()
    }

    pub fn as_slice(&self) -> &[KernelArg] {
        &self.slots
    }
}

impl From<Vec<KernelArg>> for KernelArgs {
    fn from(slots: Vec<KernelArg>) -> Self {
        Self { slots }
    }
}

/// A kernel parameter list known at compile time, as a tuple of
/// [`KernelParam`] types.
pub trait KernelSignature {
    const ARITY: usize;
}

/// A host value accepted for a parameter of type `P` in a typed launch.
///
/// Pointer parameters only accept a borrowed [`DeviceBuffer`], never a bare
/// [`DevicePtr`]: the borrow keeps the buffer alive for the whole call, and
/// the buffer names the context that owns it.
pub trait LaunchArg<P: KernelParam> {
    fn to_arg(&self) -> KernelArg;

    /// Context owning the memory this argument points into.
    fn owner(&self) -> Option<ContextHandle> {
        None
    }
}

macro_rules! launch_arg_scalar {
    ($($ty:ty),+) => {
        $(
            impl LaunchArg<$ty> for $ty {
                fn to_arg(&self) -> KernelArg {
                    (*self).into_arg()
                }
            }
        )+
    };
}

launch_arg_scalar!(i32, u32, i64, u64, f32, f64);

impl LaunchArg<DevicePtr> for &DeviceBuffer<'_> {
    fn to_arg(&self) -> KernelArg {
        KernelArg::Ptr(self.ptr())
    }

    fn owner(&self) -> Option<ContextHandle> {
        Some(self.context().handle())
    }
}

/// A tuple of [`LaunchArg`]s matching the signature `S` position by position.
pub trait LaunchArgs<S: KernelSignature> {
    fn pack(&self) -> KernelArgs;

    /// Owning context of every buffer argument, in order.
    fn owners(&self) -> Vec<ContextHandle>;
}

macro_rules! kernel_signature {
    ($n:expr; $($idx:tt: $param:ident => $arg:ident),+) => {
        impl<$($param: KernelParam),+> KernelSignature for ($($param,)+) {
            const ARITY: usize = $n;
        }

        impl<$($param: KernelParam, $arg: LaunchArg<$param>),+> LaunchArgs<($($param,)+)> for ($($arg,)+) {
            fn pack(&self) -> KernelArgs {
                KernelArgs::from(vec![$(<$arg as LaunchArg<$param>>::to_arg(&self.$idx)),+])
            }

            fn owners(&self) -> Vec<ContextHandle> {
                [$(<$arg as LaunchArg<$param>>::owner(&self.$idx)),+].into_iter().flatten().collect()
            }
        }
    };
}

kernel_signature!(1; 0: P0 => A0);
kernel_signature!(2; 0: P0 => A0, 1: P1 => A1);
kernel_signature!(3; 0: P0 => A0, 1: P1 => A1, 2: P2 => A2);
kernel_signature!(4; 0: P0 => A0, 1: P1 => A1, 2: P2 => A2, 3: P3 => A3);
kernel_signature!(5; 0: P0 => A0, 1: P1 => A1, 2: P2 => A2, 3: P3 => A3, 4: P4 => A4);
kernel_signature!(6; 0: P0 => A0, 1: P1 => A1, 2: P2 => A2, 3: P3 => A3, 4: P4 => A4, 5: P5 => A5);
kernel_signature!(7; 0: P0 => A0, 1: P1 => A1, 2: P2 => A2, 3: P3 => A3, 4: P4 => A4, 5: P5 => A5, 6: P6 => A6);
kernel_signature!(8; 0: P0 => A0, 1: P1 => A1, 2: P2 => A2, 3: P3 => A3, 4: P4 => A4, 5: P5 => A5, 6: P6 => A6, 7: P7 => A7);

/// A kernel whose parameter list is pinned to the tuple type `S`.
pub struct TypedKernel<'m, S> {
    kernel: Kernel<'m>,
    _signature: PhantomData<fn(S)>,
}

impl<'m, S: KernelSignature> TypedKernel<'m, S> {
    /// # Safety
    /// `kernel`'s entry point must take exactly the parameters of `S`, in order.
    pub(crate) unsafe fn new_unchecked(kernel: Kernel<'m>) -> Self {
        Self { kernel, _signature: PhantomData }
    }

    pub fn kernel(&self) -> &Kernel<'m> {
        &self.kernel
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

impl Context<'_> {
    /// Enqueue `kernel` over `config` with positional `args`.
    ///
    /// Returns as soon as the launch is queued. The argument count is checked
    /// when the driver can report the kernel's parameter count; types cannot
    /// be checked at all.
    ///
    /// # Safety
    /// `args` must match the kernel's parameter list in order and type, and
    /// every device pointer among them must belong to a live buffer of this
    /// context.
    #[track_caller]
    pub unsafe fn launch(&self, kernel: &Kernel<'_>, config: &LaunchConfig, args: &KernelArgs) -> Result<()> {
        config.validate()?;
        if kernel.context_handle() != self.handle() {
            return Err(self.driver().status_error(Op::LaunchKernel, Status::INVALID_CONTEXT));
        }
        if let Some(expected) = kernel.param_count() {
            if expected != args.len() {
                return Err(DriverError::argument_count(kernel.name(), expected, args.len()));
            }
        }
        self.bind()?;
        tracing::debug!(
            kernel = kernel.name(),
            grid = ?config.grid,
            block = ?config.block,
            shared_mem = config.shared_mem_bytes,
            args = args.len(),
            "launch"
        );
        let result = self.driver().api().launch_kernel(kernel.handle(), config, args);
        self.driver().check(Op::LaunchKernel, result)?;
        self.mark_in_flight();
        Ok(())
    }

    /// Enqueue a typed kernel; the argument tuple is checked by the compiler.
    ///
    /// Pointer parameters take `&DeviceBuffer`, so a buffer that was freed
    /// (or moved into `free`) cannot be passed:
    ///
    /// ```compile_fail
    /// use kore_driver::{Context, ContextFlags, DevicePtr, Driver, LaunchConfig, MockDriver};
    ///
    /// let driver = Driver::new(MockDriver::new(1).with_vector_add()).unwrap();
    /// let device = driver.device(0).unwrap();
    /// let ctx = Context::create(&driver, &device, ContextFlags::default()).unwrap();
    /// let module = ctx.load_module_data(b".visible .entry vector_add(").unwrap();
    /// let kernel = unsafe { module.typed_function::<(DevicePtr, i32)>("vector_add") }.unwrap();
    /// let buf = ctx.alloc_for::<f32>(4).unwrap();
    /// buf.free().unwrap();
    /// ctx.launch_typed(&kernel, &LaunchConfig::linear(4, 4).unwrap(), (&buf, 4)).unwrap();
    /// ```
    ///
    /// Nor can a raw device address:
    ///
    /// ```compile_fail
    /// use kore_driver::{Context, ContextFlags, DevicePtr, Driver, LaunchConfig, MockDriver};
    ///
    /// let driver = Driver::new(MockDriver::new(1).with_vector_add()).unwrap();
    /// let device = driver.device(0).unwrap();
    /// let ctx = Context::create(&driver, &device, ContextFlags::default()).unwrap();
    /// let module = ctx.load_module_data(b".visible .entry vector_add(").unwrap();
    /// let kernel = unsafe { module.typed_function::<(DevicePtr, i32)>("vector_add") }.unwrap();
    /// let buf = ctx.alloc_for::<f32>(4).unwrap();
    /// ctx.launch_typed(&kernel, &LaunchConfig::linear(4, 4).unwrap(), (buf.ptr(), 4)).unwrap();
    /// ```
    ///
    /// Buffers owned by another context are rejected with `INVALID_CONTEXT`
    /// before anything is enqueued.
    #[track_caller]
    pub fn launch_typed<S, A>(&self, kernel: &TypedKernel<'_, S>, config: &LaunchConfig, args: A) -> Result<()>
    where
        S: KernelSignature,
        A: LaunchArgs<S>,
    {
        if args.owners().iter().any(|owner| *owner != self.handle()) {
            return Err(self.driver().status_error(Op::LaunchKernel, Status::INVALID_CONTEXT));
        }
        let args = args.pack();
        // Safety: `TypedKernel` construction asserts the signature is `S`.
        // Every pointer comes from a buffer of this context borrowed for the
        // duration of the call, and buffers synchronize in-flight work before
        // they are released.
        unsafe { self.launch(&kernel.kernel, config, &args) }
    }
}
