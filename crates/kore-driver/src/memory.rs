//! Device memory allocation and host↔device transfer utilities.
//!
//! Transfers are synchronous: the calling thread blocks until the copy is
//! done, which also orders an upload before any launch queued after it.

use bytemuck::Pod;

use crate::api::DevicePtr;
use crate::context::Context;
use crate::error::{DriverError, Op, Result};
use crate::status::Status;

/// A device allocation owned by one context.
///
/// Freed via `cuMemFree` on drop, after any in-flight work in the owning
/// context has completed.
pub struct DeviceBuffer<'c> {
    ctx: &'c Context<'c>,
    ptr: DevicePtr,
    nbytes: usize,
    released: bool,
}

impl<'d> Context<'d> {
    /// Reserve `nbytes` of device memory. Zero-byte requests return an empty
    /// buffer without touching the driver.
    #[track_caller]
    pub fn alloc(&self, nbytes: usize) -> Result<DeviceBuffer<'_>> {
        if nbytes == 0 {
            return Ok(DeviceBuffer { ctx: self, ptr: DevicePtr::NULL, nbytes: 0, released: false });
        }
        self.bind()?;
        let result = self.driver().api().mem_alloc(nbytes);
        let ptr = self.driver().check(Op::MemAlloc, result)?;
        tracing::debug!(nbytes, ptr = format_args!("{:#x}", ptr.0), "device alloc");
        Ok(DeviceBuffer { ctx: self, ptr, nbytes, released: false })
    }

    /// Reserve room for `len` values of `T`.
    #[track_caller]
    pub fn alloc_for<T: Pod>(&self, len: usize) -> Result<DeviceBuffer<'_>> {
        match len.checked_mul(std::mem::size_of::<T>()) {
            Some(nbytes) => self.alloc(nbytes),
            None => Err(self.driver().status_error(Op::MemAlloc, Status::OUT_OF_MEMORY)),
        }
    }

    /// Allocate a buffer and fill it from `data`.
    #[track_caller]
    pub fn upload<T: Pod>(&self, data: &[T]) -> Result<DeviceBuffer<'_>> {
        let mut buf = self.alloc(std::mem::size_of_val(data))?;
        self.copy_host_to_device(&mut buf, data)?;
        Ok(buf)
    }

    /// Copy `src` into the start of `dst`.
    ///
    /// Fails if `src` is larger than `dst` or `dst` belongs to another
    /// context.
    #[track_caller]
    pub fn copy_host_to_device<T: Pod>(&self, dst: &mut DeviceBuffer<'_>, src: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(src);
        self.check_transfer(Op::MemcpyHtoD, dst, bytes.len())?;
        if bytes.is_empty() {
            return Ok(());
        }
        self.bind()?;
        // Safety: `dst` is live in this context and holds at least `bytes.len()`.
        let result = unsafe { self.driver().api().memcpy_htod(dst.ptr, bytes) };
        self.driver().check(Op::MemcpyHtoD, result)?;
        tracing::trace!(nbytes = bytes.len(), "H2D");
        Ok(())
    }

    /// Copy the start of `src` into `dst`.
    ///
    /// Fails if `dst` is larger than `src` or `src` belongs to another
    /// context.
    #[track_caller]
    pub fn copy_device_to_host<T: Pod>(&self, dst: &mut [T], src: &DeviceBuffer<'_>) -> Result<()> {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(dst);
        self.check_transfer(Op::MemcpyDtoH, src, bytes.len())?;
        if bytes.is_empty() {
            return Ok(());
        }
        self.bind()?;
        let nbytes = bytes.len();
        // Safety: `src` is live in this context and holds at least `nbytes`.
        let result = unsafe { self.driver().api().memcpy_dtoh(bytes, src.ptr) };
        self.driver().check(Op::MemcpyDtoH, result)?;
        tracing::trace!(nbytes, "D2H");
        Ok(())
    }

    /// Read the first `len` values of `src` back to the host.
    #[track_caller]
    pub fn download<T: Pod>(&self, src: &DeviceBuffer<'_>, len: usize) -> Result<Vec<T>> {
        let mut host = vec![T::zeroed(); len];
        self.copy_device_to_host(&mut host, src)?;
        Ok(host)
    }

    #[track_caller]
    fn check_transfer(&self, op: Op, buf: &DeviceBuffer<'_>, nbytes: usize) -> Result<()> {
        if buf.ctx.handle() != self.handle() {
            return Err(self.driver().status_error(op, Status::INVALID_CONTEXT));
        }
        if nbytes > buf.nbytes {
            return Err(DriverError::buffer_size(op, nbytes, buf.nbytes));
        }
        Ok(())
    }
}

impl<'c> DeviceBuffer<'c> {
    /// Device address, for use as a kernel argument.
    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Number of bytes.
    pub fn len(&self) -> usize {
        self.nbytes
    }

    pub fn is_empty(&self) -> bool {
        self.nbytes == 0
    }

    pub fn context(&self) -> &'c Context<'c> {
        self.ctx
    }

    /// Free the buffer, reporting failures.
    #[track_caller]
    pub fn free(mut self) -> Result<()> {
        if self.ptr.is_null() {
            self.released = true;
            return Ok(());
        }
        if self.ctx.has_work_in_flight() {
            self.ctx.synchronize()?;
        }
        self.ctx.bind()?;
        // Past this point the driver owns the outcome; `Drop` must not retry.
        self.released = true;
        let result = self.ctx.driver().api().mem_free(self.ptr);
        self.ctx.driver().check(Op::MemFree, result)?;
        tracing::debug!(ptr = format_args!("{:#x}", self.ptr.0), "device free");
        Ok(())
    }
}

impl Drop for DeviceBuffer<'_> {
    fn drop(&mut self) {
        if self.released || self.ptr.is_null() {
            return;
        }
        self.ctx.drain();
        let api = self.ctx.driver().api();
        if let Err(status) = api.ctx_set_current(self.ctx.handle()).and_then(|()| api.mem_free(self.ptr)) {
            tracing::warn!(ptr = format_args!("{:#x}", self.ptr.0), %status, "device free failed");
        }
    }
}

impl std::fmt::Debug for DeviceBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &format_args!("{:#x}", self.ptr.0))
            .field("nbytes", &self.nbytes)
            .field("context", &self.ctx.handle())
            .finish()
    }
}
