//! Execution context management.
//!
//! A [`Context`] is an RAII guard: dropping it synchronizes any work still
//! in flight and destroys the driver context. There is no ambient "current
//! context" in this API. Every operation is a method on the context it
//! targets, and the guard makes itself current before each driver call,
//! so several live contexts on one thread cannot be confused.
//!
//! Contexts are `!Send` and `!Sync`: a context is only ever driven from the
//! thread that created it.

use std::cell::Cell;
use std::marker::PhantomData;

use crate::api::ContextHandle;
use crate::device::{Device, Driver};
use crate::error::{Op, Result};

/// Context creation flags (`CU_CTX_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ContextFlags(pub u32);

impl ContextFlags {
    pub const SCHED_AUTO: ContextFlags = ContextFlags(0x00);
    pub const SCHED_SPIN: ContextFlags = ContextFlags(0x01);
    pub const SCHED_YIELD: ContextFlags = ContextFlags(0x02);
    pub const SCHED_BLOCKING_SYNC: ContextFlags = ContextFlags(0x04);
    pub const MAP_HOST: ContextFlags = ContextFlags(0x08);
    pub const LMEM_RESIZE_TO_MAX: ContextFlags = ContextFlags(0x10);

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for ContextFlags {
    type Output = ContextFlags;

    fn bitor(self, rhs: Self) -> Self {
        ContextFlags(self.0 | rhs.0)
    }
}

/// A live driver context bound to one device.
pub struct Context<'d> {
    driver: &'d Driver,
    device: Device,
    handle: ContextHandle,
    flags: ContextFlags,
    in_flight: Cell<bool>,
    released: bool,
    _not_send: PhantomData<*const ()>,
}

impl<'d> Context<'d> {
    /// Create a context on `device`.
    #[track_caller]
    pub fn create(driver: &'d Driver, device: &Device, flags: ContextFlags) -> Result<Self> {
        let result = driver.api().ctx_create(flags.bits(), device.handle());
        let handle = driver.check(Op::CtxCreate, result)?;
        tracing::debug!(device = device.index(), ?handle, flags = flags.bits(), "context created");
        Ok(Self {
            driver,
            device: *device,
            handle,
            flags,
            in_flight: Cell::new(false),
            released: false,
            _not_send: PhantomData,
        })
    }

    pub fn driver(&self) -> &'d Driver {
        self.driver
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle
    }

    pub fn flags(&self) -> ContextFlags {
        self.flags
    }

    /// Whether a launch has been queued since the last synchronization.
    pub fn has_work_in_flight(&self) -> bool {
        self.in_flight.get()
    }

    /// Make this context current on the calling thread.
    #[track_caller]
    pub(crate) fn bind(&self) -> Result<()> {
        let result = self.driver.api().ctx_set_current(self.handle);
        self.driver.check(Op::CtxSetCurrent, result)
    }

    pub(crate) fn mark_in_flight(&self) {
        self.in_flight.set(true);
    }

    /// Block until every launch queued in this context has completed.
    #[track_caller]
    pub fn synchronize(&self) -> Result<()> {
        self.bind()?;
        let result = self.driver.api().ctx_synchronize();
        self.driver.check(Op::CtxSynchronize, result)?;
        self.in_flight.set(false);
        Ok(())
    }

    /// Synchronize if needed before releasing a resource of this context.
    /// Used from `Drop`, where errors can only be logged.
    pub(crate) fn drain(&self) {
        if self.in_flight.get() {
            if let Err(e) = self.synchronize() {
                tracing::warn!("synchronize before teardown failed: {}", e);
                self.in_flight.set(false);
            }
        }
    }

    /// Synchronize, then destroy the context, reporting failures.
    #[track_caller]
    pub fn destroy(mut self) -> Result<()> {
        if self.in_flight.get() {
            self.synchronize()?;
        }
        self.released = true;
        let result = self.driver.api().ctx_destroy(self.handle);
        self.driver.check(Op::CtxDestroy, result)?;
        tracing::debug!(handle = ?self.handle, "context destroyed");
        Ok(())
    }
}

impl Drop for Context<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.drain();
        if let Err(status) = self.driver.api().ctx_destroy(self.handle) {
            tracing::warn!(handle = ?self.handle, %status, "context destroy failed");
        } else {
            tracing::debug!(handle = ?self.handle, "context destroyed");
        }
    }
}

/// Index of a context within a [`ContextManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(usize);

impl ContextId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Creates and tracks several contexts on one driver.
///
/// Contexts still alive when the manager is dropped are destroyed in reverse
/// creation order.
pub struct ContextManager<'d> {
    driver: &'d Driver,
    contexts: Vec<Option<Context<'d>>>,
}

impl<'d> ContextManager<'d> {
    pub fn new(driver: &'d Driver) -> Self {
        Self { driver, contexts: Vec::new() }
    }

    /// Create a new context on `device`. The most recently created context
    /// is what the driver would treat as current; this manager never relies
    /// on that, callers pick a context by id.
    #[track_caller]
    pub fn create(&mut self, device: &Device, flags: ContextFlags) -> Result<ContextId> {
        let ctx = Context::create(self.driver, device, flags)?;
        self.contexts.push(Some(ctx));
        Ok(ContextId(self.contexts.len() - 1))
    }

    pub fn get(&self, id: ContextId) -> Option<&Context<'d>> {
        self.contexts.get(id.0).and_then(Option::as_ref)
    }

    /// Id of the most recently created context that is still alive.
    pub fn latest(&self) -> Option<ContextId> {
        self.contexts.iter().rposition(Option::is_some).map(ContextId)
    }

    /// Number of live contexts.
    pub fn active(&self) -> usize {
        self.contexts.iter().filter(|c| c.is_some()).count()
    }

    pub fn ids(&self) -> impl Iterator<Item = ContextId> + '_ {
        self.contexts
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_some())
            .map(|(i, _)| ContextId(i))
    }

    /// Destroy one context. Unknown or already destroyed ids are a no-op.
    #[track_caller]
    pub fn destroy(&mut self, id: ContextId) -> Result<()> {
        match self.contexts.get_mut(id.0).and_then(Option::take) {
            Some(ctx) => ctx.destroy(),
            None => Ok(()),
        }
    }

    /// Destroy every live context, newest first. Stops at the first failure;
    /// the remaining contexts are still released on drop.
    #[track_caller]
    pub fn destroy_all(&mut self) -> Result<()> {
        while let Some(slot) = self.contexts.pop() {
            if let Some(ctx) = slot {
                ctx.destroy()?;
            }
        }
        Ok(())
    }
}

impl Drop for ContextManager<'_> {
    fn drop(&mut self) {
        while let Some(slot) = self.contexts.pop() {
            drop(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDriver;

    #[test]
    fn test_create_and_drop() {
        let mock = MockDriver::new(1);
        let driver = Driver::new(mock.clone()).unwrap();
        let dev = driver.device(0).unwrap();
        {
            let ctx = Context::create(&driver, &dev, ContextFlags::default()).unwrap();
            assert_eq!(ctx.device().index(), 0);
            assert_eq!(mock.stats().active_contexts, 1);
        }
        assert_eq!(mock.stats().active_contexts, 0);
    }

    #[test]
    fn test_two_contexts_both_destroyed() {
        let mock = MockDriver::new(1);
        let driver = Driver::new(mock.clone()).unwrap();
        let dev = driver.device(0).unwrap();

        let mut contexts = ContextManager::new(&driver);
        let a = contexts.create(&dev, ContextFlags::default()).unwrap();
        let b = contexts.create(&dev, ContextFlags::default()).unwrap();
        assert_ne!(contexts.get(a).unwrap().handle(), contexts.get(b).unwrap().handle());
        assert_eq!(contexts.latest(), Some(b));
        assert_eq!(mock.stats().active_contexts, 2);

        contexts.destroy(a).unwrap();
        assert_eq!(contexts.latest(), Some(b));
        assert_eq!(contexts.active(), 1);
        contexts.destroy(b).unwrap();
        assert_eq!(contexts.active(), 0);
        assert_eq!(mock.stats().active_contexts, 0);

        // Destroying twice is a no-op, not a driver call.
        contexts.destroy(a).unwrap();
        assert_eq!(mock.stats().contexts_destroyed, 2);
    }

    #[test]
    fn test_manager_drop_releases_in_reverse_order() {
        let mock = MockDriver::new(1);
        let driver = Driver::new(mock.clone()).unwrap();
        let dev = driver.device(0).unwrap();
        let (first, second) = {
            let mut contexts = ContextManager::new(&driver);
            let a = contexts.create(&dev, ContextFlags::SCHED_AUTO).unwrap();
            let b = contexts.create(&dev, ContextFlags::SCHED_BLOCKING_SYNC).unwrap();
            (contexts.get(a).unwrap().handle(), contexts.get(b).unwrap().handle())
        };
        assert_eq!(mock.destroyed_contexts(), vec![second, first]);
        assert_eq!(mock.stats().active_contexts, 0);
    }

    #[test]
    fn test_explicit_destroy_reports_errors() {
        let mock = MockDriver::new(1);
        let driver = Driver::new(mock.clone()).unwrap();
        let dev = driver.device(0).unwrap();
        let ctx = Context::create(&driver, &dev, ContextFlags::default()).unwrap();
        mock.fail_on(Op::CtxDestroy, crate::status::Status::INVALID_CONTEXT);
        assert!(ctx.destroy().is_err());
    }

    #[test]
    fn test_flags_combine() {
        let flags = ContextFlags::SCHED_YIELD | ContextFlags::MAP_HOST;
        assert_eq!(flags.bits(), 0x0a);
    }
}
