//! Precompiled module loading and entry point resolution.
//!
//! A [`Module`] borrows the context it was loaded into, and a [`Kernel`]
//! borrows its module, so a kernel handle can never outlive the image it
//! points into.

use std::path::{Path, PathBuf};

use crate::api::{ContextHandle, FunctionHandle, ModuleHandle};
use crate::context::Context;
use crate::error::{DriverError, Op, Result};
use crate::launch::{KernelSignature, TypedKernel};

/// Where a module image came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSource {
    File(PathBuf),
    Memory { bytes: usize },
}

impl std::fmt::Display for ModuleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleSource::File(path) => write!(f, "{}", path.display()),
            ModuleSource::Memory { bytes } => write!(f, "<{bytes}-byte image>"),
        }
    }
}

/// A loaded binary image, unloaded on drop.
pub struct Module<'c> {
    ctx: &'c Context<'c>,
    handle: ModuleHandle,
    source: ModuleSource,
    released: bool,
}

impl<'d> Context<'d> {
    /// Load a precompiled module (PTX, cubin, or fatbin) from `path`.
    ///
    /// Fails with a resolution error when the file is missing, malformed, or
    /// built for an incompatible architecture.
    #[track_caller]
    pub fn load_module(&self, path: impl AsRef<Path>) -> Result<Module<'_>> {
        let path = path.as_ref();
        self.bind()?;
        let result = self.driver().api().module_load(path);
        let handle = self.driver().check(Op::ModuleLoad, result)?;
        tracing::debug!(path = %path.display(), ?handle, "module loaded");
        Ok(Module {
            ctx: self,
            handle,
            source: ModuleSource::File(path.to_path_buf()),
            released: false,
        })
    }

    /// Load a module from an in-memory image.
    #[track_caller]
    pub fn load_module_data(&self, image: &[u8]) -> Result<Module<'_>> {
        self.bind()?;
        let result = self.driver().api().module_load_data(image);
        let handle = self.driver().check(Op::ModuleLoadData, result)?;
        tracing::debug!(bytes = image.len(), ?handle, "module loaded from memory");
        Ok(Module {
            ctx: self,
            handle,
            source: ModuleSource::Memory { bytes: image.len() },
            released: false,
        })
    }
}

impl<'c> Module<'c> {
    pub fn handle(&self) -> ModuleHandle {
        self.handle
    }

    pub fn source(&self) -> &ModuleSource {
        &self.source
    }

    pub fn context(&self) -> &'c Context<'c> {
        self.ctx
    }

    /// Resolve the entry point `name`.
    #[track_caller]
    pub fn function(&self, name: &str) -> Result<Kernel<'_>> {
        let driver = self.ctx.driver();
        let result = driver.api().module_get_function(self.handle, name);
        let handle = driver.check(Op::ModuleGetFunction, result)?;
        let result = driver.api().function_param_count(handle);
        let param_count = driver.check(Op::FuncGetParamInfo, result)?;
        tracing::debug!(name, ?handle, ?param_count, "kernel resolved");
        Ok(Kernel {
            module: self,
            handle,
            name: name.to_string(),
            param_count,
        })
    }

    /// Resolve `name` and pin its parameter list to `S`.
    ///
    /// When the driver can report the entry point's parameter count it must
    /// equal `S::ARITY`.
    ///
    /// # Safety
    /// The entry point's parameters must have exactly the types of `S`, in
    /// order. Types are not recorded in the image, so only the count can be
    /// verified here.
    #[track_caller]
    pub unsafe fn typed_function<S: KernelSignature>(&self, name: &str) -> Result<TypedKernel<'_, S>> {
        let kernel = self.function(name)?;
        if let Some(count) = kernel.param_count() {
            if count != S::ARITY {
                return Err(DriverError::argument_count(name, count, S::ARITY));
            }
        }
        Ok(TypedKernel::new_unchecked(kernel))
    }

    /// Unload the module, reporting failures.
    #[track_caller]
    pub fn unload(mut self) -> Result<()> {
        if self.ctx.has_work_in_flight() {
            self.ctx.synchronize()?;
        }
        self.ctx.bind()?;
        self.released = true;
        let result = self.ctx.driver().api().module_unload(self.handle);
        self.ctx.driver().check(Op::ModuleUnload, result)?;
        tracing::debug!(source = %self.source, "module unloaded");
        Ok(())
    }
}

impl Drop for Module<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.ctx.drain();
        let api = self.ctx.driver().api();
        let result = api.ctx_set_current(self.ctx.handle()).and_then(|()| api.module_unload(self.handle));
        match result {
            Ok(()) => tracing::debug!(source = %self.source, "module unloaded"),
            Err(status) => tracing::warn!(source = %self.source, %status, "module unload failed"),
        }
    }
}

/// A callable entry point resolved from a [`Module`].
pub struct Kernel<'m> {
    module: &'m Module<'m>,
    handle: FunctionHandle,
    name: String,
    param_count: Option<usize>,
}

impl<'m> Kernel<'m> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> FunctionHandle {
        self.handle
    }

    /// Parameter count reported by the driver, if it supports introspection.
    pub fn param_count(&self) -> Option<usize> {
        self.param_count
    }

    pub fn module(&self) -> &'m Module<'m> {
        self.module
    }

    pub(crate) fn context_handle(&self) -> ContextHandle {
        self.module.ctx.handle()
    }
}
