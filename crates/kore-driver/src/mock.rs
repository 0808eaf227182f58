//! In-process fake of the driver API.
//!
//! `MockDriver` keeps real byte-backed device memory, so copies round-trip,
//! and it can run registered kernels as host closures. It enforces the
//! driver's ordering rules (init first, a current context for context-scoped
//! calls, handles must be live) and counts every acquire and release, which
//! is what the lifecycle tests assert on.
//!
//! Clones share state: hand one clone to [`crate::Driver::new`] and keep the
//! other for inspection.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::Mutex;

use crate::api::{
    ContextHandle, DeviceAttribute, DeviceHandle, DevicePtr, DriverApi, FunctionHandle,
    ModuleHandle,
};
use crate::error::Op;
use crate::launch::{KernelArg, KernelArgs, LaunchConfig};
use crate::status::Status;

/// Host-side body executed for a mock kernel launch.
pub type KernelBody =
    Arc<dyn Fn(&LaunchConfig, &[KernelArg], &mut MockMemory) -> Result<(), Status> + Send + Sync>;

/// First address handed out by the mock allocator.
const BASE_ADDRESS: u64 = 0x7f00_0000_0000;
const ALIGNMENT: u64 = 256;
const DEFAULT_TOTAL_MEM: usize = 1 << 30;

/// Counters describing everything acquired and released so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockStats {
    pub allocations: usize,
    pub frees: usize,
    pub live_allocations: usize,
    pub contexts_created: usize,
    pub contexts_destroyed: usize,
    pub active_contexts: usize,
    pub modules_loaded: usize,
    pub modules_unloaded: usize,
    pub loaded_modules: usize,
    pub launches: usize,
    pub synchronizations: usize,
    /// Contexts destroyed while a launch was still unsynchronized.
    pub destroyed_with_pending_work: usize,
}

/// One recorded kernel launch.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRecord {
    pub kernel: String,
    pub context: ContextHandle,
    pub config: LaunchConfig,
    pub args: Vec<KernelArg>,
}

/// Mock device memory: allocations keyed by base address.
#[derive(Default)]
pub struct MockMemory {
    allocations: BTreeMap<u64, Allocation>,
    next_addr: u64,
    used: usize,
}

struct Allocation {
    bytes: Vec<u8>,
}

impl MockMemory {
    fn alloc(&mut self, nbytes: usize) -> DevicePtr {
        if self.next_addr == 0 {
            self.next_addr = BASE_ADDRESS;
        }
        let addr = self.next_addr;
        let span = (nbytes as u64).div_ceil(ALIGNMENT).max(1) * ALIGNMENT;
        self.next_addr += span;
        self.allocations.insert(addr, Allocation { bytes: vec![0; nbytes] });
        self.used += nbytes;
        DevicePtr(addr)
    }

    fn free(&mut self, ptr: DevicePtr) -> Result<(), Status> {
        match self.allocations.remove(&ptr.0) {
            Some(a) => {
                self.used -= a.bytes.len();
                Ok(())
            }
            None => Err(Status::INVALID_VALUE),
        }
    }

    /// Find the allocation containing `[ptr, ptr + len)`.
    fn locate(&self, ptr: DevicePtr, len: usize) -> Result<(u64, usize), Status> {
        let (&base, alloc) = self.allocations.range(..=ptr.0).next_back().ok_or(Status::INVALID_VALUE)?;
        let offset = (ptr.0 - base) as usize;
        if offset + len > alloc.bytes.len() {
            return Err(Status::INVALID_VALUE);
        }
        Ok((base, offset))
    }

    pub fn read_bytes(&self, ptr: DevicePtr, len: usize) -> Result<&[u8], Status> {
        let (base, offset) = self.locate(ptr, len)?;
        Ok(&self.allocations[&base].bytes[offset..offset + len])
    }

    pub fn write_bytes(&mut self, ptr: DevicePtr, data: &[u8]) -> Result<(), Status> {
        let (base, offset) = self.locate(ptr, data.len())?;
        let alloc = self.allocations.get_mut(&base).ok_or(Status::INVALID_VALUE)?;
        alloc.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Read `len` values of `T` starting at `ptr`.
    pub fn read<T: Pod>(&self, ptr: DevicePtr, len: usize) -> Result<Vec<T>, Status> {
        let bytes = self.read_bytes(ptr, len * std::mem::size_of::<T>())?;
        let mut out = vec![T::zeroed(); len];
        bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(bytes);
        Ok(out)
    }

    pub fn write<T: Pod>(&mut self, ptr: DevicePtr, data: &[T]) -> Result<(), Status> {
        self.write_bytes(ptr, bytemuck::cast_slice(data))
    }

    pub fn live(&self) -> usize {
        self.allocations.len()
    }
}

struct MockKernel {
    params: usize,
    body: Option<KernelBody>,
}

struct ContextState {
    pending: bool,
    /// Device-side fault surfaced at the next synchronize.
    fault: Option<Status>,
}

struct ModuleState {
    ctx: usize,
    exports: Vec<String>,
}

struct FunctionState {
    module: usize,
    name: String,
}

struct MockState {
    device_count: usize,
    total_mem: usize,
    param_introspection: bool,
    initialized: bool,
    next_handle: usize,
    current: Option<usize>,
    contexts: HashMap<usize, ContextState>,
    modules: HashMap<usize, ModuleState>,
    functions: HashMap<usize, FunctionState>,
    kernels: HashMap<String, MockKernel>,
    memory: MockMemory,
    failures: HashMap<Op, Status>,
    failures_once: HashMap<Op, Status>,
    calls: Vec<Op>,
    destroyed: Vec<ContextHandle>,
    launches: Vec<LaunchRecord>,
    stats: MockStats,
}

impl MockState {
    /// Record the call, then apply injected failures and the init rule.
    fn enter(&mut self, op: Op) -> Result<(), Status> {
        self.calls.push(op);
        if let Some(status) = self.failures_once.remove(&op) {
            return Err(status);
        }
        if let Some(&status) = self.failures.get(&op) {
            return Err(status);
        }
        if !self.initialized && !matches!(op, Op::Init | Op::DriverGetVersion) {
            return Err(Status::NOT_INITIALIZED);
        }
        Ok(())
    }

    fn current(&self) -> Result<usize, Status> {
        match self.current {
            Some(ctx) if self.contexts.contains_key(&ctx) => Ok(ctx),
            _ => Err(Status::INVALID_CONTEXT),
        }
    }

    fn handle(&mut self) -> usize {
        self.next_handle += 1;
        self.next_handle
    }

    fn load_image(&mut self, image: &[u8]) -> Result<ModuleHandle, Status> {
        let ctx = self.current()?;
        if image.iter().all(|b| *b == 0 || b.is_ascii_whitespace()) {
            return Err(Status::INVALID_IMAGE);
        }
        let text = String::from_utf8_lossy(image);
        let exports = self
            .kernels
            .keys()
            .filter(|name| contains_symbol(&text, name))
            .cloned()
            .collect();
        let id = self.handle();
        self.modules.insert(id, ModuleState { ctx, exports });
        self.stats.modules_loaded += 1;
        Ok(ModuleHandle(id))
    }

    fn snapshot(&self) -> MockStats {
        MockStats {
            live_allocations: self.memory.live(),
            active_contexts: self.contexts.len(),
            loaded_modules: self.modules.len(),
            ..self.stats
        }
    }
}

/// Whether `name` occurs in `text` as a whole identifier.
fn contains_symbol(text: &str, name: &str) -> bool {
    let is_ident = |c: char| c.is_ascii_alphanumeric() || c == '_';
    text.match_indices(name).any(|(i, _)| {
        let before = text[..i].chars().next_back();
        let after = text[i + name.len()..].chars().next();
        !before.is_some_and(is_ident) && !after.is_some_and(is_ident)
    })
}

/// Fake driver with shared, inspectable state.
#[derive(Clone)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    /// A driver exposing `device_count` devices and no kernels.
    pub fn new(device_count: usize) -> Self {
        let state = MockState {
            device_count,
            total_mem: DEFAULT_TOTAL_MEM,
            param_introspection: true,
            initialized: false,
            next_handle: 0,
            current: None,
            contexts: HashMap::new(),
            modules: HashMap::new(),
            functions: HashMap::new(),
            kernels: HashMap::new(),
            memory: MockMemory::default(),
            failures: HashMap::new(),
            failures_once: HashMap::new(),
            calls: Vec::new(),
            destroyed: Vec::new(),
            launches: Vec::new(),
            stats: MockStats::default(),
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    /// Register an entry point with `params` parameters and no body.
    pub fn with_kernel(self, name: &str, params: usize) -> Self {
        self.state.lock().kernels.insert(name.to_string(), MockKernel { params, body: None });
        self
    }

    /// Register an entry point whose launches run `body` on the host.
    pub fn with_kernel_body<F>(self, name: &str, params: usize, body: F) -> Self
    where
        F: Fn(&LaunchConfig, &[KernelArg], &mut MockMemory) -> Result<(), Status> + Send + Sync + 'static,
    {
        let kernel = MockKernel { params, body: Some(Arc::new(body)) };
        self.state.lock().kernels.insert(name.to_string(), kernel);
        self
    }

    /// Register `vector_add(out, a, b, n)` computing `out[i] = a[i] + b[i]`.
    pub fn with_vector_add(self) -> Self {
        self.with_kernel_body("vector_add", 4, vector_add)
    }

    /// Cap total device memory.
    pub fn with_total_mem(self, bytes: usize) -> Self {
        self.state.lock().total_mem = bytes;
        self
    }

    /// Behave like a driver without `cuFuncGetParamInfo`.
    pub fn without_param_introspection(self) -> Self {
        self.state.lock().param_introspection = false;
        self
    }

    /// Make every subsequent call of `op` fail with `status`.
    pub fn fail_on(&self, op: Op, status: Status) {
        self.state.lock().failures.insert(op, status);
    }

    /// Make only the next call of `op` fail with `status`.
    pub fn fail_once(&self, op: Op, status: Status) {
        self.state.lock().failures_once.insert(op, status);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failures.clear();
        state.failures_once.clear();
    }

    /// Every driver entry point called so far, in order.
    pub fn calls(&self) -> Vec<Op> {
        self.state.lock().calls.clone()
    }

    /// Number of calls made to `op`.
    pub fn call_count(&self, op: Op) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == op).count()
    }

    pub fn stats(&self) -> MockStats {
        self.state.lock().snapshot()
    }

    /// Destroyed contexts, in destruction order.
    pub fn destroyed_contexts(&self) -> Vec<ContextHandle> {
        self.state.lock().destroyed.clone()
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.state.lock().launches.clone()
    }

    pub fn current_context(&self) -> Option<ContextHandle> {
        self.state.lock().current.map(ContextHandle)
    }

    /// Read device memory directly, bypassing the driver call log.
    pub fn read_memory<T: Pod>(&self, ptr: DevicePtr, len: usize) -> Result<Vec<T>, Status> {
        self.state.lock().memory.read(ptr, len)
    }
}

impl DriverApi for MockDriver {
    fn init(&self, _flags: u32) -> Result<(), Status> {
        let mut s = self.state.lock();
        s.enter(Op::Init)?;
        if s.device_count == 0 {
            return Err(Status::NO_DEVICE);
        }
        s.initialized = true;
        Ok(())
    }

    fn driver_version(&self) -> Result<i32, Status> {
        self.state.lock().enter(Op::DriverGetVersion)?;
        Ok(12040)
    }

    fn device_count(&self) -> Result<usize, Status> {
        let mut s = self.state.lock();
        s.enter(Op::DeviceGetCount)?;
        Ok(s.device_count)
    }

    fn device_get(&self, ordinal: usize) -> Result<DeviceHandle, Status> {
        let mut s = self.state.lock();
        s.enter(Op::DeviceGet)?;
        if ordinal >= s.device_count {
            return Err(Status::INVALID_DEVICE);
        }
        Ok(DeviceHandle(ordinal as i32))
    }

    fn device_name(&self, device: DeviceHandle) -> Result<String, Status> {
        let mut s = self.state.lock();
        s.enter(Op::DeviceGetName)?;
        check_device(&s, device)?;
        Ok("Kore Mock Device".to_string())
    }

    fn device_total_mem(&self, device: DeviceHandle) -> Result<usize, Status> {
        let mut s = self.state.lock();
        s.enter(Op::DeviceTotalMem)?;
        check_device(&s, device)?;
        Ok(s.total_mem)
    }

    fn device_attribute(&self, device: DeviceHandle, attr: DeviceAttribute) -> Result<i32, Status> {
        let mut s = self.state.lock();
        s.enter(Op::DeviceGetAttribute)?;
        check_device(&s, device)?;
        Ok(match attr {
            DeviceAttribute::MaxThreadsPerBlock => 1024,
            DeviceAttribute::MaxBlockDimX | DeviceAttribute::MaxBlockDimY => 1024,
            DeviceAttribute::MaxBlockDimZ => 64,
            DeviceAttribute::MaxGridDimX => i32::MAX,
            DeviceAttribute::MaxGridDimY | DeviceAttribute::MaxGridDimZ => 65535,
            DeviceAttribute::MaxSharedMemoryPerBlock => 48 * 1024,
            DeviceAttribute::MultiprocessorCount => 84,
            DeviceAttribute::ComputeCapabilityMajor => 8,
            DeviceAttribute::ComputeCapabilityMinor => 6,
        })
    }

    fn ctx_create(&self, _flags: u32, device: DeviceHandle) -> Result<ContextHandle, Status> {
        let mut s = self.state.lock();
        s.enter(Op::CtxCreate)?;
        check_device(&s, device)?;
        let id = s.handle();
        s.contexts.insert(id, ContextState { pending: false, fault: None });
        s.current = Some(id);
        s.stats.contexts_created += 1;
        Ok(ContextHandle(id))
    }

    fn ctx_destroy(&self, ctx: ContextHandle) -> Result<(), Status> {
        let mut s = self.state.lock();
        s.enter(Op::CtxDestroy)?;
        let state = s.contexts.remove(&ctx.0).ok_or(Status::INVALID_CONTEXT)?;
        if state.pending {
            s.stats.destroyed_with_pending_work += 1;
        }
        if s.current == Some(ctx.0) {
            s.current = None;
        }
        s.destroyed.push(ctx);
        s.stats.contexts_destroyed += 1;
        Ok(())
    }

    fn ctx_set_current(&self, ctx: ContextHandle) -> Result<(), Status> {
        let mut s = self.state.lock();
        s.enter(Op::CtxSetCurrent)?;
        if !s.contexts.contains_key(&ctx.0) {
            return Err(Status::INVALID_CONTEXT);
        }
        s.current = Some(ctx.0);
        Ok(())
    }

    fn ctx_synchronize(&self) -> Result<(), Status> {
        let mut s = self.state.lock();
        s.enter(Op::CtxSynchronize)?;
        let ctx = s.current()?;
        s.stats.synchronizations += 1;
        let state = s.contexts.get_mut(&ctx).ok_or(Status::INVALID_CONTEXT)?;
        state.pending = false;
        match state.fault {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    fn module_load(&self, path: &Path) -> Result<ModuleHandle, Status> {
        let mut s = self.state.lock();
        s.enter(Op::ModuleLoad)?;
        s.current()?;
        let image = std::fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Status::FILE_NOT_FOUND,
            _ => Status::INVALID_VALUE,
        })?;
        s.load_image(&image)
    }

    fn module_load_data(&self, image: &[u8]) -> Result<ModuleHandle, Status> {
        let mut s = self.state.lock();
        s.enter(Op::ModuleLoadData)?;
        s.load_image(image)
    }

    fn module_unload(&self, module: ModuleHandle) -> Result<(), Status> {
        let mut s = self.state.lock();
        s.enter(Op::ModuleUnload)?;
        s.current()?;
        s.modules.remove(&module.0).ok_or(Status::INVALID_HANDLE)?;
        s.functions.retain(|_, f| f.module != module.0);
        s.stats.modules_unloaded += 1;
        Ok(())
    }

    fn module_get_function(&self, module: ModuleHandle, name: &str) -> Result<FunctionHandle, Status> {
        let mut s = self.state.lock();
        s.enter(Op::ModuleGetFunction)?;
        let m = s.modules.get(&module.0).ok_or(Status::INVALID_HANDLE)?;
        if !m.exports.iter().any(|e| e == name) {
            return Err(Status::NOT_FOUND);
        }
        let id = s.handle();
        s.functions.insert(id, FunctionState { module: module.0, name: name.to_string() });
        Ok(FunctionHandle(id))
    }

    fn function_param_count(&self, func: FunctionHandle) -> Result<Option<usize>, Status> {
        let mut s = self.state.lock();
        s.enter(Op::FuncGetParamInfo)?;
        if !s.param_introspection {
            return Ok(None);
        }
        let f = s.functions.get(&func.0).ok_or(Status::INVALID_HANDLE)?;
        Ok(s.kernels.get(&f.name).map(|k| k.params))
    }

    fn mem_alloc(&self, bytes: usize) -> Result<DevicePtr, Status> {
        let mut s = self.state.lock();
        s.enter(Op::MemAlloc)?;
        s.current()?;
        if bytes == 0 {
            return Err(Status::INVALID_VALUE);
        }
        if s.memory.used + bytes > s.total_mem {
            return Err(Status::OUT_OF_MEMORY);
        }
        s.stats.allocations += 1;
        Ok(s.memory.alloc(bytes))
    }

    fn mem_free(&self, ptr: DevicePtr) -> Result<(), Status> {
        let mut s = self.state.lock();
        s.enter(Op::MemFree)?;
        s.memory.free(ptr)?;
        s.stats.frees += 1;
        Ok(())
    }

    unsafe fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<(), Status> {
        let mut s = self.state.lock();
        s.enter(Op::MemcpyHtoD)?;
        s.current()?;
        s.memory.write_bytes(dst, src)
    }

    unsafe fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), Status> {
        let mut s = self.state.lock();
        s.enter(Op::MemcpyDtoH)?;
        s.current()?;
        dst.copy_from_slice(s.memory.read_bytes(src, dst.len())?);
        Ok(())
    }

    unsafe fn launch_kernel(
        &self,
        func: FunctionHandle,
        config: &LaunchConfig,
        args: &KernelArgs,
    ) -> Result<(), Status> {
        let mut s = self.state.lock();
        s.enter(Op::LaunchKernel)?;
        let ctx = s.current()?;
        let f = s.functions.get(&func.0).ok_or(Status::INVALID_HANDLE)?;
        let name = f.name.clone();
        let module_ctx = s.modules.get(&f.module).map(|m| m.ctx).ok_or(Status::INVALID_HANDLE)?;
        if module_ctx != ctx {
            return Err(Status::INVALID_CONTEXT);
        }
        let (grid, block) = (config.grid, config.block);
        let oversized = block.volume().map_or(true, |threads| threads > 1024);
        if [grid.x, grid.y, grid.z, block.x, block.y, block.z].contains(&0) || oversized {
            return Err(Status::INVALID_VALUE);
        }
        let kernel = s.kernels.get(&name).ok_or(Status::INVALID_HANDLE)?;
        if kernel.params != args.len() {
            return Err(Status::LAUNCH_FAILED);
        }
        let body = kernel.body.clone();

        s.stats.launches += 1;
        s.launches.push(LaunchRecord {
            kernel: name,
            context: ContextHandle(ctx),
            config: *config,
            args: args.as_slice().to_vec(),
        });
        let fault = match body {
            Some(body) => body(config, args.as_slice(), &mut s.memory).err(),
            None => None,
        };
        if let Some(state) = s.contexts.get_mut(&ctx) {
            state.pending = true;
            state.fault = state.fault.or(fault);
        }
        Ok(())
    }

    fn error_string(&self, status: Status) -> Option<String> {
        Some(status.default_description().to_string())
    }
}

fn check_device(s: &MockState, device: DeviceHandle) -> Result<(), Status> {
    if device.0 < 0 || device.0 as usize >= s.device_count {
        return Err(Status::INVALID_DEVICE);
    }
    Ok(())
}

/// Host model of `vector_add(float* out, const float* a, const float* b, int n)`.
///
/// Threads with index `>= n` do nothing, as in the device code.
fn vector_add(config: &LaunchConfig, args: &[KernelArg], mem: &mut MockMemory) -> Result<(), Status> {
    let [out, a, b, n] = args else {
        return Err(Status::LAUNCH_FAILED);
    };
    let (Some(out), Some(a), Some(b), Some(n)) = (out.as_ptr(), a.as_ptr(), b.as_ptr(), n.as_i32()) else {
        return Err(Status::LAUNCH_FAILED);
    };
    let active = (n.max(0) as u64).min(config.total_threads().unwrap_or(u64::MAX)) as usize;
    let xs: Vec<f32> = mem.read(a, active).map_err(|_| Status::ILLEGAL_ADDRESS)?;
    let ys: Vec<f32> = mem.read(b, active).map_err(|_| Status::ILLEGAL_ADDRESS)?;
    let sum: Vec<f32> = xs.iter().zip(&ys).map(|(x, y)| x + y).collect();
    mem.write(out, &sum).map_err(|_| Status::ILLEGAL_ADDRESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calls_before_init_fail() {
        let mock = MockDriver::new(1);
        assert_eq!(mock.device_get(0), Err(Status::NOT_INITIALIZED));
        assert_eq!(mock.mem_alloc(16), Err(Status::NOT_INITIALIZED));
        mock.init(0).unwrap();
        assert!(mock.device_get(0).is_ok());
    }

    #[test]
    fn test_no_devices() {
        let mock = MockDriver::new(0);
        assert_eq!(mock.init(0), Err(Status::NO_DEVICE));
    }

    #[test]
    fn test_context_scoped_calls_need_current() {
        let mock = MockDriver::new(1);
        mock.init(0).unwrap();
        let dev = mock.device_get(0).unwrap();
        let ctx = mock.ctx_create(0, dev).unwrap();
        assert_eq!(mock.current_context(), Some(ctx));
        mock.ctx_destroy(ctx).unwrap();
        assert_eq!(mock.current_context(), None);
        assert_eq!(mock.mem_alloc(16), Err(Status::INVALID_CONTEXT));
    }

    #[test]
    fn test_second_context_becomes_current() {
        let mock = MockDriver::new(1);
        mock.init(0).unwrap();
        let dev = mock.device_get(0).unwrap();
        let a = mock.ctx_create(0, dev).unwrap();
        let b = mock.ctx_create(0, dev).unwrap();
        assert_eq!(mock.current_context(), Some(b));
        mock.ctx_set_current(a).unwrap();
        assert_eq!(mock.current_context(), Some(a));
    }

    #[test]
    fn test_memory_bounds() {
        let mut mem = MockMemory::default();
        let p = mem.alloc(16);
        mem.write(p, &[1u32, 2, 3, 4]).unwrap();
        assert_eq!(mem.read::<u32>(DevicePtr(p.0 + 8), 2).unwrap(), vec![3, 4]);
        assert_eq!(mem.read::<u32>(p, 5), Err(Status::INVALID_VALUE));
        assert_eq!(mem.free(p), Ok(()));
        assert_eq!(mem.free(p), Err(Status::INVALID_VALUE));
    }

    #[test]
    fn test_symbol_matching() {
        assert!(contains_symbol(".entry vector_add(", "vector_add"));
        assert!(!contains_symbol(".entry vector_add2(", "vector_add"));
        assert!(!contains_symbol(".entry my_vector_add(", "vector_add"));
    }

    #[test]
    fn test_fault_surfaces_at_synchronize() {
        let mock = MockDriver::new(1)
            .with_kernel_body("crash", 0, |_, _, _| Err(Status::ILLEGAL_ADDRESS));
        mock.init(0).unwrap();
        let dev = mock.device_get(0).unwrap();
        mock.ctx_create(0, dev).unwrap();
        let module = mock.module_load_data(b".entry crash()").unwrap();
        let f = mock.module_get_function(module, "crash").unwrap();
        let cfg = LaunchConfig::linear(32, 32).unwrap();
        unsafe { mock.launch_kernel(f, &cfg, &KernelArgs::new()).unwrap() };
        assert_eq!(mock.ctx_synchronize(), Err(Status::ILLEGAL_ADDRESS));
    }
}
