//! Runtime-loaded CUDA driver function pointers via dlopen.
//!
//! This avoids a build-time CUDA dependency: any driver install that ships
//! `libcuda.so.1` (or `nvcuda.dll`) works, and machines without one get a
//! clean initialization error instead of a link failure.

use std::ffi::{c_char, c_int, c_uint, c_void, CStr, CString};
use std::path::Path;

use libloading::Library;

use crate::api::{
    ContextHandle, DeviceAttribute, DeviceHandle, DevicePtr, DriverApi, FunctionHandle,
    ModuleHandle,
};
use crate::error::DriverError;
use crate::launch::{KernelArgs, LaunchConfig};
use crate::status::Status;

// ---------------------------------------------------------------------------
// Driver types
// ---------------------------------------------------------------------------

pub type CuResult = c_int;
pub type CuDevice = c_int;
pub type CuContext = *mut c_void;
pub type CuModule = *mut c_void;
pub type CuFunction = *mut c_void;
pub type CuDeviceptr = u64;
pub type CuStream = *mut c_void;

#[cfg(target_os = "windows")]
const LIBRARY_NAMES: &[&str] = &["nvcuda.dll"];
#[cfg(not(target_os = "windows"))]
const LIBRARY_NAMES: &[&str] = &["libcuda.so.1", "libcuda.so"];

/// Upper bound when probing parameter slots with `cuFuncGetParamInfo`.
const MAX_KERNEL_PARAMS: usize = 1024;

// ---------------------------------------------------------------------------
// Driver API function signatures
// ---------------------------------------------------------------------------

type FnCuInit = unsafe extern "C" fn(c_uint) -> CuResult;
type FnCuDriverGetVersion = unsafe extern "C" fn(*mut c_int) -> CuResult;
type FnCuDeviceGetCount = unsafe extern "C" fn(*mut c_int) -> CuResult;
type FnCuDeviceGet = unsafe extern "C" fn(*mut CuDevice, c_int) -> CuResult;
type FnCuDeviceGetName = unsafe extern "C" fn(*mut c_char, c_int, CuDevice) -> CuResult;
type FnCuDeviceTotalMem = unsafe extern "C" fn(*mut usize, CuDevice) -> CuResult;
type FnCuDeviceGetAttribute = unsafe extern "C" fn(*mut c_int, c_int, CuDevice) -> CuResult;
type FnCuCtxCreate = unsafe extern "C" fn(*mut CuContext, c_uint, CuDevice) -> CuResult;
type FnCuCtxDestroy = unsafe extern "C" fn(CuContext) -> CuResult;
type FnCuCtxSetCurrent = unsafe extern "C" fn(CuContext) -> CuResult;
type FnCuCtxSynchronize = unsafe extern "C" fn() -> CuResult;
type FnCuModuleLoad = unsafe extern "C" fn(*mut CuModule, *const c_char) -> CuResult;
type FnCuModuleLoadData = unsafe extern "C" fn(*mut CuModule, *const c_void) -> CuResult;
type FnCuModuleUnload = unsafe extern "C" fn(CuModule) -> CuResult;
type FnCuModuleGetFunction =
    unsafe extern "C" fn(*mut CuFunction, CuModule, *const c_char) -> CuResult;
type FnCuFuncGetParamInfo =
    unsafe extern "C" fn(CuFunction, usize, *mut usize, *mut usize) -> CuResult;
type FnCuMemAlloc = unsafe extern "C" fn(*mut CuDeviceptr, usize) -> CuResult;
type FnCuMemFree = unsafe extern "C" fn(CuDeviceptr) -> CuResult;
type FnCuMemcpyHtoD = unsafe extern "C" fn(CuDeviceptr, *const c_void, usize) -> CuResult;
type FnCuMemcpyDtoH = unsafe extern "C" fn(*mut c_void, CuDeviceptr, usize) -> CuResult;
type FnCuLaunchKernel = unsafe extern "C" fn(
    CuFunction,
    c_uint, c_uint, c_uint, // grid x, y, z
    c_uint, c_uint, c_uint, // block x, y, z
    c_uint,                 // shared mem bytes
    CuStream,               // stream (null = default)
    *mut *mut c_void,       // kernel params
    *mut *mut c_void,       // extra (null)
) -> CuResult;
type FnCuGetErrorString = unsafe extern "C" fn(CuResult, *mut *const c_char) -> CuResult;

// ---------------------------------------------------------------------------
// Loaded API
// ---------------------------------------------------------------------------

/// The CUDA driver API resolved from the system driver library.
pub struct CudaDriverApi {
    _lib: Library,
    cu_init: FnCuInit,
    cu_driver_get_version: FnCuDriverGetVersion,
    cu_device_get_count: FnCuDeviceGetCount,
    cu_device_get: FnCuDeviceGet,
    cu_device_get_name: FnCuDeviceGetName,
    cu_device_total_mem: FnCuDeviceTotalMem,
    cu_device_get_attribute: FnCuDeviceGetAttribute,
    cu_ctx_create: FnCuCtxCreate,
    cu_ctx_destroy: FnCuCtxDestroy,
    cu_ctx_set_current: FnCuCtxSetCurrent,
    cu_ctx_synchronize: FnCuCtxSynchronize,
    cu_module_load: FnCuModuleLoad,
    cu_module_load_data: FnCuModuleLoadData,
    cu_module_unload: FnCuModuleUnload,
    cu_module_get_function: FnCuModuleGetFunction,
    /// Only present on 12.4+ drivers.
    cu_func_get_param_info: Option<FnCuFuncGetParamInfo>,
    cu_mem_alloc: FnCuMemAlloc,
    cu_mem_free: FnCuMemFree,
    cu_memcpy_htod: FnCuMemcpyHtoD,
    cu_memcpy_dtoh: FnCuMemcpyDtoH,
    cu_launch_kernel: FnCuLaunchKernel,
    cu_get_error_string: FnCuGetErrorString,
}

// Safety: the function pointers are process-global and the driver API is
// internally synchronized.
unsafe impl Send for CudaDriverApi {}
unsafe impl Sync for CudaDriverApi {}

impl CudaDriverApi {
    /// Load the driver library and resolve every entry point this crate uses.
    #[track_caller]
    pub fn load() -> Result<Self, DriverError> {
        let lib = Self::open_library()?;
        match unsafe { Self::resolve(lib) } {
            Ok(api) => Ok(api),
            Err(symbol) => Err(DriverError::unavailable(format!(
                "missing symbol {}",
                symbol.trim_end_matches('\0')
            ))),
        }
    }

    #[track_caller]
    fn open_library() -> Result<Library, DriverError> {
        let mut last_err = String::new();
        for name in LIBRARY_NAMES {
            match unsafe { Library::new(name) } {
                Ok(lib) => {
                    tracing::debug!("loaded CUDA driver library {}", name);
                    return Ok(lib);
                }
                Err(e) => last_err = format!("{name}: {e}"),
            }
        }
        Err(DriverError::unavailable(last_err))
    }

    unsafe fn resolve(lib: Library) -> Result<Self, &'static str> {
        unsafe fn sym<F: Copy>(lib: &Library, name: &'static str) -> Result<F, &'static str> {
            lib.get::<F>(name.as_bytes()).map(|s| *s).map_err(|_| name)
        }

        Ok(CudaDriverApi {
            cu_init: sym(&lib, "cuInit\0")?,
            cu_driver_get_version: sym(&lib, "cuDriverGetVersion\0")?,
            cu_device_get_count: sym(&lib, "cuDeviceGetCount\0")?,
            cu_device_get: sym(&lib, "cuDeviceGet\0")?,
            cu_device_get_name: sym(&lib, "cuDeviceGetName\0")?,
            cu_device_total_mem: sym(&lib, "cuDeviceTotalMem_v2\0")?,
            cu_device_get_attribute: sym(&lib, "cuDeviceGetAttribute\0")?,
            cu_ctx_create: sym(&lib, "cuCtxCreate_v2\0")?,
            cu_ctx_destroy: sym(&lib, "cuCtxDestroy_v2\0")?,
            cu_ctx_set_current: sym(&lib, "cuCtxSetCurrent\0")?,
            cu_ctx_synchronize: sym(&lib, "cuCtxSynchronize\0")?,
            cu_module_load: sym(&lib, "cuModuleLoad\0")?,
            cu_module_load_data: sym(&lib, "cuModuleLoadData\0")?,
            cu_module_unload: sym(&lib, "cuModuleUnload\0")?,
            cu_module_get_function: sym(&lib, "cuModuleGetFunction\0")?,
            cu_func_get_param_info: sym(&lib, "cuFuncGetParamInfo\0").ok(),
            cu_mem_alloc: sym(&lib, "cuMemAlloc_v2\0")?,
            cu_mem_free: sym(&lib, "cuMemFree_v2\0")?,
            cu_memcpy_htod: sym(&lib, "cuMemcpyHtoD_v2\0")?,
            cu_memcpy_dtoh: sym(&lib, "cuMemcpyDtoH_v2\0")?,
            cu_launch_kernel: sym(&lib, "cuLaunchKernel\0")?,
            cu_get_error_string: sym(&lib, "cuGetErrorString\0")?,
            _lib: lib,
        })
    }
}

impl DriverApi for CudaDriverApi {
    fn init(&self, flags: u32) -> Result<(), Status> {
        Status::check(unsafe { (self.cu_init)(flags) })
    }

    fn driver_version(&self) -> Result<i32, Status> {
        let mut version: c_int = 0;
        Status::check(unsafe { (self.cu_driver_get_version)(&mut version) })?;
        Ok(version)
    }

    fn device_count(&self) -> Result<usize, Status> {
        let mut count: c_int = 0;
        Status::check(unsafe { (self.cu_device_get_count)(&mut count) })?;
        Ok(count.max(0) as usize)
    }

    fn device_get(&self, ordinal: usize) -> Result<DeviceHandle, Status> {
        let ordinal = c_int::try_from(ordinal).map_err(|_| Status::INVALID_DEVICE)?;
        let mut device: CuDevice = 0;
        Status::check(unsafe { (self.cu_device_get)(&mut device, ordinal) })?;
        Ok(DeviceHandle(device))
    }

    fn device_name(&self, device: DeviceHandle) -> Result<String, Status> {
        let mut buf = [0 as c_char; 256];
        Status::check(unsafe {
            (self.cu_device_get_name)(buf.as_mut_ptr(), buf.len() as c_int, device.0)
        })?;
        let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
        Ok(name.to_string_lossy().into_owned())
    }

    fn device_total_mem(&self, device: DeviceHandle) -> Result<usize, Status> {
        let mut bytes: usize = 0;
        Status::check(unsafe { (self.cu_device_total_mem)(&mut bytes, device.0) })?;
        Ok(bytes)
    }

    fn device_attribute(&self, device: DeviceHandle, attr: DeviceAttribute) -> Result<i32, Status> {
        let mut value: c_int = 0;
        Status::check(unsafe { (self.cu_device_get_attribute)(&mut value, attr as c_int, device.0) })?;
        Ok(value)
    }

    fn ctx_create(&self, flags: u32, device: DeviceHandle) -> Result<ContextHandle, Status> {
        let mut ctx: CuContext = std::ptr::null_mut();
        Status::check(unsafe { (self.cu_ctx_create)(&mut ctx, flags, device.0) })?;
        Ok(ContextHandle(ctx as usize))
    }

    fn ctx_destroy(&self, ctx: ContextHandle) -> Result<(), Status> {
        Status::check(unsafe { (self.cu_ctx_destroy)(ctx.0 as CuContext) })
    }

    fn ctx_set_current(&self, ctx: ContextHandle) -> Result<(), Status> {
        Status::check(unsafe { (self.cu_ctx_set_current)(ctx.0 as CuContext) })
    }

    fn ctx_synchronize(&self) -> Result<(), Status> {
        Status::check(unsafe { (self.cu_ctx_synchronize)() })
    }

    fn module_load(&self, path: &Path) -> Result<ModuleHandle, Status> {
        let c_path = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| Status::INVALID_VALUE)?;
        let mut module: CuModule = std::ptr::null_mut();
        Status::check(unsafe { (self.cu_module_load)(&mut module, c_path.as_ptr()) })?;
        Ok(ModuleHandle(module as usize))
    }

    fn module_load_data(&self, image: &[u8]) -> Result<ModuleHandle, Status> {
        // PTX images are parsed as C strings; keep a terminating NUL.
        let mut owned;
        let data = if image.last() == Some(&0) {
            image
        } else {
            owned = Vec::with_capacity(image.len() + 1);
            owned.extend_from_slice(image);
            owned.push(0);
            &owned[..]
        };
        let mut module: CuModule = std::ptr::null_mut();
        Status::check(unsafe {
            (self.cu_module_load_data)(&mut module, data.as_ptr() as *const c_void)
        })?;
        Ok(ModuleHandle(module as usize))
    }

    fn module_unload(&self, module: ModuleHandle) -> Result<(), Status> {
        Status::check(unsafe { (self.cu_module_unload)(module.0 as CuModule) })
    }

    fn module_get_function(&self, module: ModuleHandle, name: &str) -> Result<FunctionHandle, Status> {
        let c_name = CString::new(name).map_err(|_| Status::NOT_FOUND)?;
        let mut func: CuFunction = std::ptr::null_mut();
        Status::check(unsafe {
            (self.cu_module_get_function)(&mut func, module.0 as CuModule, c_name.as_ptr())
        })?;
        Ok(FunctionHandle(func as usize))
    }

    fn function_param_count(&self, func: FunctionHandle) -> Result<Option<usize>, Status> {
        let Some(get_param_info) = self.cu_func_get_param_info else {
            return Ok(None);
        };
        for index in 0..MAX_KERNEL_PARAMS {
            let (mut offset, mut size) = (0usize, 0usize);
            let code = unsafe { get_param_info(func.0 as CuFunction, index, &mut offset, &mut size) };
            match Status::check(code) {
                Ok(()) => continue,
                // Past the last parameter.
                Err(Status::INVALID_VALUE) => return Ok(Some(index)),
                Err(status) => return Err(status),
            }
        }
        Ok(None)
    }

    fn mem_alloc(&self, bytes: usize) -> Result<DevicePtr, Status> {
        let mut ptr: CuDeviceptr = 0;
        Status::check(unsafe { (self.cu_mem_alloc)(&mut ptr, bytes) })?;
        Ok(DevicePtr(ptr))
    }

    fn mem_free(&self, ptr: DevicePtr) -> Result<(), Status> {
        Status::check(unsafe { (self.cu_mem_free)(ptr.0) })
    }

    unsafe fn memcpy_htod(&self, dst: DevicePtr, src: &[u8]) -> Result<(), Status> {
        Status::check((self.cu_memcpy_htod)(dst.0, src.as_ptr() as *const c_void, src.len()))
    }

    unsafe fn memcpy_dtoh(&self, dst: &mut [u8], src: DevicePtr) -> Result<(), Status> {
        Status::check((self.cu_memcpy_dtoh)(dst.as_mut_ptr() as *mut c_void, src.0, dst.len()))
    }

    unsafe fn launch_kernel(
        &self,
        func: FunctionHandle,
        config: &LaunchConfig,
        args: &KernelArgs,
    ) -> Result<(), Status> {
        // One pointer per slot, each pointing at the slot's value inside `args`.
        let mut params: Vec<*mut c_void> = args.iter().map(|arg| arg.as_param_ptr()).collect();
        Status::check((self.cu_launch_kernel)(
            func.0 as CuFunction,
            config.grid.x as c_uint,
            config.grid.y as c_uint,
            config.grid.z as c_uint,
            config.block.x as c_uint,
            config.block.y as c_uint,
            config.block.z as c_uint,
            config.shared_mem_bytes as c_uint,
            std::ptr::null_mut(), // default stream
            params.as_mut_ptr(),
            std::ptr::null_mut(), // extra
        ))
    }

    fn error_string(&self, status: Status) -> Option<String> {
        let mut ptr: *const c_char = std::ptr::null();
        let code = unsafe { (self.cu_get_error_string)(status.code(), &mut ptr) };
        if code != 0 || ptr.is_null() {
            return None;
        }
        Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
    }
}
