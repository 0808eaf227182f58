//! End-to-end lifecycle tests against the mock driver.
//! Run with: cargo test -p kore-driver --test lifecycle_tests

use std::io::Write;

use kore_driver::{
    diagnostic, Context, ContextFlags, ContextManager, DevicePtr, Driver, DriverError, ErrorKind,
    ErrorReporter, KernelArgs, LaunchConfig, LifecycleCoordinator, MockDriver, Op, RunConfig,
    Stage, Status, VectorAddSignature,
};

const PTX: &str = include_str!("../../../kernels/vector_add.ptx");

fn module_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(PTX.as_bytes()).unwrap();
    file
}

fn run_config(file: &tempfile::NamedTempFile) -> RunConfig {
    RunConfig { module_path: file.path().to_path_buf(), ..Default::default() }
}

fn assert_balanced(mock: &MockDriver) {
    let stats = mock.stats();
    assert_eq!(stats.allocations, stats.frees, "allocate/free mismatch: {stats:?}");
    assert_eq!(stats.live_allocations, 0);
    assert_eq!(stats.active_contexts, 0);
    assert_eq!(stats.loaded_modules, 0);
    assert_eq!(stats.contexts_created, stats.contexts_destroyed);
}

// ============================================================================
// Full run
// ============================================================================

#[test]
fn test_reference_run() {
    let file = module_file();
    let mock = MockDriver::new(1).with_vector_add();
    let driver = Driver::new(mock.clone()).unwrap();

    let report = LifecycleCoordinator::new(&driver, run_config(&file)).run().unwrap();

    assert_eq!((report.grid.x, report.grid.y, report.grid.z), (4, 1, 1));
    assert_eq!((report.block.x, report.block.y, report.block.z), (256, 1, 1));
    assert_eq!(report.total_threads, 1024);
    assert_eq!(report.padding_threads, 0);
    assert_eq!(report.output.len(), 1024);
    assert!(report.output.iter().all(|v| *v == 3.0));
    assert_eq!(report.transitions.last(), Some(&Stage::Completed));

    let stats = mock.stats();
    assert_eq!(stats.allocations, 3);
    assert_eq!(stats.contexts_created, 2);
    assert_eq!(stats.launches, 1);
    assert_eq!(stats.destroyed_with_pending_work, 0);
    assert_balanced(&mock);
}

#[test]
fn test_uneven_problem_size_is_bounds_checked() {
    let file = module_file();
    let mock = MockDriver::new(1).with_vector_add();
    let driver = Driver::new(mock.clone()).unwrap();
    let config = RunConfig { problem_size: 1000, fill_a: 0.25, fill_b: 0.5, ..run_config(&file) };

    let report = LifecycleCoordinator::new(&driver, config).run().unwrap();

    assert_eq!(report.grid.x, 4);
    assert_eq!(report.padding_threads, 24);
    assert_eq!(report.output.len(), 1000);
    assert_eq!(report.mismatches(0.75), 0);
    assert_balanced(&mock);
}

#[test]
fn test_launch_record() {
    let file = module_file();
    let mock = MockDriver::new(1).with_vector_add();
    let driver = Driver::new(mock.clone()).unwrap();
    LifecycleCoordinator::new(&driver, run_config(&file)).run().unwrap();

    let launches = mock.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].kernel, "vector_add");
    assert_eq!(launches[0].config, LaunchConfig::linear(1024, 256).unwrap());
    assert_eq!(launches[0].args.len(), 4);
    assert_eq!(launches[0].args[3].as_i32(), Some(1024));
}

#[test]
fn test_synchronize_precedes_teardown() {
    let file = module_file();
    let mock = MockDriver::new(1).with_vector_add();
    let driver = Driver::new(mock.clone()).unwrap();
    LifecycleCoordinator::new(&driver, run_config(&file)).run().unwrap();

    let calls = mock.calls();
    let launch = calls.iter().position(|c| *c == Op::LaunchKernel).unwrap();
    let sync = calls.iter().position(|c| *c == Op::CtxSynchronize).unwrap();
    let first_free = calls.iter().position(|c| *c == Op::MemFree).unwrap();
    let unload = calls.iter().position(|c| *c == Op::ModuleUnload).unwrap();
    let destroy = calls.iter().position(|c| *c == Op::CtxDestroy).unwrap();
    assert!(launch < sync);
    assert!(sync < first_free);
    assert!(first_free < unload);
    assert!(unload < destroy);
}

// ============================================================================
// Failure paths
// ============================================================================

#[test]
fn test_missing_device() {
    let mock = MockDriver::new(1).with_vector_add();
    let driver = Driver::new(mock.clone()).unwrap();
    let config = RunConfig { device_index: 5, ..Default::default() };

    let mut coordinator = LifecycleCoordinator::new(&driver, config);
    let err = coordinator.run().unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Resolution);
    assert_eq!(err.status(), Some(Status::INVALID_DEVICE));
    assert_eq!(err.exit_code(), 101);
    assert_eq!(coordinator.transitions(), &[Stage::Failed]);
    assert_eq!(mock.calls(), vec![Op::Init, Op::DeviceGet]);
    let stats = mock.stats();
    assert_eq!(stats.contexts_created, 0);
    assert_eq!(stats.allocations, 0);
}

#[test]
fn test_missing_module_fails_before_allocation() {
    let mock = MockDriver::new(1).with_vector_add();
    let driver = Driver::new(mock.clone()).unwrap();
    let config = RunConfig { module_path: "/no/such/dir/vector_add.ptx".into(), ..Default::default() };

    let mut coordinator = LifecycleCoordinator::new(&driver, config);
    let err = coordinator.run().unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Resolution);
    assert_eq!(err.status(), Some(Status::FILE_NOT_FOUND));
    assert_eq!(
        coordinator.transitions(),
        &[Stage::DeviceResolved, Stage::ContextActive, Stage::Failed]
    );
    assert_eq!(mock.call_count(Op::MemAlloc), 0);
    // Both contexts were created, and both were released on the way out.
    assert_eq!(mock.stats().contexts_created, 2);
    assert_balanced(&mock);
}

#[test]
fn test_missing_entry_point() {
    let file = module_file();
    let mock = MockDriver::new(1).with_vector_add();
    let driver = Driver::new(mock.clone()).unwrap();
    let config = RunConfig { kernel_name: "vector_sub".into(), ..run_config(&file) };

    let err = LifecycleCoordinator::new(&driver, config).run().unwrap_err();
    assert_eq!(err.status(), Some(Status::NOT_FOUND));
    assert_eq!(err.kind(), ErrorKind::Resolution);
    assert_balanced(&mock);
}

#[test]
fn test_allocation_failure_releases_earlier_buffers() {
    let file = module_file();
    // Room for two 4 KiB buffers, not three.
    let mock = MockDriver::new(1).with_vector_add().with_total_mem(10_000);
    let driver = Driver::new(mock.clone()).unwrap();

    let mut coordinator = LifecycleCoordinator::new(&driver, run_config(&file));
    let err = coordinator.run().unwrap_err();

    assert_eq!(err.status(), Some(Status::OUT_OF_MEMORY));
    assert_eq!(err.kind(), ErrorKind::Resource);
    assert_eq!(coordinator.stage(), Stage::Failed);
    assert_eq!(mock.stats().allocations, 2);
    assert_balanced(&mock);
}

#[test]
fn test_device_fault_surfaces_at_synchronize() {
    let file = module_file();
    let mock = MockDriver::new(1).with_kernel_body("vector_add", 4, |_, _, _| Err(Status::ILLEGAL_ADDRESS));
    let driver = Driver::new(mock.clone()).unwrap();

    let mut coordinator = LifecycleCoordinator::new(&driver, run_config(&file));
    let err = coordinator.run().unwrap_err();

    assert_eq!(err.status(), Some(Status::ILLEGAL_ADDRESS));
    assert_eq!(err.kind(), ErrorKind::Launch);
    assert_eq!(coordinator.transitions().iter().rev().nth(1), Some(&Stage::Launched));
    assert_balanced(&mock);
}

#[test]
fn test_failure_diagnostic() {
    let mock = MockDriver::new(1);
    let driver = Driver::new(mock).unwrap();
    let err = driver.device(5).unwrap_err();

    let mut reporter = ErrorReporter::new(Vec::new());
    reporter.report(&err).unwrap();
    let text = String::from_utf8(reporter.into_inner()).unwrap();
    assert!(text.starts_with("Driver Error: invalid device ordinal "));
    assert!(text.contains("lifecycle_tests.rs"));
    assert_eq!(text.trim_end(), diagnostic(&err));
}

#[test]
fn test_invalid_config_touches_nothing() {
    let mock = MockDriver::new(1);
    let driver = Driver::new(mock.clone()).unwrap();
    let config = RunConfig { block_size: 0, ..Default::default() };
    let err = LifecycleCoordinator::new(&driver, config).run().unwrap_err();
    assert!(matches!(err, DriverError::InvalidConfig(_)));
    assert_eq!(mock.calls(), vec![Op::Init]);
}

// ============================================================================
// Resource primitives
// ============================================================================

#[test]
fn test_upload_download_roundtrip() {
    let mock = MockDriver::new(1);
    let driver = Driver::new(mock.clone()).unwrap();
    let dev = driver.device(0).unwrap();
    let ctx = Context::create(&driver, &dev, ContextFlags::default()).unwrap();

    let data: Vec<u32> = (0..4096).map(|i| i * 7 + 3).collect();
    let buf = ctx.upload(&data).unwrap();
    let mut fresh = vec![0u32; data.len()];
    ctx.copy_device_to_host(&mut fresh, &buf).unwrap();
    assert_eq!(fresh, data);

    buf.free().unwrap();
    ctx.destroy().unwrap();
    assert_balanced(&mock);
}

#[test]
fn test_two_contexts_then_none() {
    let mock = MockDriver::new(1);
    let driver = Driver::new(mock.clone()).unwrap();
    let dev = driver.device(0).unwrap();

    let mut contexts = ContextManager::new(&driver);
    let first = contexts.create(&dev, ContextFlags::default()).unwrap();
    let second = contexts.create(&dev, ContextFlags::default()).unwrap();
    assert_eq!(mock.stats().active_contexts, 2);

    contexts.destroy(first).unwrap();
    contexts.destroy(second).unwrap();
    assert_eq!(mock.stats().active_contexts, 0);
    assert_eq!(contexts.active(), 0);
}

#[test]
fn test_work_on_inactive_context_is_explicit() {
    let file = module_file();
    let mock = MockDriver::new(1).with_vector_add();
    let driver = Driver::new(mock.clone()).unwrap();
    let dev = driver.device(0).unwrap();

    // `a` is created first; creating `b` would make it current in a raw
    // driver, but every call on `a` rebinds `a`.
    let a = Context::create(&driver, &dev, ContextFlags::default()).unwrap();
    let b = Context::create(&driver, &dev, ContextFlags::default()).unwrap();

    let module = a.load_module(file.path()).unwrap();
    let kernel = unsafe { module.typed_function::<VectorAddSignature>("vector_add") }.unwrap();
    let mut x = a.upload(&[1.0f32; 64]).unwrap();
    a.copy_host_to_device(&mut x, &[4.0f32; 64]).unwrap();
    let out = a.alloc_for::<f32>(64).unwrap();

    let cfg = LaunchConfig::linear(64, 32).unwrap();
    a.launch_typed(&kernel, &cfg, (&out, &x, &x, 64)).unwrap();
    assert!(a.has_work_in_flight());
    assert!(!b.has_work_in_flight());
    a.synchronize().unwrap();
    let result: Vec<f32> = a.download(&out, 64).unwrap();
    assert!(result.iter().all(|v| *v == 8.0));
    assert_eq!(mock.launches()[0].context, a.handle());

    // A kernel from `a` cannot be launched in `b`.
    let err = b.launch_typed(&kernel, &cfg, (&out, &x, &x, 64)).unwrap_err();
    assert_eq!(err.status(), Some(Status::INVALID_CONTEXT));
}

#[test]
fn test_buffer_from_other_context_rejected() {
    let file = module_file();
    let mock = MockDriver::new(1).with_vector_add();
    let driver = Driver::new(mock.clone()).unwrap();
    let dev = driver.device(0).unwrap();
    let a = Context::create(&driver, &dev, ContextFlags::default()).unwrap();
    let b = Context::create(&driver, &dev, ContextFlags::default()).unwrap();

    let module = a.load_module(file.path()).unwrap();
    let kernel = unsafe { module.typed_function::<VectorAddSignature>("vector_add") }.unwrap();
    let out = a.alloc_for::<f32>(64).unwrap();
    let foreign = b.upload(&[1.0f32; 64]).unwrap();

    let cfg = LaunchConfig::linear(64, 32).unwrap();
    let err = a.launch_typed(&kernel, &cfg, (&out, &foreign, &foreign, 64)).unwrap_err();
    assert_eq!(err.status(), Some(Status::INVALID_CONTEXT));
    assert_eq!(mock.stats().launches, 0);
    assert!(!a.has_work_in_flight());
}

#[test]
fn test_raw_launch_argument_count_checked() {
    let file = module_file();
    let mock = MockDriver::new(1).with_vector_add();
    let driver = Driver::new(mock.clone()).unwrap();
    let dev = driver.device(0).unwrap();
    let ctx = Context::create(&driver, &dev, ContextFlags::default()).unwrap();
    let module = ctx.load_module(file.path()).unwrap();
    let kernel = module.function("vector_add").unwrap();

    let args = KernelArgs::new().with(DevicePtr::NULL).with(16i32);
    let cfg = LaunchConfig::linear(16, 16).unwrap();
    let err = unsafe { ctx.launch(&kernel, &cfg, &args) }.unwrap_err();
    assert!(matches!(err, DriverError::ArgumentCount { expected: 4, actual: 2, .. }));
    assert_eq!(mock.stats().launches, 0);
}

#[test]
fn test_drop_with_work_in_flight_synchronizes() {
    let file = module_file();
    let mock = MockDriver::new(1).with_vector_add();
    let driver = Driver::new(mock.clone()).unwrap();
    let dev = driver.device(0).unwrap();
    {
        let ctx = Context::create(&driver, &dev, ContextFlags::default()).unwrap();
        let module = ctx.load_module(file.path()).unwrap();
        let kernel = unsafe { module.typed_function::<VectorAddSignature>("vector_add") }.unwrap();
        let a = ctx.upload(&[1.0f32; 32]).unwrap();
        let cfg = LaunchConfig::linear(32, 32).unwrap();
        ctx.launch_typed(&kernel, &cfg, (&a, &a, &a, 32)).unwrap();
        // Everything dropped here without an explicit synchronize.
    }
    let stats = mock.stats();
    assert_eq!(stats.synchronizations, 1);
    assert_eq!(stats.destroyed_with_pending_work, 0);
    assert_balanced(&mock);
}
