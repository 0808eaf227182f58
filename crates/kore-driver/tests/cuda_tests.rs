//! GPU integration tests against the system CUDA driver.
//! Run with: cargo test -p kore-driver --features cuda -- --nocapture

#![cfg(feature = "cuda")]

use kore_driver::{
    Context, ContextFlags, Driver, ErrorKind, LaunchConfig, LifecycleCoordinator, RunConfig,
    Stage, Status, VectorAddSignature,
};

fn module_path() -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../kernels/vector_add.ptx")
}

fn assert_close(a: &[f32], expected: f32, tol: f32) {
    for (i, x) in a.iter().enumerate() {
        assert!((x - expected).abs() < tol, "element {} is {} (expected {})", i, x, expected);
    }
}

#[test]
fn test_driver_info() {
    let driver = Driver::cuda().expect("CUDA driver not available");
    assert!(driver.version().unwrap() > 0);
    assert!(driver.device_count().unwrap() >= 1);
    let dev = driver.device(0).unwrap();
    let info = driver.device_info(&dev).unwrap();
    assert!(!info.name.is_empty());
    assert!(info.limits.max_threads_per_block >= 256);
}

#[test]
fn test_reference_run() {
    let driver = Driver::cuda().unwrap();
    let config = RunConfig { module_path: module_path(), ..Default::default() };
    let report = LifecycleCoordinator::new(&driver, config).run().unwrap();
    assert_eq!(report.grid.x, 4);
    assert_eq!(report.total_threads, 1024);
    assert_close(&report.output, 3.0, 1e-6);
    assert_eq!(report.transitions.last(), Some(&Stage::Completed));
}

#[test]
fn test_uneven_size() {
    let driver = Driver::cuda().unwrap();
    let config = RunConfig { module_path: module_path(), problem_size: 1000, ..Default::default() };
    let report = LifecycleCoordinator::new(&driver, config).run().unwrap();
    assert_eq!(report.output.len(), 1000);
    assert_close(&report.output, 3.0, 1e-6);
}

#[test]
fn test_roundtrip() {
    let driver = Driver::cuda().unwrap();
    let dev = driver.device(0).unwrap();
    let ctx = Context::create(&driver, &dev, ContextFlags::default()).unwrap();
    let data: Vec<f32> = (0..10_000).map(|i| i as f32 * 0.25).collect();
    let buf = ctx.upload(&data).unwrap();
    let back: Vec<f32> = ctx.download(&buf, data.len()).unwrap();
    assert_eq!(back, data);
}

#[test]
fn test_typed_launch() {
    let driver = Driver::cuda().unwrap();
    let dev = driver.device(0).unwrap();
    let ctx = Context::create(&driver, &dev, ContextFlags::default()).unwrap();
    let module = ctx.load_module(module_path()).unwrap();
    let kernel = unsafe { module.typed_function::<VectorAddSignature>("vector_add") }.unwrap();

    let a = ctx.upload(&[1.5f32; 300]).unwrap();
    let b = ctx.upload(&[2.5f32; 300]).unwrap();
    let out = ctx.alloc_for::<f32>(300).unwrap();
    let cfg = LaunchConfig::linear(300, 128).unwrap();
    ctx.launch_typed(&kernel, &cfg, (&out, &a, &b, 300)).unwrap();
    ctx.synchronize().unwrap();
    let result: Vec<f32> = ctx.download(&out, 300).unwrap();
    assert_close(&result, 4.0, 1e-6);
}

#[test]
fn test_missing_device() {
    let driver = Driver::cuda().unwrap();
    let count = driver.device_count().unwrap();
    let err = driver.device(count + 5).unwrap_err();
    assert_eq!(err.status(), Some(Status::INVALID_DEVICE));
    assert_eq!(err.kind(), ErrorKind::Resolution);
}

#[test]
fn test_missing_module() {
    let driver = Driver::cuda().unwrap();
    let dev = driver.device(0).unwrap();
    let ctx = Context::create(&driver, &dev, ContextFlags::default()).unwrap();
    let err = ctx.load_module("/no/such/dir/vector_add.ptx").err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Resolution);
}
