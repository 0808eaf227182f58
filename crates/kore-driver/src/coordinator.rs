//! End-to-end run: device → contexts → module → buffers → launch → teardown.
//!
//! [`LifecycleCoordinator`] owns nothing but the sequence. Every resource it
//! acquires is an RAII guard local to [`LifecycleCoordinator::run`], so an
//! early `?` return releases whatever was acquired so far, newest first.
//! On success the same resources are released through the checked
//! `free` / `unload` / `destroy` calls so teardown failures are reported.

use serde::Serialize;

use crate::api::DevicePtr;
use crate::config::RunConfig;
use crate::context::ContextManager;
use crate::device::{DeviceInfo, Driver};
use crate::error::{DriverError, Result};
use crate::launch::{Dim3, LaunchConfig};

/// Parameter list of the sample kernel: `(out, a, b, n)`.
pub type VectorAddSignature = (DevicePtr, DevicePtr, DevicePtr, i32);

/// Progress of a run. Terminal states are `Completed` and `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Stage {
    Uninitialized,
    DeviceResolved,
    ContextActive,
    ModuleLoaded,
    BuffersAllocated,
    DataUploaded,
    Launched,
    Completed,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub device: DeviceInfo,
    pub grid: Dim3,
    pub block: Dim3,
    pub total_threads: u64,
    pub padding_threads: u64,
    pub output: Vec<f32>,
    pub transitions: Vec<Stage>,
}

impl RunReport {
    /// Number of output elements that differ from `expected`.
    pub fn mismatches(&self, expected: f32) -> usize {
        self.output.iter().filter(|v| **v != expected).count()
    }
}

/// Sequences one kernel run against a [`Driver`].
pub struct LifecycleCoordinator<'d> {
    driver: &'d Driver,
    config: RunConfig,
    stage: Stage,
    transitions: Vec<Stage>,
}

impl<'d> LifecycleCoordinator<'d> {
    pub fn new(driver: &'d Driver, config: RunConfig) -> Self {
        Self {
            driver,
            config,
            stage: Stage::Uninitialized,
            transitions: Vec::new(),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Current stage.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Every stage entered so far, in order.
    pub fn transitions(&self) -> &[Stage] {
        &self.transitions
    }

    /// Execute the run. On the first error the coordinator moves to
    /// [`Stage::Failed`] and returns that error; a finished coordinator
    /// cannot be run again.
    pub fn run(&mut self) -> Result<RunReport> {
        if self.stage != Stage::Uninitialized {
            return Err(DriverError::InvalidConfig(format!(
                "coordinator already ran (stage {:?})",
                self.stage
            )));
        }
        match self.execute() {
            Ok(mut report) => {
                self.advance(Stage::Completed);
                report.transitions = self.transitions.clone();
                Ok(report)
            }
            Err(e) => {
                tracing::error!(stage = ?self.stage, "run failed: {}", e);
                self.advance(Stage::Failed);
                Err(e)
            }
        }
    }

    fn advance(&mut self, stage: Stage) {
        tracing::info!(from = ?self.stage, to = ?stage, "stage");
        self.stage = stage;
        self.transitions.push(stage);
    }

    fn execute(&mut self) -> Result<RunReport> {
        let driver = self.driver;
        let config = self.config.clone();
        config.validate()?;

        let device = driver.device(config.device_index)?;
        let info = driver.device_info(&device)?;
        tracing::info!(index = info.index, name = %info.name, "using device");
        self.advance(Stage::DeviceResolved);

        let mut contexts = ContextManager::new(driver);
        for _ in 0..config.context_count {
            contexts.create(&device, config.flags())?;
        }
        let active = contexts
            .ids()
            .nth(config.active_index())
            .ok_or_else(|| DriverError::InvalidConfig("active context out of range".into()))?;
        let report = {
            let ctx = contexts
                .get(active)
                .ok_or_else(|| DriverError::InvalidConfig("active context destroyed".into()))?;
            self.advance(Stage::ContextActive);

            let module = ctx.load_module(&config.module_path)?;
            // Safety: the sample entry point is `vector_add(float*, const float*,
            // const float*, int)`, matching `VectorAddSignature`.
            let kernel = unsafe { module.typed_function::<VectorAddSignature>(&config.kernel_name)? };
            self.advance(Stage::ModuleLoaded);

            let n = config.problem_size;
            let mut a = ctx.alloc_for::<f32>(n)?;
            let mut b = ctx.alloc_for::<f32>(n)?;
            let out = ctx.alloc_for::<f32>(n)?;
            self.advance(Stage::BuffersAllocated);

            ctx.copy_host_to_device(&mut a, &vec![config.fill_a; n])?;
            ctx.copy_host_to_device(&mut b, &vec![config.fill_b; n])?;
            self.advance(Stage::DataUploaded);

            let launch = LaunchConfig::linear(n, config.block_size)?.with_shared_mem(config.shared_mem_bytes);
            launch.validate_against(&info.limits)?;
            // A 1D grid of `ceil(n / b)` blocks launches fewer than `n + b` threads.
            let total_threads = launch
                .total_threads()
                .ok_or_else(|| DriverError::invalid_geometry("thread count overflows u64"))?;
            // `n` fits in i32: checked by `RunConfig::validate`.
            ctx.launch_typed(&kernel, &launch, (&out, &a, &b, n as i32))?;
            self.advance(Stage::Launched);

            ctx.synchronize()?;
            let output: Vec<f32> = ctx.download(&out, n)?;

            out.free()?;
            b.free()?;
            a.free()?;
            drop(kernel);
            module.unload()?;

            RunReport {
                device: info,
                grid: launch.grid,
                block: launch.block,
                total_threads,
                padding_threads: total_threads.saturating_sub(n as u64),
                output,
                transitions: Vec::new(),
            }
        };
        contexts.destroy_all()?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDriver;

    const IMAGE: &str = ".visible .entry vector_add(\n.param .u64 out\n)";

    fn module_file() -> tempfile::NamedTempFile {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(IMAGE.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_stage_order() {
        let file = module_file();
        let mock = MockDriver::new(1).with_vector_add();
        let driver = Driver::new(mock.clone()).unwrap();
        let config = RunConfig { module_path: file.path().to_path_buf(), ..Default::default() };

        let mut coordinator = LifecycleCoordinator::new(&driver, config);
        let report = coordinator.run().unwrap();
        assert_eq!(
            report.transitions,
            vec![
                Stage::DeviceResolved,
                Stage::ContextActive,
                Stage::ModuleLoaded,
                Stage::BuffersAllocated,
                Stage::DataUploaded,
                Stage::Launched,
                Stage::Completed,
            ]
        );
        assert!(coordinator.stage().is_terminal());
        assert_eq!(report.mismatches(3.0), 0);
    }

    #[test]
    fn test_runs_once() {
        let file = module_file();
        let driver = Driver::new(MockDriver::new(1).with_vector_add()).unwrap();
        let config = RunConfig { module_path: file.path().to_path_buf(), ..Default::default() };
        let mut coordinator = LifecycleCoordinator::new(&driver, config);
        coordinator.run().unwrap();
        assert!(coordinator.run().is_err());
    }

    #[test]
    fn test_launch_uses_selected_context() {
        let file = module_file();
        let mock = MockDriver::new(1).with_vector_add();
        let driver = Driver::new(mock.clone()).unwrap();
        let config = RunConfig {
            module_path: file.path().to_path_buf(),
            context_count: 3,
            active_context: Some(0),
            ..Default::default()
        };
        LifecycleCoordinator::new(&driver, config).run().unwrap();

        let launches = mock.launches();
        assert_eq!(launches.len(), 1);
        // Contexts are destroyed newest first, so the first one created is last.
        assert_eq!(mock.destroyed_contexts().last(), Some(&launches[0].context));
    }
}
