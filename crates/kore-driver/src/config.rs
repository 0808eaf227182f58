//! Run configuration for the lifecycle coordinator.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::context::ContextFlags;
use crate::error::{DriverError, Result};

/// Parameters of one end-to-end kernel run.
///
/// Every field has a default, so a JSON file only needs to name what it
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// 0-based logical device index.
    pub device_index: usize,

    /// Number of contexts to create on the device.
    pub context_count: usize,

    /// Context that runs the workload. `None` selects the last created.
    pub active_context: Option<usize>,

    /// Raw `CU_CTX_*` creation flags.
    pub context_flags: u32,

    /// Precompiled module (PTX, cubin, or fatbin).
    pub module_path: PathBuf,

    /// Entry point to resolve in the module.
    pub kernel_name: String,

    /// Number of elements (N).
    pub problem_size: usize,

    /// Threads per block (B).
    pub block_size: u32,

    /// Dynamic shared memory per block, in bytes.
    pub shared_mem_bytes: u32,

    /// Value every element of input `a` is filled with.
    pub fill_a: f32,

    /// Value every element of input `b` is filled with.
    pub fill_b: f32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            context_count: 2,
            active_context: None,
            context_flags: 0,
            module_path: PathBuf::from("kernels/vector_add.ptx"),
            kernel_name: "vector_add".into(),
            problem_size: 1024,
            block_size: 256,
            shared_mem_bytes: 0,
            fill_a: 1.0,
            fill_b: 2.0,
        }
    }
}

impl RunConfig {
    /// Load a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| DriverError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the values that would otherwise fail deep inside the run.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(DriverError::InvalidConfig("block_size must be at least 1".into()));
        }
        if self.problem_size == 0 {
            return Err(DriverError::InvalidConfig("problem_size must be at least 1".into()));
        }
        // The sample kernel takes `n` as a 32-bit signed int.
        if self.problem_size > i32::MAX as usize {
            return Err(DriverError::InvalidConfig(format!(
                "problem_size {} exceeds {}",
                self.problem_size,
                i32::MAX
            )));
        }
        if self.context_count == 0 {
            return Err(DriverError::InvalidConfig("context_count must be at least 1".into()));
        }
        if let Some(active) = self.active_context {
            if active >= self.context_count {
                return Err(DriverError::InvalidConfig(format!(
                    "active_context {active} out of range for {} contexts",
                    self.context_count
                )));
            }
        }
        if self.kernel_name.is_empty() {
            return Err(DriverError::InvalidConfig("kernel_name is empty".into()));
        }
        Ok(())
    }

    pub fn flags(&self) -> ContextFlags {
        ContextFlags(self.context_flags)
    }

    /// Index of the context that runs the workload.
    pub fn active_index(&self) -> usize {
        self.active_context.unwrap_or(self.context_count.saturating_sub(1))
    }

    /// Value every output element should hold after a correct run.
    pub fn expected_value(&self) -> f32 {
        self.fill_a + self.fill_b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = RunConfig::default();
        assert_eq!(cfg.device_index, 0);
        assert_eq!(cfg.context_count, 2);
        assert_eq!(cfg.active_index(), 1);
        assert_eq!(cfg.problem_size, 1024);
        assert_eq!(cfg.block_size, 256);
        assert_eq!(cfg.kernel_name, "vector_add");
        assert_eq!(cfg.expected_value(), 3.0);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_partial_json() {
        let cfg = RunConfig::from_json_str(r#"{"problem_size": 1000, "block_size": 128}"#).unwrap();
        assert_eq!(cfg.problem_size, 1000);
        assert_eq!(cfg.block_size, 128);
        assert_eq!(cfg.context_count, 2);
    }

    #[test]
    fn test_invalid_values() {
        let err = RunConfig::from_json_str(r#"{"block_size": 0}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.exit_code(), 1);

        let cfg = RunConfig { context_count: 2, active_context: Some(2), ..Default::default() };
        assert!(cfg.validate().is_err());

        let cfg = RunConfig { problem_size: 0, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bad_json() {
        let err = RunConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, DriverError::ConfigParse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"device_index": 1, "fill_a": 0.5}}"#).unwrap();
        let cfg = RunConfig::from_json_file(file.path()).unwrap();
        assert_eq!(cfg.device_index, 1);
        assert_eq!(cfg.fill_a, 0.5);

        let err = RunConfig::from_json_file("/no/such/config.json").unwrap_err();
        assert!(matches!(err, DriverError::ConfigIo { .. }));
    }
}
