use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use wren_core::{Backend, BackendCaps, Error, Result};

// RuntimeConfig: Which backends exist and what they can do
//
// Every backend is host-emulated: a GPU or XPU entry here means kernels are
// registered for that family according to its capability descriptor and run
// through a `DeviceContext` of that device. Leaving a backend out means no
// kernel is registered for it at all, so calls placed there fail with
// `NoKernel`.
//
// Example (YAML):
//
//   parallel: true
//   gpu:
//     backend: gpu
//     supports_bf16: false
//   xpu: ~
//   extra_op_files: [my_ops.yaml]
//   scratch_cache_bytes: 67108864

/// Configuration for an [`crate::OpRuntime`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Run kernel launches on the thread pool.
    pub parallel: bool,
    pub cpu: BackendCaps,
    pub gpu: Option<BackendCaps>,
    pub xpu: Option<BackendCaps>,
    /// Declaration files loaded after the built-in catalogue.
    pub extra_op_files: Vec<PathBuf>,
    /// Upper bound on the scratch bytes each device context keeps cached.
    pub scratch_cache_bytes: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            cpu: BackendCaps::cpu(),
            gpu: Some(BackendCaps::gpu()),
            xpu: Some(BackendCaps::xpu()),
            extra_op_files: Vec::new(),
            scratch_cache_bytes: None,
        }
    }
}

impl RuntimeConfig {
    /// CPU only.
    pub fn cpu_only() -> Self {
        Self {
            gpu: None,
            xpu: None,
            ..Self::default()
        }
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_gpu_caps(mut self, caps: BackendCaps) -> Self {
        self.gpu = Some(caps);
        self
    }

    pub fn with_xpu_caps(mut self, caps: BackendCaps) -> Self {
        self.xpu = Some(caps);
        self
    }

    pub fn without_backend(mut self, backend: Backend) -> Self {
        match backend {
            Backend::Cpu => {}
            Backend::Gpu => self.gpu = None,
            Backend::Xpu => self.xpu = None,
        }
        self
    }

    pub fn with_scratch_cache_bytes(mut self, bytes: usize) -> Self {
        self.scratch_cache_bytes = Some(bytes);
        self
    }

    pub fn with_op_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.extra_op_files.push(path.into());
        self
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: RuntimeConfig = serde_yaml::from_str(yaml)
            .map_err(|e| Error::invalid(format!("invalid runtime config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        Self::from_yaml_str(&std::fs::read_to_string(path)?)
    }

    /// Capability descriptors of every enabled backend, CPU first.
    pub fn backends(&self) -> Vec<&BackendCaps> {
        std::iter::once(&self.cpu)
            .chain(self.gpu.as_ref())
            .chain(self.xpu.as_ref())
            .collect()
    }

    pub fn caps(&self, backend: Backend) -> Option<&BackendCaps> {
        match backend {
            Backend::Cpu => Some(&self.cpu),
            Backend::Gpu => self.gpu.as_ref(),
            Backend::Xpu => self.xpu.as_ref(),
        }
    }

    /// Every descriptor must sit in its own backend's slot and describe a
    /// warp the kernels can reduce over.
    pub fn validate(&self) -> Result<()> {
        for (slot, caps) in [
            (Backend::Cpu, Some(&self.cpu)),
            (Backend::Gpu, self.gpu.as_ref()),
            (Backend::Xpu, self.xpu.as_ref()),
        ] {
            let Some(caps) = caps else { continue };
            if caps.backend != slot {
                return Err(Error::invalid(format!(
                    "{slot} slot holds capabilities for {}",
                    caps.backend
                )));
            }
            if caps.warp_size != wren_core::warp::WARP_SIZE {
                return Err(Error::invalid(format!(
                    "{slot}: warp size {} is not supported (kernels use {})",
                    caps.warp_size,
                    wren_core::warp::WARP_SIZE
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_enable_every_backend() {
        let c = RuntimeConfig::default();
        assert_eq!(c.backends().len(), 3);
        assert!(c.parallel);
        assert!(!c.caps(Backend::Xpu).unwrap().supports_bf16);
    }

    #[test]
    fn test_builder_methods() {
        let c = RuntimeConfig::default()
            .with_parallel(false)
            .without_backend(Backend::Xpu)
            .with_gpu_caps(BackendCaps::gpu().with_bf16(false))
            .with_op_file("custom.yaml");
        assert!(!c.parallel);
        assert!(c.caps(Backend::Xpu).is_none());
        assert!(!c.caps(Backend::Gpu).unwrap().supports_bf16);
        assert_eq!(c.extra_op_files, vec![PathBuf::from("custom.yaml")]);
    }

    #[test]
    fn test_yaml_overrides_and_defaults() {
        let c = RuntimeConfig::from_yaml_str(
            "parallel: false\ngpu:\n  backend: gpu\n  sparse_matmul: false\nxpu: ~\n",
        )
        .unwrap();
        assert!(!c.parallel);
        let gpu = c.caps(Backend::Gpu).unwrap();
        assert!(!gpu.sparse_matmul);
        assert!(gpu.supports_f16);
        assert_eq!(gpu.warp_size, 32);
        assert!(c.xpu.is_none());
        assert_eq!(c.cpu, BackendCaps::cpu());
        assert_eq!(c.scratch_cache_bytes, None);

        let c = RuntimeConfig::from_yaml_str("scratch_cache_bytes: 4096\n").unwrap();
        assert_eq!(c.scratch_cache_bytes, Some(4096));
    }

    #[test]
    fn test_misplaced_caps_rejected() {
        let err = RuntimeConfig::from_yaml_str("gpu:\n  backend: xpu\n").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(RuntimeConfig::from_yaml_str("unknown_key: 1\n").is_err());
    }
}
