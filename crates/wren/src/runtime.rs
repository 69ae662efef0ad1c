use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use wren_core::{ArenaStats, Backend, BackendCaps, DType, DataLayout, Device, DeviceContext, Error, Result, Tensor, TensorDesc};
use wren_kernels::{KernelArgs, KernelTable};
use wren_meta::{AttrMap, AttrValue, InferContext, InferMetaRegistry, OpRegistry, OperatorSchema};

use crate::builtin::{register_backend_kernels, BACKWARD_YAML, OPS_YAML};
use crate::config::RuntimeConfig;

// Operator invocation: From a name and some tensors to owned outputs
//
//   1. look up the schema                      UnknownOperator
//   2. bind tensor inputs by name              InvalidArgument
//   3. resolve attributes (defaults, types)    InvalidArgument
//   4. infer output descriptors                InvalidArgument / ShapeMismatch
//   5. resolve the dispatch key
//        backend  device of the `data_type` input
//        dtype    dtype of the `data_type` input
//        layout   `data_format` attribute if declared, else input layout
//   6. select the kernel                       NoKernel / UnsupportedDType
//   7. run it against borrowed inputs and unallocated outputs
//
// Errors propagate unchanged; the outputs of a failed call are dropped.

/// Arguments of one operator call, bound by name.
#[derive(Debug, Default)]
pub struct OpCall<'a> {
    inputs: HashMap<String, &'a Tensor>,
    attrs: AttrMap,
    outputs: Option<Vec<String>>,
}

impl<'a> OpCall<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, name: impl Into<String>, tensor: &'a Tensor) -> Self {
        self.inputs.insert(name.into(), tensor);
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(name, value);
        self
    }

    /// Request only these outputs. Outputs not declared optional are always
    /// produced. Without this call every output is requested.
    pub fn outputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = Some(names.into_iter().map(Into::into).collect());
        self
    }

    fn get(&self, name: &str) -> Option<&'a Tensor> {
        self.inputs.get(name).copied()
    }
}

/// Outputs of one call, in declaration order. An unrequested output is
/// absent; a requested output the kernel had nothing to write is present
/// but unallocated.
#[derive(Debug)]
pub struct OpOutputs {
    names: Vec<String>,
    tensors: Vec<Option<Tensor>>,
}

impl OpOutputs {
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        let i = self.names.iter().position(|n| n == name)?;
        self.tensors[i].as_ref()
    }

    /// Move output `name` out.
    pub fn take(&mut self, name: &str) -> Result<Tensor> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.tensors[i].take())
            .ok_or_else(|| Error::invalid(format!("no output named '{name}'")))
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// The first output, which is the only one for most operators.
    pub fn first(&self) -> Option<&Tensor> {
        self.tensors.first().and_then(Option::as_ref)
    }

    pub fn into_vec(self) -> Vec<Option<Tensor>> {
        self.tensors
    }
}

/// Registries, kernels and device contexts behind every call.
pub struct OpRuntime {
    config: RuntimeConfig,
    ops: OpRegistry,
    infer: InferMetaRegistry,
    kernels: KernelTable,
    contexts: Mutex<HashMap<Device, Arc<DeviceContext>>>,
}

impl OpRuntime {
    /// Load the built-in catalogue plus `config.extra_op_files` and register
    /// kernels for every enabled backend.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let mut ops = OpRegistry::from_yaml_str(OPS_YAML)?;
        ops.load_yaml_str(BACKWARD_YAML)?;
        for path in &config.extra_op_files {
            let n = ops.load_yaml_file(path)?;
            tracing::info!(path = %path.display(), operators = n, "loaded declarations");
        }
        ops.check_backward_links()?;

        let mut kernels = KernelTable::new();
        for caps in config.backends() {
            register_backend_kernels(&mut kernels, caps)?;
        }
        tracing::info!(
            operators = ops.len(),
            kernels = kernels.len(),
            backends = config.backends().len(),
            "runtime ready"
        );
        Ok(OpRuntime {
            config,
            ops,
            infer: InferMetaRegistry::builtin(),
            kernels,
            contexts: Mutex::new(HashMap::new()),
        })
    }

    pub fn cpu() -> Result<Self> {
        Self::new(RuntimeConfig::cpu_only())
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &OpRegistry {
        &self.ops
    }

    pub fn registry_mut(&mut self) -> &mut OpRegistry {
        &mut self.ops
    }

    pub fn kernels(&self) -> &KernelTable {
        &self.kernels
    }

    /// For registering additional kernels.
    pub fn kernels_mut(&mut self) -> &mut KernelTable {
        &mut self.kernels
    }

    pub fn infer_registry_mut(&mut self) -> &mut InferMetaRegistry {
        &mut self.infer
    }

    /// Dtypes `op` can run with on `backend`. Accepts an operator name or a
    /// kernel name.
    pub fn supported_dtypes(&self, op: &str, backend: Backend) -> Vec<DType> {
        let kernel = self
            .ops
            .lookup(op)
            .map(|s| s.kernel.func.clone())
            .unwrap_or_else(|_| op.to_string());
        self.kernels.supported_dtypes(&kernel, backend)
    }

    fn context(&self, device: Device) -> Result<Arc<DeviceContext>> {
        let caps = self
            .config
            .caps(device.backend())
            .cloned()
            .unwrap_or_else(|| BackendCaps::for_backend(device.backend()));
        let mut contexts = self
            .contexts
            .lock()
            .map_err(|_| Error::invalid("device context table is poisoned"))?;
        Ok(contexts
            .entry(device)
            .or_insert_with(|| {
                tracing::debug!(%device, "creating device context");
                Arc::new(
                    DeviceContext::new(device, caps)
                        .with_parallel(self.config.parallel)
                        .with_scratch_limit(self.config.scratch_cache_bytes),
                )
            })
            .clone())
    }

    /// Scratch statistics of `device`, if a call has run there yet.
    pub fn scratch_stats(&self, device: Device) -> Option<ArenaStats> {
        let contexts = self.contexts.lock().ok()?;
        contexts.get(&device).map(|ctx| ctx.arena().stats())
    }

    /// Release the cached scratch buffers of every device context.
    pub fn empty_cache(&self) -> Result<()> {
        let contexts = self
            .contexts
            .lock()
            .map_err(|_| Error::invalid("device context table is poisoned"))?;
        for ctx in contexts.values() {
            ctx.arena().empty_cache();
        }
        Ok(())
    }

    /// Bind inputs, resolve attributes and infer output descriptors.
    fn prepare(&self, op: &str, call: &OpCall<'_>) -> Result<(Arc<OperatorSchema>, AttrMap, Vec<TensorDesc>)> {
        let schema = self.ops.lookup(op)?;
        for name in call.inputs.keys() {
            if !schema.tensor_args().any(|a| &a.name == name) {
                return Err(Error::invalid(format!("'{op}' has no tensor input '{name}'")));
            }
        }
        for arg in schema.tensor_args() {
            if !arg.optional && call.get(&arg.name).is_none() {
                return Err(Error::invalid(format!("missing required input '{}' of '{op}'", arg.name)));
            }
        }
        let attrs = schema.resolve_attrs(&call.attrs)?;
        let descs = {
            let ctx = InferContext::from_schema(&schema, &attrs, |name| call.get(name).map(Tensor::desc))?;
            self.infer.run(&schema, &ctx)?
        };
        Ok((schema, attrs, descs))
    }

    /// Output descriptors of a call without running any kernel.
    pub fn infer_only(&self, op: &str, call: &OpCall<'_>) -> Result<Vec<TensorDesc>> {
        self.prepare(op, call).map(|(_, _, descs)| descs)
    }

    /// Run `op` and return its outputs.
    pub fn invoke(&self, op: &str, call: OpCall<'_>) -> Result<OpOutputs> {
        let (schema, attrs, descs) = self.prepare(op, &call)?;

        let key_input = call.get(&schema.kernel.data_type).ok_or_else(|| {
            Error::invalid(format!(
                "'{op}' keys its kernel on '{}', which was not provided",
                schema.kernel.data_type
            ))
        })?;
        let device = key_input.device();
        if let Some((name, t)) = call.inputs.iter().find(|(_, t)| t.device() != device) {
            return Err(Error::invalid(format!(
                "'{op}': input '{name}' is on {} but '{}' is on {device}",
                t.device(),
                schema.kernel.data_type
            )));
        }
        let layout = dispatch_layout(&attrs, key_input)?;
        let kernel = self
            .kernels
            .dispatch(&schema.kernel.func, device.backend(), key_input.dtype(), layout)?;

        let requested = requested_outputs(&schema, call.outputs.as_deref())?;
        let mut tensors: Vec<Option<Tensor>> = descs
            .into_iter()
            .zip(&requested)
            .map(|(desc, &wanted)| wanted.then(|| Tensor::uninit(desc.with_device(device))))
            .collect();

        let inputs: Vec<Option<&Tensor>> = schema.tensor_args().map(|a| call.get(&a.name)).collect();
        let ctx = self.context(device)?;
        tracing::debug!(op, kernel = %schema.kernel.func, %device, dtype = %key_input.dtype(), %layout, "invoke");
        {
            let mut args = KernelArgs::new(inputs, &attrs, tensors.iter_mut().map(Option::as_mut).collect());
            kernel(&ctx, &mut args)?;
        }
        ctx.synchronize()?;

        Ok(OpOutputs {
            names: schema.outputs.iter().map(|o| o.name.clone()).collect(),
            tensors,
        })
    }
}

/// Layout half of the dispatch key.
fn dispatch_layout(attrs: &AttrMap, key_input: &Tensor) -> Result<DataLayout> {
    match attrs.get("data_format").and_then(AttrValue::as_str) {
        Some("AnyLayout") | Some("ALL_LAYOUT") | None => Ok(key_input.layout()),
        Some(s) => s.parse(),
    }
}

/// Which declared outputs to allocate.
fn requested_outputs(schema: &OperatorSchema, names: Option<&[String]>) -> Result<Vec<bool>> {
    let Some(names) = names else {
        return Ok(vec![true; schema.outputs.len()]);
    };
    if let Some(unknown) = names.iter().find(|n| schema.output_index(n).is_none()) {
        return Err(Error::invalid(format!("'{}' has no output '{unknown}'", schema.name)));
    }
    Ok(schema
        .outputs
        .iter()
        .map(|o| !o.optional || names.contains(&o.name))
        .collect())
}
