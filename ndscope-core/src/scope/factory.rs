//! Array creation surface of [`ResourceScope`].
//!
//! Every creator ends in a single engine call and attaches the result to
//! the scope it was called on.  `device: None` means "this scope's device".

use std::sync::Arc;
use tracing::{debug, warn};

use super::ResourceScope;
use crate::array::{Element, NdArray};
use crate::error::{DispatchError, Result, ScopeError};
use crate::handle::Handle;
use crate::params::OpParams;
use crate::scope::Resource;
use crate::types::{ArrayDesc, DataType, Device, Shape};

impl ResourceScope {
    /// Allocate an uninitialized array.
    pub fn create(
        self: &Arc<Self>,
        device: Option<Device>,
        shape: &Shape,
        dtype: DataType,
    ) -> Result<Arc<NdArray>> {
        self.ensure_open()?;
        byte_len(shape, dtype)?;
        let device = device.unwrap_or(self.device);
        let handle = self.dispatch(|engine| engine.create(device, shape, dtype))?;
        let desc = ArrayDesc::new(device, shape.clone(), dtype);
        self.track(self.wrap_fresh(handle, Some(desc))?)
    }

    /// Allocate from a descriptor.  The descriptor must carry a shape.
    pub fn create_from_desc(self: &Arc<Self>, desc: &ArrayDesc) -> Result<Arc<NdArray>> {
        let shape = require_shape(desc.shape.as_ref(), "create")?;
        self.create(Some(desc.device), shape, desc.dtype)
    }

    /// Allocate an array matching `T` and fill it with `data`.
    pub fn create_from_data<T: Element>(
        self: &Arc<Self>,
        data: &[T],
        device: Option<Device>,
        shape: &Shape,
    ) -> Result<Arc<NdArray>> {
        byte_len(shape, T::DTYPE)?;
        let expected = shape.size();
        if data.len() != expected {
            return Err(ScopeError::invalid(format!(
                "shape {shape} needs {expected} elements, got {}",
                data.len()
            )));
        }
        let array = self.create(device, shape, T::DTYPE)?;
        populate(array, |a| a.set(data))
    }

    /// Allocate from a descriptor and fill it with raw little-endian bytes.
    pub fn create_from_bytes(
        self: &Arc<Self>,
        desc: &ArrayDesc,
        bytes: &[u8],
    ) -> Result<Arc<NdArray>> {
        let shape = require_shape(desc.shape.as_ref(), "create")?;
        let expected = byte_len(shape, desc.dtype)?;
        if bytes.len() != expected {
            return Err(ScopeError::invalid(format!(
                "{} {shape} needs {expected} bytes, got {}",
                desc.dtype,
                bytes.len()
            )));
        }
        let array = self.create_from_desc(desc)?;
        populate(array, |a| a.set_bytes(bytes))
    }

    /// Take ownership of a handle allocated outside this scope.
    ///
    /// Fails with `InvalidArgument` if an unreleased array already wraps
    /// `handle` on this scope's engine.
    pub fn adopt(self: &Arc<Self>, handle: Handle) -> Result<Arc<NdArray>> {
        self.ensure_open()?;
        self.track(NdArray::new(self, handle, None)?)
    }

    pub fn zeros(
        self: &Arc<Self>,
        device: Option<Device>,
        shape: &Shape,
        dtype: DataType,
    ) -> Result<Arc<NdArray>> {
        self.fill("_zeros", device, Some(shape), dtype)
    }

    pub fn zeros_from_desc(self: &Arc<Self>, desc: &ArrayDesc) -> Result<Arc<NdArray>> {
        self.fill("_zeros", Some(desc.device), desc.shape.as_ref(), desc.dtype)
    }

    pub fn ones(
        self: &Arc<Self>,
        device: Option<Device>,
        shape: &Shape,
        dtype: DataType,
    ) -> Result<Arc<NdArray>> {
        self.fill("_ones", device, Some(shape), dtype)
    }

    pub fn ones_from_desc(self: &Arc<Self>, desc: &ArrayDesc) -> Result<Arc<NdArray>> {
        self.fill("_ones", Some(desc.device), desc.shape.as_ref(), desc.dtype)
    }

    /// Values `start, start + step, ...` up to but excluding `stop`.
    pub fn arange(
        self: &Arc<Self>,
        start: i64,
        stop: i64,
        step: i64,
        device: Option<Device>,
        dtype: DataType,
    ) -> Result<Arc<NdArray>> {
        if step == 0 {
            return Err(ScopeError::invalid("step must be non-zero"));
        }
        let mut params = OpParams::new();
        params
            .add_param("start", start)
            .add_param("stop", stop)
            .add_param("step", step)
            .set_data_type(dtype)
            .set_device(device.unwrap_or(self.device));
        self.invoke_single("_npi_arange", &[], &params)
    }

    /// `num` evenly spaced float32 values over `[start, stop]` (or
    /// `[start, stop)` without `endpoint`).
    pub fn linspace(
        self: &Arc<Self>,
        start: f64,
        stop: f64,
        num: i64,
        endpoint: bool,
        device: Option<Device>,
    ) -> Result<Arc<NdArray>> {
        if num < 0 {
            return Err(ScopeError::invalid("num must be non-negative"));
        }
        let mut params = OpParams::new();
        params
            .add_param("start", start)
            .add_param("stop", stop)
            .add_param("num", num)
            .add_param("endpoint", endpoint)
            .set_data_type(DataType::Float32)
            .set_device(device.unwrap_or(self.device));
        self.invoke_single("_npi_linspace", &[], &params)
    }

    /// Samples from `U[low, high)`.
    pub fn random_uniform(
        self: &Arc<Self>,
        low: f64,
        high: f64,
        shape: &Shape,
        device: Option<Device>,
        dtype: DataType,
    ) -> Result<Arc<NdArray>> {
        byte_len(shape, dtype)?;
        let mut params = OpParams::new();
        params
            .add_param("low", low)
            .add_param("high", high)
            .set_shape(shape)
            .set_device(device.unwrap_or(self.device))
            .set_data_type(dtype);
        self.invoke_single("_npi_random_uniform", &[], &params)
    }

    /// Samples from `N(loc, scale²)`.
    pub fn random_normal(
        self: &Arc<Self>,
        loc: f64,
        scale: f64,
        shape: &Shape,
        device: Option<Device>,
        dtype: DataType,
    ) -> Result<Arc<NdArray>> {
        byte_len(shape, dtype)?;
        let mut params = OpParams::new();
        params
            .add_param("loc", loc)
            .add_param("scale", scale)
            .set_shape(shape)
            .set_device(device.unwrap_or(self.device))
            .set_data_type(dtype);
        self.invoke_single("_npi_random_normal", &[], &params)
    }

    pub fn random_standard_normal(
        self: &Arc<Self>,
        shape: &Shape,
        device: Option<Device>,
        dtype: DataType,
    ) -> Result<Arc<NdArray>> {
        self.random_normal(0.0, 1.0, shape, device, dtype)
    }

    /// Draw `n` experiments from the categorical distribution `pvalues`,
    /// returning per-category counts.  With `size`, the draw is repeated
    /// and the result has shape `size + [k]`.
    pub fn random_multinomial(
        self: &Arc<Self>,
        n: i64,
        pvalues: &NdArray,
        size: Option<&Shape>,
    ) -> Result<Arc<NdArray>> {
        if n < 0 {
            return Err(ScopeError::invalid("n must be non-negative"));
        }
        let mut params = OpParams::new();
        params.add_param("n", n);
        if let Some(size) = size {
            params.set_shape_named("size", size);
        }
        self.invoke_single("_npi_multinomial", &[pvalues], &params)
    }

    /// Run `operation` on the engine.  Outputs are owned by this scope.
    pub fn invoke(
        self: &Arc<Self>,
        operation: &str,
        inputs: &[&NdArray],
        params: &OpParams,
    ) -> Result<Vec<Arc<NdArray>>> {
        self.ensure_open()?;
        let handles = live_handles(inputs)?;
        let outputs = self.dispatch(|engine| engine.invoke(operation, &handles, params))?;
        let mut arrays = Vec::with_capacity(outputs.len());
        for (i, &handle) in outputs.iter().enumerate() {
            match self.wrap_fresh(handle, None) {
                Ok(array) => arrays.push(array),
                Err(err) => {
                    discard(&arrays, operation);
                    // `handle` belongs to whoever already wraps it.
                    for &rest in &outputs[i + 1..] {
                        if let Err(free_err) = self.dispatcher.free(rest) {
                            warn!(operation, handle = ?rest, %free_err, "Failed to free output");
                        }
                    }
                    return Err(err);
                }
            }
        }
        for array in &arrays {
            if let Err(err) = self.attach(array.clone()) {
                discard(&arrays, operation);
                return Err(err);
            }
        }
        debug!(scope = %self.id, operation, outputs = arrays.len(), "Invoked operator");
        Ok(arrays)
    }

    /// Run `operation`, writing into existing arrays.
    pub fn invoke_into(
        &self,
        operation: &str,
        inputs: &[&NdArray],
        outputs: &[&NdArray],
        params: &OpParams,
    ) -> Result<()> {
        self.ensure_open()?;
        let inputs = live_handles(inputs)?;
        let outputs = live_handles(outputs)?;
        self.dispatch(|engine| engine.invoke_into(operation, &inputs, &outputs, params))
    }

    fn invoke_single(
        self: &Arc<Self>,
        operation: &str,
        inputs: &[&NdArray],
        params: &OpParams,
    ) -> Result<Arc<NdArray>> {
        self.invoke(operation, inputs, params)?
            .into_iter()
            .next()
            .ok_or_else(|| DispatchError::new(operation, "operator returned no outputs").into())
    }

    fn fill(
        self: &Arc<Self>,
        operation: &str,
        device: Option<Device>,
        shape: Option<&Shape>,
        dtype: DataType,
    ) -> Result<Arc<NdArray>> {
        let shape = require_shape(shape, operation.trim_start_matches('_'))?;
        byte_len(shape, dtype)?;
        let mut params = OpParams::new();
        params
            .set_shape(shape)
            .set_device(device.unwrap_or(self.device))
            .set_data_type(dtype);
        self.invoke_single(operation, &[], &params)
    }

    /// Wrap a handle the engine just produced.  If it is somehow already
    /// wrapped, the existing owner keeps it and nothing is freed.
    fn wrap_fresh(
        self: &Arc<Self>,
        handle: Handle,
        desc: Option<ArrayDesc>,
    ) -> Result<Arc<NdArray>> {
        NdArray::new(self, handle, desc).map_err(|err| {
            warn!(scope = %self.id, ?handle, %err, "Engine returned an owned handle");
            err
        })
    }

    /// Attach a fresh array, handing its handle back if the scope closed
    /// in the meantime.
    fn track(&self, array: Arc<NdArray>) -> Result<Arc<NdArray>> {
        if let Err(err) = self.attach(array.clone()) {
            discard(std::slice::from_ref(&array), "attach");
            return Err(err);
        }
        Ok(array)
    }
}

/// Release arrays on an error path, logging what could not be freed.
fn discard(arrays: &[Arc<NdArray>], operation: &str) {
    for array in arrays {
        if let Err(err) = array.release() {
            warn!(array = %array.id(), operation, %err, "Failed to release during cleanup");
        }
    }
}

/// Byte length of `shape` in `dtype`, rejecting shapes whose size overflows.
fn byte_len(shape: &Shape, dtype: DataType) -> Result<usize> {
    shape
        .checked_byte_len(dtype)
        .ok_or_else(|| ScopeError::invalid(format!("shape {shape} is too large for {dtype}")))
}

fn require_shape<'a>(shape: Option<&'a Shape>, what: &str) -> Result<&'a Shape> {
    shape.ok_or_else(|| ScopeError::invalid(format!("Shape is required for {what}")))
}

fn live_handles(arrays: &[&NdArray]) -> Result<Vec<Handle>> {
    arrays
        .iter()
        .map(|a| a.ensure_live().map(|()| a.handle()))
        .collect()
}

/// Run a populate step, closing the array if it fails.
fn populate(
    array: Arc<NdArray>,
    fill: impl FnOnce(&NdArray) -> Result<()>,
) -> Result<Arc<NdArray>> {
    if let Err(err) = fill(&*array) {
        discard(std::slice::from_ref(&array), "populate");
        return Err(err);
    }
    Ok(array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::HostEngine;
    use crate::scope::SubScopeOptions;

    fn scope_with(engine: Arc<HostEngine>) -> Arc<ResourceScope> {
        ResourceScope::root()
            .new_sub_scope_with(SubScopeOptions::new().dispatcher(engine))
            .unwrap()
    }

    #[test]
    fn test_create_uses_scope_device_by_default() {
        let scope = ResourceScope::root()
            .new_sub_scope_with(
                SubScopeOptions::new()
                    .dispatcher(Arc::new(HostEngine::new()))
                    .device(Device::gpu(3)),
            )
            .unwrap();
        let array = scope.create(None, &Shape::from([2, 2]), DataType::Float32).unwrap();
        assert_eq!(array.device().unwrap(), Device::gpu(3));
        let explicit = scope
            .create(Some(Device::cpu()), &Shape::from([1]), DataType::Int8)
            .unwrap();
        assert_eq!(explicit.device().unwrap(), Device::cpu());
        assert_eq!(scope.live_count(), 2);
    }

    #[test]
    fn test_create_from_data_each_element_kind() {
        let scope = scope_with(Arc::new(HostEngine::new()));
        let shape = Shape::from([3]);
        let f = scope.create_from_data(&[1.0f32, 2.0, 3.0], None, &shape).unwrap();
        assert_eq!(f.dtype().unwrap(), DataType::Float32);
        assert_eq!(f.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);

        let i = scope.create_from_data(&[7i32, 8, 9], None, &shape).unwrap();
        assert_eq!(i.to_vec::<i32>().unwrap(), vec![7, 8, 9]);

        let d = scope.create_from_data(&[0.5f64, 1.5, 2.5], None, &shape).unwrap();
        assert_eq!(d.dtype().unwrap(), DataType::Float64);

        let l = scope.create_from_data(&[1i64 << 40, 0, -1], None, &shape).unwrap();
        assert_eq!(l.to_vec::<i64>().unwrap(), vec![1i64 << 40, 0, -1]);

        let b = scope.create_from_data(&[-1i8, 0, 1], None, &shape).unwrap();
        assert_eq!(b.dtype().unwrap(), DataType::Int8);
        assert_eq!(b.to_vec::<i8>().unwrap(), vec![-1, 0, 1]);
    }

    #[test]
    fn test_create_from_data_length_mismatch() {
        let engine = Arc::new(HostEngine::new());
        let scope = scope_with(engine.clone());
        let err = scope
            .create_from_data(&[1.0f32, 2.0], None, &Shape::from([3]))
            .unwrap_err();
        assert!(err.is_invalid_argument());
        assert_eq!(engine.live_count(), 0);
        assert_eq!(scope.live_count(), 0);
    }

    #[test]
    fn test_create_from_bytes() {
        let scope = scope_with(Arc::new(HostEngine::new()));
        let desc = ArrayDesc::new(Device::cpu(), Shape::from([2]), DataType::Int32);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&5i32.to_le_bytes());
        bytes.extend_from_slice(&(-6i32).to_le_bytes());
        let array = scope.create_from_bytes(&desc, &bytes).unwrap();
        assert_eq!(array.to_vec::<i32>().unwrap(), vec![5, -6]);

        let short = scope.create_from_bytes(&desc, &bytes[..4]).unwrap_err();
        assert!(short.is_invalid_argument());
    }

    #[test]
    fn test_fill_requires_shape() {
        let engine = Arc::new(HostEngine::new());
        let scope = scope_with(engine.clone());
        let desc = ArrayDesc {
            name: Some("data".into()),
            device: Device::cpu(),
            shape: None,
            dtype: DataType::Float32,
        };
        let err = scope.zeros_from_desc(&desc).unwrap_err();
        assert_eq!(err, ScopeError::InvalidArgument("Shape is required for zeros".into()));
        assert!(scope.ones_from_desc(&desc).unwrap_err().is_invalid_argument());
        assert!(scope.create_from_desc(&desc).unwrap_err().is_invalid_argument());
        assert_eq!(engine.live_count(), 0);
    }

    #[test]
    fn test_zeros_and_ones() {
        let scope = scope_with(Arc::new(HostEngine::new()));
        let zeros = scope.zeros(None, &Shape::from([2, 2]), DataType::Float64).unwrap();
        assert_eq!(zeros.to_vec::<f64>().unwrap(), vec![0.0; 4]);
        assert_eq!(zeros.shape().unwrap(), Shape::from([2, 2]));

        let desc = ArrayDesc::new(Device::cpu(), Shape::from([3]), DataType::Int64);
        let ones = scope.ones_from_desc(&desc).unwrap();
        assert_eq!(ones.to_vec::<i64>().unwrap(), vec![1, 1, 1]);
    }

    #[test]
    fn test_ranged_creators() {
        let scope = scope_with(Arc::new(HostEngine::new()));
        let range = scope.arange(1, 7, 2, None, DataType::Int32).unwrap();
        assert_eq!(range.to_vec::<i32>().unwrap(), vec![1, 3, 5]);
        assert!(scope.arange(0, 5, 0, None, DataType::Int32).unwrap_err().is_invalid_argument());

        let lin = scope.linspace(0.0, 1.0, 3, true, None).unwrap();
        assert_eq!(lin.to_vec::<f32>().unwrap(), vec![0.0, 0.5, 1.0]);
        let empty = scope.linspace(0.0, 1.0, 0, true, None).unwrap();
        assert_eq!(empty.shape().unwrap().size(), 0);
        assert!(scope.linspace(0.0, 1.0, -1, true, None).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_random_creators() {
        let scope = scope_with(Arc::new(HostEngine::with_seed(11)));
        let shape = Shape::from([16]);
        let u = scope.random_uniform(2.0, 3.0, &shape, None, DataType::Float32).unwrap();
        assert!(u.to_vec::<f32>().unwrap().iter().all(|v| (2.0..=3.0).contains(v)));

        let n = scope.random_standard_normal(&shape, None, DataType::Float64).unwrap();
        assert_eq!(n.shape().unwrap(), shape);

        let p = scope.create_from_data(&[0.5f32, 0.5], None, &Shape::from([2])).unwrap();
        let counts = scope.random_multinomial(6, &p, None).unwrap();
        assert_eq!(counts.to_vec::<i64>().unwrap().iter().sum::<i64>(), 6);
        let sized = scope.random_multinomial(2, &p, Some(&Shape::from([5]))).unwrap();
        assert_eq!(sized.shape().unwrap(), Shape::from([5, 2]));
        assert!(scope.random_multinomial(-1, &p, None).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn test_invoke_outputs_are_tracked() {
        let engine = Arc::new(HostEngine::new());
        let scope = scope_with(engine.clone());
        let src = scope.create_from_data(&[1i32, 2], None, &Shape::from([2])).unwrap();
        let outputs = scope.invoke("_copy", &[&*src], &OpParams::new()).unwrap();
        assert_eq!(outputs.len(), 1);
        assert!(scope.contains(outputs[0].id()));
        assert_eq!(outputs[0].to_vec::<i32>().unwrap(), vec![1, 2]);
        assert_eq!(outputs[0].owner().map(|s| s.id()), Some(scope.id()));

        scope.close();
        assert_eq!(engine.live_count(), 0);
    }

    #[test]
    fn test_invoke_into_and_released_inputs() {
        let scope = scope_with(Arc::new(HostEngine::new()));
        let src = scope.create_from_data(&[4i64, 5], None, &Shape::from([2])).unwrap();
        let dst = scope.zeros(None, &Shape::from([2]), DataType::Int64).unwrap();
        scope.invoke_into("_copyto", &[&*src], &[&*dst], &OpParams::new()).unwrap();
        assert_eq!(dst.to_vec::<i64>().unwrap(), vec![4, 5]);

        src.close().unwrap();
        let err = scope.invoke("_copy", &[&*src], &OpParams::new()).unwrap_err();
        assert!(err.is_illegal_state());
    }

    #[test]
    fn test_engine_errors_surface_as_dispatch() {
        let scope = scope_with(Arc::new(HostEngine::new()));
        let err = scope.invoke("argmax", &[], &OpParams::new()).unwrap_err();
        assert!(matches!(err, ScopeError::Dispatch(_)));
        assert_eq!(scope.live_count(), 0);
    }

    #[test]
    fn test_create_on_closed_scope() {
        let engine = Arc::new(HostEngine::new());
        let scope = scope_with(engine.clone());
        scope.close();
        let err = scope.create(None, &Shape::from([1]), DataType::Float32).unwrap_err();
        assert!(err.is_illegal_state());
        let err = scope.zeros(None, &Shape::from([1]), DataType::Float32).unwrap_err();
        assert!(err.is_illegal_state());
        assert_eq!(engine.stats().total_allocations, 0);
    }

    #[test]
    fn test_adopt_foreign_handle() {
        let engine = Arc::new(HostEngine::new());
        let scope = scope_with(engine.clone());
        let handle = crate::dispatch::Dispatcher::create(
            engine.as_ref(),
            Device::cpu(),
            &Shape::from([2, 3]),
            DataType::Uint8,
        )
        .unwrap();
        let array = scope.adopt(handle).unwrap();
        assert_eq!(array.shape().unwrap(), Shape::from([2, 3]));
        assert_eq!(array.dtype().unwrap(), DataType::Uint8);
        scope.close();
        assert!(!engine.is_live(handle));
    }

    #[test]
    fn test_array_close_detaches_from_owner() {
        let engine = Arc::new(HostEngine::new());
        let scope = scope_with(engine.clone());
        let array = scope.create(None, &Shape::from([4]), DataType::Float32).unwrap();
        array.close().unwrap();
        array.close().unwrap();
        assert!(!scope.contains(array.id()));
        assert!(array.is_released());
        assert!(array.to_vec::<f32>().unwrap_err().is_illegal_state());
        assert_eq!(engine.stats().total_frees, 1);
    }

    #[test]
    fn test_adopt_rejects_owned_handle() {
        let engine = Arc::new(HostEngine::new());
        let scope = scope_with(engine.clone());
        let handle = crate::dispatch::Dispatcher::create(
            engine.as_ref(),
            Device::cpu(),
            &Shape::from([4]),
            DataType::Float32,
        )
        .unwrap();
        let first = scope.adopt(handle).unwrap();
        assert!(scope.adopt(handle).unwrap_err().is_invalid_argument());

        // A scope-created handle is owned too.
        let made = scope.zeros(None, &Shape::from([1]), DataType::Int8).unwrap();
        assert!(scope.adopt(made.handle()).unwrap_err().is_invalid_argument());
        assert_eq!(scope.live_count(), 2);

        let report = scope.close_with_report().unwrap();
        assert!(report.is_clean());
        assert_eq!(report.released, 2);
        assert!(first.is_released());
        assert_eq!(engine.stats().total_frees, 2);
    }

    #[test]
    fn test_handle_stays_owned_until_release() {
        let engine = Arc::new(HostEngine::new());
        let scope = scope_with(engine.clone());
        let array = scope.zeros(None, &Shape::from([2]), DataType::Float32).unwrap();
        let handle = array.handle();
        let taken = scope.detach(array.id()).unwrap().expect("tracked");
        drop(taken);
        // Still wrapped by `array` until it is released.
        assert!(scope.adopt(handle).unwrap_err().is_invalid_argument());
        array.release().unwrap();
        assert!(!engine.is_live(handle));
        assert!(!crate::array::is_wrapped(scope.dispatcher(), handle));
    }

    #[test]
    fn test_release_leaves_live_set() {
        let engine = Arc::new(HostEngine::new());
        let scope = scope_with(engine.clone());
        let array = scope.ones(None, &Shape::from([3]), DataType::Int32).unwrap();
        assert!(scope.contains(array.id()));
        array.release().unwrap();
        assert!(!scope.contains(array.id()));
        assert_eq!(scope.live_count(), 0);

        let report = scope.close_with_report().unwrap();
        assert_eq!(report.released, 0);
        assert_eq!(engine.stats().total_frees, 1);
    }

    #[test]
    fn test_cleanup_continues_past_failed_release() {
        let engine = Arc::new(HostEngine::new());
        let scope = scope_with(engine.clone());
        let stuck = scope.zeros(None, &Shape::from([2]), DataType::Float32).unwrap();
        let fine = scope.zeros(None, &Shape::from([2]), DataType::Float32).unwrap();
        engine.fail_free_for(stuck.handle());

        discard(&[stuck.clone(), fine.clone()], "test");
        assert!(stuck.is_released());
        assert!(fine.is_released());
        assert!(engine.is_live(stuck.handle()));
        assert!(!engine.is_live(fine.handle()));
        assert_eq!(scope.live_count(), 0);
    }

    #[test]
    fn test_oversized_shapes_rejected_before_allocation() {
        let engine = Arc::new(HostEngine::new());
        let scope = scope_with(engine.clone());
        let overflow = Shape::from([usize::MAX, 2]);
        let too_many_bytes = Shape::from([usize::MAX / 2]);

        let err = scope.create_from_data(&[1.0f32], None, &overflow).unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(err.to_string().contains("too large"));

        let desc = ArrayDesc::new(Device::cpu(), too_many_bytes.clone(), DataType::Int64);
        assert!(scope.create_from_bytes(&desc, &[0u8; 8]).unwrap_err().is_invalid_argument());
        assert!(scope
            .create(None, &too_many_bytes, DataType::Float32)
            .unwrap_err()
            .is_invalid_argument());
        assert!(scope
            .zeros(None, &overflow, DataType::Float32)
            .unwrap_err()
            .is_invalid_argument());
        assert!(scope
            .ones(None, &too_many_bytes, DataType::Float64)
            .unwrap_err()
            .is_invalid_argument());
        assert!(scope
            .random_uniform(0.0, 1.0, &too_many_bytes, None, DataType::Float32)
            .unwrap_err()
            .is_invalid_argument());
        assert!(scope
            .random_normal(0.0, 1.0, &overflow, None, DataType::Float64)
            .unwrap_err()
            .is_invalid_argument());

        assert_eq!(engine.stats().total_allocations, 0);
        assert_eq!(scope.live_count(), 0);
    }
}
