//! Host Reference Engine
//!
//! An in-process [`Dispatcher`] that keeps every array in host memory.  It
//! understands the creation operators the scope factory emits, which makes
//! it the default engine when no native library is configured and the
//! engine the test-suite runs against.
//!
//! Handles are synthetic addresses handed out from a counter; they are
//! never dereferenced.

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, info};

use super::Dispatcher;
use crate::error::DispatchError;
use crate::handle::Handle;
use crate::params::OpParams;
use crate::types::{ArrayDesc, DataType, Device, Shape};

const HANDLE_BASE: usize = 0x1000;
const HANDLE_STRIDE: usize = 0x10;

/// One host-resident allocation.
struct HostArray {
    device: Device,
    shape: Shape,
    dtype: DataType,
    data: Vec<u8>,
}

impl HostArray {
    fn zeroed(
        operation: &str,
        device: Device,
        shape: Shape,
        dtype: DataType,
    ) -> Result<Self, DispatchError> {
        let len = shape
            .checked_byte_len(dtype)
            .ok_or_else(|| too_large(operation, &shape))?;
        Ok(Self {
            device,
            shape,
            dtype,
            data: try_buffer(operation, len, 0u8)?,
        })
    }

    fn from_values(device: Device, shape: Shape, dtype: DataType, values: &[f64]) -> Self {
        Self {
            device,
            shape,
            dtype,
            data: encode(dtype, values),
        }
    }
}

/// Counters describing engine activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEngineStats {
    /// Handles currently allocated.
    pub live: usize,
    /// Allocations since the engine was created.
    pub total_allocations: u64,
    /// Successful frees since the engine was created.
    pub total_frees: u64,
}

/// In-process reference engine.
pub struct HostEngine {
    arrays: DashMap<usize, HostArray>,
    next_addr: AtomicUsize,
    rng: Mutex<StdRng>,
    failing_frees: DashSet<usize>,
    total_allocations: AtomicU64,
    total_frees: AtomicU64,
}

impl HostEngine {
    /// Create an engine seeded from OS entropy.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Create an engine whose sampling operators are reproducible.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        info!("Creating HostEngine");
        Self {
            arrays: DashMap::new(),
            next_addr: AtomicUsize::new(HANDLE_BASE),
            rng: Mutex::new(rng),
            failing_frees: DashSet::new(),
            total_allocations: AtomicU64::new(0),
            total_frees: AtomicU64::new(0),
        }
    }

    /// Make every future `free` of `handle` fail.  The allocation stays live.
    pub fn fail_free_for(&self, handle: Handle) {
        self.failing_frees.insert(handle.addr());
    }

    /// Returns `true` while `handle` is allocated.
    pub fn is_live(&self, handle: Handle) -> bool {
        self.arrays.contains_key(&handle.addr())
    }

    pub fn live_count(&self) -> usize {
        self.arrays.len()
    }

    pub fn stats(&self) -> HostEngineStats {
        HostEngineStats {
            live: self.arrays.len(),
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
            total_frees: self.total_frees.load(Ordering::Relaxed),
        }
    }

    fn store(&self, array: HostArray) -> Handle {
        let addr = self.next_addr.fetch_add(HANDLE_STRIDE, Ordering::Relaxed);
        self.arrays.insert(addr, array);
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        // HANDLE_BASE is non-zero and the counter only grows.
        Handle::from_addr(addr).unwrap_or_else(|| unreachable!("host handle address is never null"))
    }

    fn run(
        &self,
        operation: &str,
        inputs: &[Handle],
        params: &OpParams,
    ) -> Result<HostArray, DispatchError> {
        let device = params.device().unwrap_or_default();
        let dtype = params.data_type().unwrap_or(DataType::Float32);
        let err = |msg: &str| DispatchError::new(operation, msg);

        match operation {
            "_zeros" | "_ones" => {
                let shape = params.get_shape("shape").ok_or_else(|| err("missing `shape`"))?;
                let fill = if operation == "_ones" { 1.0 } else { 0.0 };
                let values = try_buffer(operation, element_count(operation, shape, dtype)?, fill)?;
                Ok(HostArray::from_values(device, shape.clone(), dtype, &values))
            }
            "_npi_arange" => {
                let start = params.get_float("start").ok_or_else(|| err("missing `start`"))?;
                let stop = params.get_float("stop").ok_or_else(|| err("missing `stop`"))?;
                let step = params.get_float("step").unwrap_or(1.0);
                if step == 0.0 {
                    return Err(err("`step` must be non-zero"));
                }
                let count = ((stop - start) / step).ceil().max(0.0) as usize;
                let shape = Shape::from([count]);
                let len = element_count(operation, &shape, dtype)?;
                let mut values = try_buffer(operation, len, 0.0)?;
                for (i, v) in values.iter_mut().enumerate() {
                    *v = start + i as f64 * step;
                }
                Ok(HostArray::from_values(device, shape, dtype, &values))
            }
            "_npi_linspace" => {
                let start = params.get_float("start").ok_or_else(|| err("missing `start`"))?;
                let stop = params.get_float("stop").ok_or_else(|| err("missing `stop`"))?;
                let num = params.get_int("num").ok_or_else(|| err("missing `num`"))?;
                if num < 0 {
                    return Err(err("`num` must be non-negative"));
                }
                let num = num as usize;
                let endpoint = params.get_bool("endpoint").unwrap_or(true);
                let div = if endpoint { num.saturating_sub(1) } else { num };
                let step = if div > 0 { (stop - start) / div as f64 } else { 0.0 };
                let shape = Shape::from([num]);
                let len = element_count(operation, &shape, dtype)?;
                let mut values = try_buffer(operation, len, 0.0)?;
                for (i, v) in values.iter_mut().enumerate() {
                    *v = start + i as f64 * step;
                }
                Ok(HostArray::from_values(device, shape, dtype, &values))
            }
            "_npi_random_uniform" => {
                let low = params.get_float("low").unwrap_or(0.0);
                let high = params.get_float("high").unwrap_or(1.0);
                let shape = params.get_shape("shape").ok_or_else(|| err("missing `shape`"))?;
                let len = element_count(operation, shape, dtype)?;
                let mut values = try_buffer(operation, len, 0.0)?;
                let mut rng = self.rng.lock();
                for v in values.iter_mut() {
                    *v = low + (high - low) * rng.gen::<f64>();
                }
                Ok(HostArray::from_values(device, shape.clone(), dtype, &values))
            }
            "_npi_random_normal" => {
                let loc = params.get_float("loc").unwrap_or(0.0);
                let scale = params.get_float("scale").unwrap_or(1.0);
                let shape = params.get_shape("shape").ok_or_else(|| err("missing `shape`"))?;
                let len = element_count(operation, shape, dtype)?;
                let mut values = try_buffer(operation, len, 0.0)?;
                let mut rng = self.rng.lock();
                for v in values.iter_mut() {
                    // Box-Muller; u1 in (0, 1] keeps ln finite.
                    let u1 = 1.0 - rng.gen::<f64>();
                    let u2 = rng.gen::<f64>();
                    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
                    *v = loc + scale * z;
                }
                Ok(HostArray::from_values(device, shape.clone(), dtype, &values))
            }
            "_npi_multinomial" => self.multinomial(inputs, params),
            "_copy" => {
                let src = inputs.first().ok_or_else(|| err("expected one input"))?;
                let entry = self.lookup(operation, *src)?;
                Ok(HostArray {
                    device: entry.device,
                    shape: entry.shape.clone(),
                    dtype: entry.dtype,
                    data: entry.data.clone(),
                })
            }
            other => Err(DispatchError::new(other, "operator not supported by host engine")),
        }
    }

    fn multinomial(
        &self,
        inputs: &[Handle],
        params: &OpParams,
    ) -> Result<HostArray, DispatchError> {
        const OP: &str = "_npi_multinomial";
        let pvals_handle = inputs
            .first()
            .ok_or_else(|| DispatchError::new(OP, "expected probability input"))?;
        let (device, pvals) = {
            let entry = self.lookup(OP, *pvals_handle)?;
            if entry.shape.dimension() != 1 {
                return Err(DispatchError::new(OP, "probabilities must be one-dimensional"));
            }
            (entry.device, decode(entry.dtype, &entry.data))
        };
        let n = params
            .get_int("n")
            .ok_or_else(|| DispatchError::new(OP, "missing `n`"))?;
        if n < 0 {
            return Err(DispatchError::new(OP, "`n` must be non-negative"));
        }
        let size = params.get_shape("size").cloned().unwrap_or_default();
        let categories = pvals.len();
        let total: f64 = pvals.iter().sum();
        if categories == 0 || total <= 0.0 {
            return Err(DispatchError::new(OP, "probabilities must have positive mass"));
        }

        let shape = size.concat(&Shape::from([categories]));
        let mut counts = try_buffer(OP, element_count(OP, &shape, DataType::Int64)?, 0.0)?;
        let mut rng = self.rng.lock();
        for row in counts.chunks_mut(categories) {
            for _ in 0..n {
                let mut u = rng.gen::<f64>() * total;
                let mut pick = categories - 1;
                for (k, p) in pvals.iter().enumerate() {
                    if u < *p {
                        pick = k;
                        break;
                    }
                    u -= p;
                }
                row[pick] += 1.0;
            }
        }
        Ok(HostArray::from_values(device, shape, DataType::Int64, &counts))
    }

    fn lookup(
        &self,
        operation: &str,
        handle: Handle,
    ) -> Result<dashmap::mapref::one::Ref<'_, usize, HostArray>, DispatchError> {
        self.arrays
            .get(&handle.addr())
            .ok_or_else(|| DispatchError::new(operation, format!("unknown handle {handle:?}")))
    }
}

impl Default for HostEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher for HostEngine {
    fn name(&self) -> &str {
        "host"
    }

    fn create(
        &self,
        device: Device,
        shape: &Shape,
        dtype: DataType,
    ) -> Result<Handle, DispatchError> {
        let array = HostArray::zeroed("create", device, shape.clone(), dtype)?;
        let handle = self.store(array);
        debug!(?handle, %shape, %dtype, "Host array allocated");
        Ok(handle)
    }

    fn invoke(
        &self,
        operation: &str,
        inputs: &[Handle],
        params: &OpParams,
    ) -> Result<Vec<Handle>, DispatchError> {
        let array = self.run(operation, inputs, params)?;
        let handle = self.store(array);
        debug!(operation, ?handle, "Host operator produced output");
        Ok(vec![handle])
    }

    fn invoke_into(
        &self,
        operation: &str,
        inputs: &[Handle],
        outputs: &[Handle],
        params: &OpParams,
    ) -> Result<(), DispatchError> {
        let [dest] = outputs else {
            return Err(DispatchError::new(operation, "expected exactly one output"));
        };
        let produced = if operation == "_copyto" {
            let src = inputs
                .first()
                .ok_or_else(|| DispatchError::new(operation, "expected one input"))?;
            self.lookup(operation, *src)?.data.clone()
        } else {
            self.run(operation, inputs, params)?.data
        };
        let mut target = self
            .arrays
            .get_mut(&dest.addr())
            .ok_or_else(|| DispatchError::new(operation, format!("unknown handle {dest:?}")))?;
        if target.data.len() != produced.len() {
            return Err(DispatchError::new(operation, "output size mismatch"));
        }
        target.data = produced;
        Ok(())
    }

    fn describe(&self, handle: Handle) -> Result<ArrayDesc, DispatchError> {
        let entry = self.lookup("describe", handle)?;
        Ok(ArrayDesc::new(entry.device, entry.shape.clone(), entry.dtype))
    }

    fn copy_from_host(&self, handle: Handle, bytes: &[u8]) -> Result<(), DispatchError> {
        let mut entry = self
            .arrays
            .get_mut(&handle.addr())
            .ok_or_else(|| {
                DispatchError::new("copy_from_host", format!("unknown handle {handle:?}"))
            })?;
        if entry.data.len() != bytes.len() {
            return Err(DispatchError::new(
                "copy_from_host",
                format!("expected {} bytes, got {}", entry.data.len(), bytes.len()),
            ));
        }
        entry.data.copy_from_slice(bytes);
        Ok(())
    }

    fn copy_to_host(&self, handle: Handle) -> Result<Vec<u8>, DispatchError> {
        Ok(self.lookup("copy_to_host", handle)?.data.clone())
    }

    fn free(&self, handle: Handle) -> Result<(), DispatchError> {
        if self.failing_frees.contains(&handle.addr()) {
            return Err(DispatchError::new("free", format!("engine refused to free {handle:?}")));
        }
        match self.arrays.remove(&handle.addr()) {
            Some(_) => {
                self.total_frees.fetch_add(1, Ordering::Relaxed);
                debug!(?handle, "Host array freed");
                Ok(())
            }
            None => Err(DispatchError::new("free", format!("unknown handle {handle:?}"))),
        }
    }
}

fn too_large(operation: &str, shape: &Shape) -> DispatchError {
    DispatchError::new(operation, format!("shape {shape} is too large"))
}

/// Element count of `shape`, checked against both the `dtype` buffer and
/// the `f64` staging buffer operators build their values in.
fn element_count(operation: &str, shape: &Shape, dtype: DataType) -> Result<usize, DispatchError> {
    let count = shape.checked_size().ok_or_else(|| too_large(operation, shape))?;
    shape
        .checked_byte_len(dtype)
        .and_then(|_| count.checked_mul(std::mem::size_of::<f64>()))
        .ok_or_else(|| too_large(operation, shape))?;
    Ok(count)
}

/// Allocate `len` copies of `fill`, failing instead of aborting when the
/// allocator cannot satisfy the request.
fn try_buffer<T: Clone>(operation: &str, len: usize, fill: T) -> Result<Vec<T>, DispatchError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|e| {
        DispatchError::new(operation, format!("cannot allocate {len} elements: {e}"))
    })?;
    buf.resize(len, fill);
    Ok(buf)
}

fn encode(dtype: DataType, values: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * dtype.num_bytes());
    for &v in values {
        match dtype {
            DataType::Float32 => out.extend_from_slice(&(v as f32).to_le_bytes()),
            DataType::Float64 => out.extend_from_slice(&v.to_le_bytes()),
            DataType::Uint8 => out.push(v as u8),
            DataType::Int8 => out.extend_from_slice(&(v as i8).to_le_bytes()),
            DataType::Int32 => out.extend_from_slice(&(v as i32).to_le_bytes()),
            DataType::Int64 => out.extend_from_slice(&(v as i64).to_le_bytes()),
        }
    }
    out
}

fn decode(dtype: DataType, bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(dtype.num_bytes())
        .map(|c| match dtype {
            DataType::Float32 => f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64,
            DataType::Float64 => {
                f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
            }
            DataType::Uint8 => c[0] as f64,
            DataType::Int8 => c[0] as i8 as f64,
            DataType::Int32 => i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64,
            DataType::Int64 => {
                i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f64
            }
        })
        .collect()
}
