//! FFI Bridge - native engine loaded at runtime
//!
//! Binds the handful of C entry points the scope tree needs from an
//! MXNet-compatible shared library.  Symbols are resolved once with
//! `libloading` when the library is opened, so a missing engine is a
//! configuration error instead of a link error.
//!
//! # Calling convention:
//! - Every entry point returns `0` on success and `-1` on failure
//! - On failure the message is read with `MXGetLastError` on the same thread
//! - Handles are opaque `void*` owned by the engine until `MXNDArrayFree`

use anyhow::{Context, Result};
use dashmap::DashMap;
use libloading::Library;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_uint, c_void};
use std::path::{Path, PathBuf};
use std::ptr;
use tracing::{debug, info};

use crate::dispatch::Dispatcher;
use crate::error::DispatchError;
use crate::handle::Handle;
use crate::params::OpParams;
use crate::types::{ArrayDesc, DataType, Device, DeviceType, Shape};

/// C-compatible status code
pub type EngineStatus = c_int;

pub const ENGINE_SUCCESS: EngineStatus = 0;
pub const ENGINE_ERROR: EngineStatus = -1;

const CREATE_EX: &str = "MXNDArrayCreateEx";

/// Opaque engine pointers.
pub type NDArrayHandle = *mut c_void;
pub type OpHandle = *mut c_void;

type GetLastErrorFn = unsafe extern "C" fn() -> *const c_char;
type CreateExFn = unsafe extern "C" fn(
    shape: *const c_uint,
    ndim: c_uint,
    dev_type: c_int,
    dev_id: c_int,
    delay_alloc: c_int,
    dtype: c_int,
    out: *mut NDArrayHandle,
) -> EngineStatus;
type FreeFn = unsafe extern "C" fn(handle: NDArrayHandle) -> EngineStatus;
type GetOpHandleFn = unsafe extern "C" fn(name: *const c_char, out: *mut OpHandle) -> EngineStatus;
type ImperativeInvokeFn = unsafe extern "C" fn(
    creator: OpHandle,
    num_inputs: c_int,
    inputs: *mut NDArrayHandle,
    num_outputs: *mut c_int,
    outputs: *mut *mut NDArrayHandle,
    num_params: c_int,
    param_keys: *const *const c_char,
    param_vals: *const *const c_char,
) -> EngineStatus;
/// `size` counts elements, not bytes.
type SyncCopyFromCpuFn =
    unsafe extern "C" fn(handle: NDArrayHandle, data: *const c_void, size: usize) -> EngineStatus;
type SyncCopyToCpuFn =
    unsafe extern "C" fn(handle: NDArrayHandle, data: *mut c_void, size: usize) -> EngineStatus;
type GetShapeFn = unsafe extern "C" fn(
    handle: NDArrayHandle,
    out_dim: *mut c_uint,
    out_pdata: *mut *const c_uint,
) -> EngineStatus;
type GetDTypeFn = unsafe extern "C" fn(handle: NDArrayHandle, out: *mut c_int) -> EngineStatus;
type GetContextFn = unsafe extern "C" fn(
    handle: NDArrayHandle,
    out_dev_type: *mut c_int,
    out_dev_id: *mut c_int,
) -> EngineStatus;

/// Resolved entry points.  Only valid while the owning [`Library`] is loaded.
struct EngineApi {
    get_last_error: GetLastErrorFn,
    create_ex: CreateExFn,
    free: FreeFn,
    get_op_handle: GetOpHandleFn,
    imperative_invoke: ImperativeInvokeFn,
    sync_copy_from_cpu: SyncCopyFromCpuFn,
    sync_copy_to_cpu: SyncCopyToCpuFn,
    get_shape: GetShapeFn,
    get_dtype: GetDTypeFn,
    get_context: GetContextFn,
}

macro_rules! resolve {
    ($lib:expr, $ty:ty, $name:literal) => {{
        let symbol = $lib
            .get::<$ty>(concat!($name, "\0").as_bytes())
            .with_context(|| format!("Engine library missing '{}' export", $name))?;
        *symbol
    }};
}

impl EngineApi {
    /// # Safety
    /// The library must export these symbols with the declared signatures.
    unsafe fn resolve(lib: &Library) -> Result<Self> {
        Ok(Self {
            get_last_error: resolve!(lib, GetLastErrorFn, "MXGetLastError"),
            create_ex: resolve!(lib, CreateExFn, "MXNDArrayCreateEx"),
            free: resolve!(lib, FreeFn, "MXNDArrayFree"),
            get_op_handle: resolve!(lib, GetOpHandleFn, "NNGetOpHandle"),
            imperative_invoke: resolve!(lib, ImperativeInvokeFn, "MXImperativeInvoke"),
            sync_copy_from_cpu: resolve!(lib, SyncCopyFromCpuFn, "MXNDArraySyncCopyFromCPU"),
            sync_copy_to_cpu: resolve!(lib, SyncCopyToCpuFn, "MXNDArraySyncCopyToCPU"),
            get_shape: resolve!(lib, GetShapeFn, "MXNDArrayGetShape"),
            get_dtype: resolve!(lib, GetDTypeFn, "MXNDArrayGetDType"),
            get_context: resolve!(lib, GetContextFn, "MXNDArrayGetContext"),
        })
    }
}

/// A native engine opened from a shared library.
///
/// # Safety Model:
/// - Function pointers are copied out of the library and never outlive it
/// - The engine serializes its own calls; this type adds no locking
/// - Handles passed in must have come from the same library
pub struct EngineLibrary {
    api: EngineApi,
    /// Resolved operator handles keyed by name, stored as addresses.
    ops: DashMap<String, usize>,
    path: PathBuf,
    // Declared last so the entry points above are dropped first.
    _library: Library,
}

impl EngineLibrary {
    /// Open the engine at `path` and resolve every entry point.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading engine library from {:?}", path);

        let library = unsafe {
            Library::new(path)
                .with_context(|| format!("Failed to load engine library from {:?}", path))?
        };
        let api = unsafe { EngineApi::resolve(&library)? };

        info!("Engine library {:?} loaded successfully", path);
        Ok(Self {
            api,
            ops: DashMap::new(),
            path: path.to_path_buf(),
            _library: library,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check(&self, operation: &str, status: EngineStatus) -> Result<(), DispatchError> {
        if status == ENGINE_SUCCESS {
            return Ok(());
        }
        let message = unsafe {
            let raw = (self.api.get_last_error)();
            if raw.is_null() {
                format!("status {status}")
            } else {
                CStr::from_ptr(raw).to_string_lossy().into_owned()
            }
        };
        Err(DispatchError::new(operation, message))
    }

    fn op_handle(&self, operation: &str) -> Result<OpHandle, DispatchError> {
        if let Some(addr) = self.ops.get(operation) {
            return Ok(*addr as OpHandle);
        }
        let name = c_string(operation, operation)?;
        let mut op: OpHandle = ptr::null_mut();
        let status = unsafe { (self.api.get_op_handle)(name.as_ptr(), &mut op) };
        self.check(operation, status)?;
        if op.is_null() {
            return Err(DispatchError::new(operation, "unknown operator"));
        }
        debug!(operation, "Resolved operator handle");
        self.ops.insert(operation.to_string(), op as usize);
        Ok(op)
    }

    /// Run an operator.  `outputs` empty means the engine allocates them.
    fn run(
        &self,
        operation: &str,
        inputs: &[Handle],
        outputs: &[Handle],
        params: &OpParams,
    ) -> Result<Vec<Handle>, DispatchError> {
        let op = self.op_handle(operation)?;

        let mut keys = Vec::with_capacity(params.len());
        let mut vals = Vec::with_capacity(params.len());
        for (key, value) in params.iter() {
            keys.push(c_string(operation, key)?);
            vals.push(c_string(operation, &value.to_string())?);
        }
        let key_ptrs: Vec<*const c_char> = keys.iter().map(|k| k.as_ptr()).collect();
        let val_ptrs: Vec<*const c_char> = vals.iter().map(|v| v.as_ptr()).collect();

        let mut input_ptrs: Vec<NDArrayHandle> = inputs.iter().map(|h| h.as_ptr()).collect();
        let mut output_ptrs: Vec<NDArrayHandle> = outputs.iter().map(|h| h.as_ptr()).collect();
        let mut num_outputs = c_count(operation, output_ptrs.len())?;
        let mut out_array: *mut NDArrayHandle = if output_ptrs.is_empty() {
            ptr::null_mut()
        } else {
            output_ptrs.as_mut_ptr()
        };

        let status = unsafe {
            (self.api.imperative_invoke)(
                op,
                c_count(operation, input_ptrs.len())?,
                input_ptrs.as_mut_ptr(),
                &mut num_outputs,
                &mut out_array,
                c_count(operation, key_ptrs.len())?,
                key_ptrs.as_ptr(),
                val_ptrs.as_ptr(),
            )
        };
        self.check(operation, status)?;

        if !outputs.is_empty() {
            return Ok(outputs.to_vec());
        }
        if out_array.is_null() || num_outputs <= 0 {
            return Ok(Vec::new());
        }
        // The engine owns `out_array`; copy the handles out before the next call.
        let produced = unsafe { std::slice::from_raw_parts(out_array, num_outputs as usize) };
        produced
            .iter()
            .map(|&raw| {
                Handle::from_ptr(raw)
                    .ok_or_else(|| DispatchError::new(operation, "engine returned a null output"))
            })
            .collect()
    }

    fn element_count(&self, handle: Handle) -> Result<(usize, DataType), DispatchError> {
        let desc = self.describe(handle)?;
        Ok((desc.shape.as_ref().map_or(0, Shape::size), desc.dtype))
    }
}

fn c_string(operation: &str, value: &str) -> Result<CString, DispatchError> {
    CString::new(value)
        .map_err(|_| DispatchError::new(operation, format!("interior NUL in {value:?}")))
}

/// Shape dimensions as the C API's `mx_uint`, rejecting any that do not fit.
fn native_dims(shape: &Shape) -> Result<Vec<c_uint>, DispatchError> {
    shape
        .dims()
        .iter()
        .map(|&d| {
            c_uint::try_from(d).map_err(|_| {
                DispatchError::new(CREATE_EX, format!("dimension {d} of {shape} exceeds u32"))
            })
        })
        .collect()
}

fn native_device_id(device: Device) -> Result<c_int, DispatchError> {
    c_int::try_from(device.device_id)
        .map_err(|_| DispatchError::new(CREATE_EX, format!("device id of {device} exceeds i32")))
}

fn c_count(operation: &str, len: usize) -> Result<c_int, DispatchError> {
    c_int::try_from(len)
        .map_err(|_| DispatchError::new(operation, format!("{len} arguments exceed i32")))
}

impl Dispatcher for EngineLibrary {
    fn name(&self) -> &str {
        "native"
    }

    fn create(
        &self,
        device: Device,
        shape: &Shape,
        dtype: DataType,
    ) -> Result<Handle, DispatchError> {
        let dims = native_dims(shape)?;
        let ndim = c_uint::try_from(dims.len()).map_err(|_| {
            DispatchError::new(CREATE_EX, format!("{shape} has too many dimensions"))
        })?;
        let device_id = native_device_id(device)?;
        let mut out: NDArrayHandle = ptr::null_mut();
        let status = unsafe {
            (self.api.create_ex)(
                dims.as_ptr(),
                ndim,
                device.device_type.code(),
                device_id,
                0,
                dtype.code(),
                &mut out,
            )
        };
        self.check(CREATE_EX, status)?;
        Handle::from_ptr(out).ok_or_else(|| DispatchError::new(CREATE_EX, "null handle"))
    }

    fn invoke(
        &self,
        operation: &str,
        inputs: &[Handle],
        params: &OpParams,
    ) -> Result<Vec<Handle>, DispatchError> {
        self.run(operation, inputs, &[], params)
    }

    fn invoke_into(
        &self,
        operation: &str,
        inputs: &[Handle],
        outputs: &[Handle],
        params: &OpParams,
    ) -> Result<(), DispatchError> {
        if outputs.is_empty() {
            return Err(DispatchError::new(operation, "no output arrays given"));
        }
        self.run(operation, inputs, outputs, params).map(|_| ())
    }

    fn describe(&self, handle: Handle) -> Result<ArrayDesc, DispatchError> {
        let raw = handle.as_ptr();

        let mut ndim: c_uint = 0;
        let mut pdata: *const c_uint = ptr::null();
        let status = unsafe { (self.api.get_shape)(raw, &mut ndim, &mut pdata) };
        self.check("MXNDArrayGetShape", status)?;
        let dims = if ndim == 0 || pdata.is_null() {
            Vec::new()
        } else {
            unsafe { std::slice::from_raw_parts(pdata, ndim as usize) }
                .iter()
                .map(|&d| d as usize)
                .collect()
        };

        let mut dtype_code: c_int = 0;
        let status = unsafe { (self.api.get_dtype)(raw, &mut dtype_code) };
        self.check("MXNDArrayGetDType", status)?;
        let dtype = DataType::from_code(dtype_code).ok_or_else(|| {
            DispatchError::new("MXNDArrayGetDType", format!("unsupported dtype code {dtype_code}"))
        })?;

        let mut dev_type: c_int = 0;
        let mut dev_id: c_int = 0;
        let status = unsafe { (self.api.get_context)(raw, &mut dev_type, &mut dev_id) };
        self.check("MXNDArrayGetContext", status)?;
        let device_type = DeviceType::from_code(dev_type).ok_or_else(|| {
            DispatchError::new("MXNDArrayGetContext", format!("unsupported device type {dev_type}"))
        })?;

        Ok(ArrayDesc::new(
            Device {
                device_type,
                device_id: dev_id.max(0) as u32,
            },
            Shape::new(dims),
            dtype,
        ))
    }

    fn copy_from_host(&self, handle: Handle, bytes: &[u8]) -> Result<(), DispatchError> {
        let (elements, dtype) = self.element_count(handle)?;
        if bytes.len() != elements * dtype.num_bytes() {
            return Err(DispatchError::new(
                "MXNDArraySyncCopyFromCPU",
                format!("expected {} bytes, got {}", elements * dtype.num_bytes(), bytes.len()),
            ));
        }
        let data = bytes.as_ptr() as *const c_void;
        let status = unsafe { (self.api.sync_copy_from_cpu)(handle.as_ptr(), data, elements) };
        self.check("MXNDArraySyncCopyFromCPU", status)
    }

    fn copy_to_host(&self, handle: Handle) -> Result<Vec<u8>, DispatchError> {
        let (elements, dtype) = self.element_count(handle)?;
        let mut bytes = vec![0u8; elements * dtype.num_bytes()];
        let data = bytes.as_mut_ptr() as *mut c_void;
        let status = unsafe { (self.api.sync_copy_to_cpu)(handle.as_ptr(), data, elements) };
        self.check("MXNDArraySyncCopyToCPU", status)?;
        Ok(bytes)
    }

    fn free(&self, handle: Handle) -> Result<(), DispatchError> {
        let status = unsafe { (self.api.free)(handle.as_ptr()) };
        self.check("MXNDArrayFree", status)
    }
}

impl std::fmt::Debug for EngineLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineLibrary")
            .field("path", &self.path)
            .field("cached_ops", &self.ops.len())
            .finish()
    }
}
