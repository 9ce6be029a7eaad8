//! C ABI for embedding the interpreter in C, C++ or any FFI-capable host.
//!
//! Enable with the `ffi` feature flag (on by default).
//!
//! ```c
//! PicoliteModel* model = picolite_model_load(buf, len);
//! PicoliteRegistry* reg = picolite_registry_create();
//! picolite_registry_register(reg, PICOLITE_OP_FULLY_CONNECTED);
//! PicoliteInterpreter* interp = picolite_interpreter_create(model, reg, 16 * 1024);
//! if (picolite_interpreter_allocate(interp) == PICOLITE_OK) {
//!     const PicoliteTensor* in = picolite_interpreter_input(interp, 0);
//!     memcpy(in->data, input, in->bytes);
//!     picolite_interpreter_invoke(interp);
//! }
//! picolite_interpreter_destroy(&interp);
//! picolite_registry_destroy(&reg);
//! picolite_model_destroy(&model);
//! ```
//!
//! The model buffer must outlive the model handle, and the model and
//! registry must outlive every interpreter built from them.

use std::ffi::CStr;
use std::os::raw::c_char;
use std::ptr;

use smallvec::SmallVec;

use crate::error::{ExecutionError, ShapeError, Status};
use crate::format::Model;
use crate::interpreter::Interpreter;
use crate::ops::{EvalContext, PrepareContext, MAX_NODE_INPUTS, MAX_NODE_OUTPUTS};
use crate::registry::{Kernel, OpKind, OpRegistry};
use crate::tensor::{DType, TensorDesc};

pub type PicoliteStatus = Status;

/// Opaque model handle.
pub struct PicoliteModel {
    model: Model<'static>,
}

/// Opaque registry handle.
pub struct PicoliteRegistry {
    registry: OpRegistry,
}

/// Opaque interpreter handle.
pub struct PicoliteInterpreter {
    interp: Interpreter<'static, 'static>,
    inputs: Vec<PicoliteTensor>,
    outputs: Vec<PicoliteTensor>,
}

/// Borrowed view of one tensor. `data` is null where no storage is bound.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PicoliteTensor {
    pub dtype: DType,
    pub dims: *const usize,
    pub rank: usize,
    /// First (or only) quantization scale; 0 when unquantized.
    pub scale: f32,
    pub zero_point: i64,
    pub data: *mut u8,
    pub bytes: usize,
}

impl PicoliteTensor {
    fn new(desc: &TensorDesc, data: *mut u8, bytes: usize) -> Self {
        let (scale, zero_point) = desc
            .quant
            .as_ref()
            .map(|q| (q.scale[0], q.zero_point[0]))
            .unwrap_or((0.0, 0));
        Self {
            dtype: desc.dtype,
            dims: desc.shape.as_ptr(),
            rank: desc.shape.len(),
            scale,
            zero_point,
            data,
            bytes,
        }
    }

    fn absent() -> Self {
        Self {
            dtype: DType::Float32,
            dims: ptr::null(),
            rank: 0,
            scale: 0.0,
            zero_point: 0,
            data: ptr::null_mut(),
            bytes: 0,
        }
    }
}

/// Operands handed to a C kernel callback.
#[repr(C)]
pub struct PicoliteKernelIo {
    pub node: usize,
    pub inputs: *const PicoliteTensor,
    pub num_inputs: usize,
    pub outputs: *const PicoliteTensor,
    pub num_outputs: usize,
}

/// Validates operands at planning time; tensors carry no data pointers.
pub type PicolitePrepareFn = unsafe extern "C" fn(io: *const PicoliteKernelIo) -> PicoliteStatus;

/// Computes outputs at invoke time.
pub type PicoliteEvalFn = unsafe extern "C" fn(io: *const PicoliteKernelIo) -> PicoliteStatus;

/// Kernel backed by C callbacks. Output shapes are the declared ones.
struct CKernel {
    prepare: Option<PicolitePrepareFn>,
    eval: PicoliteEvalFn,
}

impl Kernel for CKernel {
    fn prepare(&self, ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
        let Some(prepare) = self.prepare else {
            return Ok(());
        };
        let inputs: SmallVec<[PicoliteTensor; MAX_NODE_INPUTS]> = (0..ctx.num_inputs())
            .map(|i| ctx.optional_input(i).map_or(PicoliteTensor::absent(), |t| PicoliteTensor::new(t.desc, ptr::null_mut(), 0)))
            .collect();
        let outputs: SmallVec<[PicoliteTensor; MAX_NODE_OUTPUTS]> = (0..ctx.num_outputs())
            .map(|i| ctx.output(i).map_or(PicoliteTensor::absent(), |t| PicoliteTensor::new(t.desc, ptr::null_mut(), 0)))
            .collect();
        let io = PicoliteKernelIo {
            node: ctx.node(),
            inputs: inputs.as_ptr(),
            num_inputs: inputs.len(),
            outputs: outputs.as_ptr(),
            num_outputs: outputs.len(),
        };
        match unsafe { prepare(&io) } {
            Status::Ok => Ok(()),
            status => Err(ctx.invalid(format!("custom prepare returned {:?}", status))),
        }
    }

    fn eval(&self, ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
        let inputs: SmallVec<[PicoliteTensor; MAX_NODE_INPUTS]> = (0..ctx.num_inputs())
            .map(|i| {
                ctx.optional_input(i).map_or(PicoliteTensor::absent(), |t| {
                    PicoliteTensor::new(t.desc(), t.bytes().as_ptr() as *mut u8, t.bytes().len())
                })
            })
            .collect();
        let node = ctx.node();
        let outputs: SmallVec<[PicoliteTensor; MAX_NODE_OUTPUTS]> = ctx
            .outputs_mut()
            .iter_mut()
            .map(|t| {
                let desc = t.desc();
                let data = t.bytes_mut();
                PicoliteTensor::new(desc, data.as_mut_ptr(), data.len())
            })
            .collect();
        let io = PicoliteKernelIo {
            node,
            inputs: inputs.as_ptr(),
            num_inputs: inputs.len(),
            outputs: outputs.as_ptr(),
            num_outputs: outputs.len(),
        };
        match unsafe { (self.eval)(&io) } {
            Status::Ok => Ok(()),
            status => Err(ctx.fail(format!("custom eval returned {:?}", status))),
        }
    }
}

/// Verify and load a model from `len` bytes at `data`. Null on failure.
/// The buffer is borrowed, not copied.
#[no_mangle]
pub unsafe extern "C" fn picolite_model_load(data: *const u8, len: usize) -> *mut PicoliteModel {
    if data.is_null() {
        return ptr::null_mut();
    }
    let bytes = std::slice::from_raw_parts(data, len);
    match Model::from_bytes(bytes) {
        Ok(model) => Box::into_raw(Box::new(PicoliteModel { model })),
        Err(e) => {
            tracing::warn!(error = %e, "model verification failed");
            ptr::null_mut()
        }
    }
}

/// Free a model and null the caller's handle. Null-safe.
#[no_mangle]
pub unsafe extern "C" fn picolite_model_destroy(model: *mut *mut PicoliteModel) {
    if model.is_null() || (*model).is_null() {
        return;
    }
    drop(Box::from_raw(*model));
    *model = ptr::null_mut();
}

/// Create an empty registry with the default capacity.
#[no_mangle]
pub extern "C" fn picolite_registry_create() -> *mut PicoliteRegistry {
    Box::into_raw(Box::new(PicoliteRegistry { registry: OpRegistry::new() }))
}

/// Register the built-in kernel for operator kind `op` (an `OpKind` discriminant).
#[no_mangle]
pub unsafe extern "C" fn picolite_registry_register(reg: *mut PicoliteRegistry, op: u32) -> PicoliteStatus {
    let Some(reg) = reg.as_mut() else {
        return Status::InvalidArgument;
    };
    let Some(&kind) = OpKind::ALL.get(op as usize) else {
        return Status::InvalidArgument;
    };
    match reg.registry.register(kind) {
        Ok(()) => Status::Ok,
        Err(e) => {
            tracing::warn!(error = %e, "registration failed");
            Status::RegistrationError
        }
    }
}

/// Register a named custom kernel. `prepare` may be null.
#[no_mangle]
pub unsafe extern "C" fn picolite_registry_register_custom(
    reg: *mut PicoliteRegistry,
    name: *const c_char,
    prepare: Option<PicolitePrepareFn>,
    eval: Option<PicoliteEvalFn>,
) -> PicoliteStatus {
    let (Some(reg), false, Some(eval)) = (reg.as_mut(), name.is_null(), eval) else {
        return Status::InvalidArgument;
    };
    let Ok(name) = CStr::from_ptr(name).to_str() else {
        return Status::InvalidArgument;
    };
    match reg.registry.register_custom(name, CKernel { prepare, eval }) {
        Ok(()) => Status::Ok,
        Err(e) => {
            tracing::warn!(error = %e, "custom registration failed");
            Status::RegistrationError
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn picolite_registry_destroy(reg: *mut *mut PicoliteRegistry) {
    if reg.is_null() || (*reg).is_null() {
        return;
    }
    drop(Box::from_raw(*reg));
    *reg = ptr::null_mut();
}

/// Bind a model and registry; the `arena_size`-byte arena is reserved by
/// `picolite_interpreter_allocate`, which reports `AllocationError` if it
/// cannot be.
#[no_mangle]
pub unsafe extern "C" fn picolite_interpreter_create(
    model: *const PicoliteModel,
    reg: *const PicoliteRegistry,
    arena_size: usize,
) -> *mut PicoliteInterpreter {
    let (Some(model), Some(reg)) = (model.as_ref(), reg.as_ref()) else {
        return ptr::null_mut();
    };
    let interp = Interpreter::new(&model.model, &reg.registry, arena_size);
    Box::into_raw(Box::new(PicoliteInterpreter { interp, inputs: Vec::new(), outputs: Vec::new() }))
}

#[no_mangle]
pub unsafe extern "C" fn picolite_interpreter_allocate(interp: *mut PicoliteInterpreter) -> PicoliteStatus {
    let Some(handle) = interp.as_mut() else {
        return Status::InvalidArgument;
    };
    if let Err(e) = handle.interp.allocate_tensors() {
        tracing::warn!(error = %e, "allocation failed");
        return e.status();
    }
    let interp = &handle.interp;
    let model = interp.model();
    handle.inputs = model.inputs().iter().map(|&t| cached_tensor(interp, t)).collect();
    handle.outputs = model.outputs().iter().map(|&t| cached_tensor(interp, t)).collect();
    Status::Ok
}

/// Descriptor whose `data` stays valid across invokes; constant outputs
/// point into the model buffer and are read-only.
fn cached_tensor(interp: &Interpreter<'_, '_>, t: usize) -> PicoliteTensor {
    let desc = interp.model().tensor(t);
    match (desc, interp.tensor_ptr(t)) {
        (Some(desc), Some(data)) => PicoliteTensor::new(desc, data, desc.nbytes()),
        _ => PicoliteTensor::absent(),
    }
}

/// Input tensor `n`, or null if out of range or not allocated.
#[no_mangle]
pub unsafe extern "C" fn picolite_interpreter_input(interp: *const PicoliteInterpreter, n: usize) -> *const PicoliteTensor {
    interp.as_ref().and_then(|h| h.inputs.get(n)).map_or(ptr::null(), |t| t as *const _)
}

/// Output tensor `n`, or null if out of range or not allocated.
#[no_mangle]
pub unsafe extern "C" fn picolite_interpreter_output(interp: *const PicoliteInterpreter, n: usize) -> *const PicoliteTensor {
    interp.as_ref().and_then(|h| h.outputs.get(n)).map_or(ptr::null(), |t| t as *const _)
}

#[no_mangle]
pub unsafe extern "C" fn picolite_interpreter_invoke(interp: *mut PicoliteInterpreter) -> PicoliteStatus {
    let Some(handle) = interp.as_mut() else {
        return Status::InvalidArgument;
    };
    handle.interp.invoke().into()
}

#[no_mangle]
pub unsafe extern "C" fn picolite_interpreter_destroy(interp: *mut *mut PicoliteInterpreter) {
    if interp.is_null() || (*interp).is_null() {
        return;
    }
    drop(Box::from_raw(*interp));
    *interp = ptr::null_mut();
}

/// Static, NUL-terminated description of `status`.
#[no_mangle]
pub extern "C" fn picolite_status_message(status: PicoliteStatus) -> *const c_char {
    status.message().as_ptr() as *const c_char
}
