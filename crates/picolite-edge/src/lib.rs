//! # picolite-edge
//!
//! Static-memory neural network interpreter for microcontroller-class
//! targets, with a flat C ABI.
//!
//! ## Key Features
//! - `.plite` model format: single buffer, verified up front, zero-copy constants
//! - Fixed-capacity operator registry with a data-driven built-in kernel table
//! - Greedy offline memory planning into one caller-sized arena
//! - float32, float16 and quantized int8/uint8/int16/int32 execution
//! - C FFI behind the `ffi` feature
//!
//! ```no_run
//! use picolite_edge::{Interpreter, Model, OpKind, OpRegistry};
//!
//! # fn main() -> picolite_edge::Result<()> {
//! let bytes = std::fs::read("model.plite").unwrap();
//! let model = Model::from_bytes(&bytes)?;
//! let mut registry = OpRegistry::new();
//! registry.register(OpKind::FullyConnected)?;
//! let mut interp = Interpreter::new(&model, &registry, 16 * 1024);
//! interp.allocate_tensors()?;
//! if let Some(mut input) = interp.input_mut(0) {
//!     input.write_f32(&[1.0, 2.0, 3.0])?;
//! }
//! interp.invoke()?;
//! # Ok(())
//! # }
//! ```

pub mod arena;
pub mod config;
pub mod error;
pub mod format;
pub mod interpreter;
pub mod ops;
pub mod plan;
pub mod registry;
pub mod tensor;

#[cfg(feature = "ffi")]
pub mod ffi;

pub use arena::{Arena, GreedyMemoryPlanner};
pub use config::{ConfigError, RuntimeConfig};
pub use error::{
    AllocationError, Error, ExecutionError, RegistrationError, Result, ShapeError, Status, VerifyError,
};
pub use format::{Model, ModelBuilder, ModelHeader, NodeDesc};
pub use interpreter::{Interpreter, State};
pub use ops::{Activation, EvalContext, OpParams, Padding, PrepareContext, MAX_NODE_INPUTS, MAX_NODE_OUTPUTS};
pub use plan::ExecutionPlan;
pub use registry::{FnKernel, Kernel, OpKind, OpRegistry, OperatorCode};
pub use tensor::{DType, Quantization, TensorDesc, TensorView, TensorViewMut};
