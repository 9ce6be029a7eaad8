//! Quantize, Dequantize and Cast.

use super::{prepare_same_shape, EvalContext, PrepareContext};
use crate::error::{ExecutionError, ShapeError};
use crate::tensor::{exact_integers, DType};

/// Float (or quantized, for requantization) in, quantized integer out.
pub fn prepare_quantize(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    prepare_same_shape(ctx)?;
    let out = ctx.output(0)?;
    if !out.dtype().is_integer() || out.quantization().is_none() {
        return Err(ctx.invalid(format!("output must be a quantized integer tensor, got {}", out.dtype())));
    }
    let x = ctx.input(0)?;
    if !x.dtype().is_float() && x.quantization().is_none() {
        return Err(ctx.invalid(format!("cannot quantize unquantized {} input", x.dtype())));
    }
    Ok(())
}

/// Quantized integer or float16 in, float32 out.
pub fn prepare_dequantize(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    prepare_same_shape(ctx)?;
    let x = ctx.input(0)?;
    let quantized = x.dtype().is_integer() && x.quantization().is_some();
    if !quantized && x.dtype() != DType::Float16 {
        return Err(ctx.invalid(format!("cannot dequantize {} input", x.dtype())));
    }
    if ctx.output(0)?.dtype() != DType::Float32 {
        return Err(ctx.invalid("output must be float32"));
    }
    Ok(())
}

/// Converts through the real value using both tensors' parameters.
pub fn eval_requantize(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let x = ctx.input(0)?;
    let out = ctx.output(0)?;
    for i in 0..out.numel() {
        out.set_real(i, x.real(i));
    }
    Ok(())
}

/// Stored-value conversion; float to integer truncates toward zero.
pub fn eval_cast(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let x = ctx.input(0)?;
    let out = ctx.output(0)?;
    if exact_integers(&x, out.desc()) {
        for i in 0..out.numel() {
            out.set_index(i, x.index(i));
        }
        return Ok(());
    }
    let truncate = x.dtype().is_float() && out.dtype().is_integer();
    for i in 0..out.numel() {
        let v = x.value(i);
        out.set_value(i, if truncate { v.trunc() } else { v });
    }
    Ok(())
}
