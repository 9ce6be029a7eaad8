//! Activation kernels.

use super::elementwise::unary;
use super::{broadcast_index, broadcast_shapes, prepare_same_shape, EvalContext, PrepareContext};
use crate::error::{ExecutionError, ShapeError};

/// ReLU: max(0, x)
pub fn eval_relu(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    unary(ctx, |v| v.max(0.0))
}

/// ReLU6: clamp(x, 0, 6)
pub fn eval_relu6(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    unary(ctx, |v| v.clamp(0.0, 6.0))
}

/// LeakyReLU with slope `alpha` (default 0.2) for negative inputs.
pub fn eval_leaky_relu(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let alpha = ctx.params().alpha.unwrap_or(0.2) as f64;
    unary(ctx, |v| if v >= 0.0 { v } else { alpha * v })
}

/// Sigmoid: 1 / (1 + exp(-x))
pub fn eval_logistic(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    unary(ctx, |v| 1.0 / (1.0 + (-v).exp()))
}

pub fn eval_tanh(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    unary(ctx, f64::tanh)
}

pub fn eval_elu(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    unary(ctx, |v| if v >= 0.0 { v } else { v.exp() - 1.0 })
}

/// HardSwish: x * relu6(x + 3) / 6
pub fn eval_hard_swish(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    unary(ctx, |v| v * (v + 3.0).clamp(0.0, 6.0) / 6.0)
}

/// Alpha broadcasts against the input; output mirrors the input.
pub fn prepare_prelu(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(2, 1)?;
    let x = ctx.input(0)?;
    let alpha = ctx.input(1)?;
    match broadcast_shapes(x.shape(), alpha.shape()) {
        Some(shape) if shape.as_slice() == x.shape() => ctx.set_output_shape(0, shape.into_vec()),
        _ => Err(ctx.invalid(format!(
            "alpha shape {:?} does not broadcast to input {:?}",
            alpha.shape(),
            x.shape()
        ))),
    }
}

pub fn eval_prelu(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let x = ctx.input(0)?;
    let alpha = ctx.input(1)?;
    let out = ctx.output(0)?;
    let shape = out.shape();
    for i in 0..out.numel() {
        let v = x.real(i);
        let a = alpha.real(broadcast_index(i, shape, alpha.shape()));
        out.set_real(i, if v >= 0.0 { v } else { v * a });
    }
    Ok(())
}

pub fn prepare_softmax(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    prepare_same_shape(ctx)?;
    if ctx.input(0)?.rank() == 0 {
        return Err(ctx.invalid("softmax needs rank >= 1"));
    }
    Ok(())
}

/// Row-wise softmax over the last axis, numerically stable, scaled by `beta`.
pub fn eval_softmax(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    softmax_rows(ctx, false)
}

pub fn eval_log_softmax(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    softmax_rows(ctx, true)
}

fn softmax_rows(ctx: &mut EvalContext<'_>, log: bool) -> Result<(), ExecutionError> {
    let beta = ctx.params().beta.unwrap_or(1.0) as f64;
    let x = ctx.input(0)?;
    let out = ctx.output(0)?;
    let dim = x.shape().last().copied().unwrap_or(1);
    for row in 0..x.numel() / dim {
        let base = row * dim;
        let max = (0..dim).map(|j| x.real(base + j)).fold(f64::NEG_INFINITY, f64::max);
        let sum: f64 = (0..dim).map(|j| (beta * (x.real(base + j) - max)).exp()).sum();
        for j in 0..dim {
            let z = beta * (x.real(base + j) - max);
            let v = if log { z - sum.ln() } else { z.exp() / sum };
            out.set_real(base + j, v);
        }
    }
    Ok(())
}

/// x / max(||x||, 1e-6) over the last axis.
pub fn eval_l2_normalization(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    const EPSILON: f64 = 1e-6;
    let x = ctx.input(0)?;
    let out = ctx.output(0)?;
    let dim = x.shape().last().copied().unwrap_or(1);
    for row in 0..x.numel() / dim {
        let base = row * dim;
        let norm = (0..dim).map(|j| x.real(base + j).powi(2)).sum::<f64>().sqrt().max(EPSILON);
        for j in 0..dim {
            out.set_real(base + j, x.real(base + j) / norm);
        }
    }
    Ok(())
}
