//! Reductions, arg-reductions and cumulative sum.

use super::{normalize_axis, strides, unravel, EvalContext, PrepareContext};
use crate::error::{ExecutionError, ShapeError};
use crate::tensor::{numel, DType, MAX_RANK};

/// Marks reduced dimensions; empty `axes` reduces everything.
fn reduced_dims(axes: &[i32], rank: usize) -> Option<[bool; MAX_RANK]> {
    let mut mask = [false; MAX_RANK];
    if axes.is_empty() {
        mask[..rank].iter_mut().for_each(|m| *m = true);
    }
    for &a in axes {
        mask[normalize_axis(a as i64, rank)?] = true;
    }
    Some(mask)
}

/// Mean, Sum and ReduceMax. Accumulates in `f64` scratch, one slot per
/// output element.
pub fn prepare_reduce(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(1, 1)?;
    let x = ctx.input(0)?;
    let params = ctx.params();
    let mask = reduced_dims(&params.axes, x.rank())
        .ok_or_else(|| ctx.invalid(format!("axes {:?} out of range", params.axes)))?;
    let mut shape = Vec::with_capacity(x.rank());
    for (d, &n) in x.shape().iter().enumerate() {
        if !mask[d] {
            shape.push(n);
        } else if params.keep_dims {
            shape.push(1);
        }
    }
    let scratch = numel(&shape)
        .checked_mul(8)
        .ok_or_else(|| ctx.invalid(format!("scratch for {:?} overflows", shape)))?;
    ctx.request_scratch(scratch);
    ctx.set_output_shape(0, shape)
}

#[inline]
fn acc_get(scratch: &[u8], i: usize) -> f64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&scratch[i * 8..i * 8 + 8]);
    f64::from_le_bytes(b)
}

#[inline]
fn acc_set(scratch: &mut [u8], i: usize, v: f64) {
    scratch[i * 8..i * 8 + 8].copy_from_slice(&v.to_le_bytes());
}

#[derive(Clone, Copy)]
enum Reduction {
    Sum,
    Mean,
    Max,
}

fn reduce(ctx: &mut EvalContext<'_>, kind: Reduction) -> Result<(), ExecutionError> {
    let x = ctx.input(0)?;
    let mask = reduced_dims(&ctx.params().axes, x.rank()).ok_or_else(|| ctx.fail("axes out of range"))?;
    if ctx.scratch_len() < ctx.output(0)?.numel() * 8 {
        return Err(ctx.fail("scratch buffer too small"));
    }
    let (out, scratch) = ctx.output_and_scratch(0)?;
    let n_out = out.numel();
    let init = match kind {
        Reduction::Max => f64::NEG_INFINITY,
        _ => 0.0,
    };
    for o in 0..n_out {
        acc_set(scratch, o, init);
    }

    let in_shape = x.shape();
    let mut kept = [1usize; MAX_RANK];
    for d in 0..in_shape.len() {
        if !mask[d] {
            kept[d] = in_shape[d];
        }
    }
    let kept_strides = strides(&kept[..in_shape.len()]);
    let mut coords = [0usize; MAX_RANK];
    for i in 0..x.numel() {
        unravel(i, in_shape, &mut coords);
        let o: usize = (0..in_shape.len()).filter(|&d| !mask[d]).map(|d| coords[d] * kept_strides[d]).sum();
        let v = x.real(i);
        let acc = acc_get(scratch, o);
        acc_set(scratch, o, if let Reduction::Max = kind { acc.max(v) } else { acc + v });
    }

    let count = (x.numel() / n_out.max(1)) as f64;
    for o in 0..n_out {
        let acc = acc_get(scratch, o);
        out.set_real(o, if let Reduction::Mean = kind { acc / count } else { acc });
    }
    Ok(())
}

pub fn eval_mean(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    reduce(ctx, Reduction::Mean)
}

pub fn eval_sum(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    reduce(ctx, Reduction::Sum)
}

pub fn eval_reduce_max(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    reduce(ctx, Reduction::Max)
}

/// ArgMax/ArgMin drop `axis`; the output holds int32 or int64 indices.
pub fn prepare_arg(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(1, 1)?;
    let x = ctx.input(0)?;
    let axis = ctx.params().axis.ok_or_else(|| ctx.invalid("missing axis"))?;
    let d = normalize_axis(axis as i64, x.rank())
        .ok_or_else(|| ctx.invalid(format!("axis {} out of range", axis)))?;
    if !matches!(ctx.output(0)?.dtype(), DType::Int32 | DType::Int64) {
        return Err(ctx.invalid("output must be int32 or int64"));
    }
    let mut shape = x.shape().to_vec();
    shape.remove(d);
    ctx.set_output_shape(0, shape)
}

/// Index of the first element preferred by `better` along the axis.
fn arg_reduce(ctx: &mut EvalContext<'_>, better: fn(f64, f64) -> bool) -> Result<(), ExecutionError> {
    let x = ctx.input(0)?;
    let axis = ctx.params().axis.unwrap_or(0);
    let d = normalize_axis(axis as i64, x.rank()).ok_or_else(|| ctx.fail("axis out of range"))?;
    let dim = x.shape()[d];
    let inner = numel(&x.shape()[d + 1..]);
    let outer = numel(&x.shape()[..d]);
    let out = ctx.output(0)?;
    for o in 0..outer {
        for k in 0..inner {
            let base = o * dim * inner + k;
            let mut best = 0;
            let mut best_v = x.real(base);
            for j in 1..dim {
                let v = x.real(base + j * inner);
                if better(v, best_v) {
                    best = j;
                    best_v = v;
                }
            }
            out.set_index(o * inner + k, best as i64);
        }
    }
    Ok(())
}

pub fn eval_arg_max(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    arg_reduce(ctx, |v, best| v > best)
}

pub fn eval_arg_min(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    arg_reduce(ctx, |v, best| v < best)
}

pub fn prepare_cum_sum(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(1, 1)?;
    let x = ctx.input(0)?;
    let axis = ctx.params().axis.unwrap_or(0);
    if normalize_axis(axis as i64, x.rank()).is_none() {
        return Err(ctx.invalid(format!("axis {} out of range", axis)));
    }
    ctx.set_output_shape(0, x.shape().to_vec())
}

pub fn eval_cum_sum(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let x = ctx.input(0)?;
    let params = ctx.params();
    let d = normalize_axis(params.axis.unwrap_or(0) as i64, x.rank()).ok_or_else(|| ctx.fail("axis out of range"))?;
    let dim = x.shape()[d];
    let inner = numel(&x.shape()[d + 1..]);
    let outer = numel(&x.shape()[..d]);
    let out = ctx.output(0)?;
    for o in 0..outer {
        for k in 0..inner {
            let base = o * dim * inner + k;
            let mut acc = 0.0;
            for step in 0..dim {
                let j = if params.reverse { dim - 1 - step } else { step };
                let idx = base + j * inner;
                let v = x.real(idx);
                if params.exclusive {
                    out.set_real(idx, acc);
                    acc += v;
                } else {
                    acc += v;
                    out.set_real(idx, acc);
                }
            }
        }
    }
    Ok(())
}
