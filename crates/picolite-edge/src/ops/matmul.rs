//! Fully-connected and batched matrix multiplication.

use super::{broadcast_index, broadcast_shapes, EvalContext, PrepareContext, TensorInfo};
use crate::error::{ExecutionError, ShapeError};
use crate::tensor::{numel, DType, Quantization};

/// input `[.., K]`, weights `[N, K]`, optional bias `[N]`.
pub fn prepare_fully_connected(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    let n_in = ctx.num_inputs();
    if !(2..=3).contains(&n_in) || ctx.num_outputs() != 1 {
        return Err(ctx.invalid("expected input, weights, optional bias and one output"));
    }
    let x = ctx.input(0)?;
    let w = ctx.input(1)?;
    if w.rank() != 2 {
        return Err(ctx.invalid(format!("weights must be rank 2, got {:?}", w.shape())));
    }
    let (units, depth) = (w.shape()[0], w.shape()[1]);
    if depth == 0 || x.numel() % depth != 0 {
        return Err(ctx.invalid(format!("input {:?} not divisible by depth {}", x.shape(), depth)));
    }
    if let Some(b) = ctx.optional_input(2) {
        if b.numel() != units {
            return Err(ctx.invalid(format!("bias has {} elements, expected {}", b.numel(), units)));
        }
        let out = ctx.output(0)?;
        if integer_path(operand(&x), operand(&w), Some(b.dtype()), out.dtype()) {
            check_bias_scale(ctx, &x, &w, &b, units)?;
        }
    }
    let shape = if ctx.params().keep_num_dims {
        if x.shape().last() != Some(&depth) {
            return Err(ctx.invalid("keep_num_dims requires the last input dimension to equal depth"));
        }
        let mut s = x.shape().to_vec();
        if let Some(last) = s.last_mut() {
            *last = units;
        }
        s
    } else {
        vec![x.numel() / depth, units]
    };
    ctx.set_output_shape(0, shape)
}

fn operand<'a>(t: &TensorInfo<'a>) -> (DType, Option<&'a Quantization>) {
    (t.dtype(), t.quantization())
}

/// Int8 activations and weights with int32 bias accumulate exactly in
/// integers before a single rescale.
fn integer_path(
    (x_type, xq): (DType, Option<&Quantization>),
    (w_type, wq): (DType, Option<&Quantization>),
    bias: Option<DType>,
    out: DType,
) -> bool {
    let per_tensor_input = xq.map_or(false, |q| !q.is_per_channel());
    let weights_ok = wq.map_or(false, |q| !q.is_per_channel() || q.quantized_dimension == 0);
    x_type == DType::Int8
        && w_type == DType::Int8
        && out == DType::Int8
        && per_tensor_input
        && weights_ok
        && bias.map_or(true, |b| b == DType::Int32)
}

/// The integer path adds the raw int32 bias to the accumulator, so a
/// quantized bias must use zero point 0 and scale `x_scale * w_scale[n]`.
/// An unquantized int32 bias is taken in accumulator units.
fn check_bias_scale(
    ctx: &PrepareContext<'_>,
    x: &TensorInfo<'_>,
    w: &TensorInfo<'_>,
    bias: &TensorInfo<'_>,
    units: usize,
) -> Result<(), ShapeError> {
    let (Some(xq), Some(wq), Some(bq)) = (x.quantization(), w.quantization(), bias.quantization()) else {
        return Ok(());
    };
    let (x_scale, _) = xq.params(0);
    for n in 0..units {
        let expected = x_scale * wq.params(n).0;
        let (scale, zp) = bq.params(n);
        if zp != 0.0 || (scale - expected).abs() > expected.abs() * 1e-5 {
            return Err(ctx.invalid(format!(
                "bias channel {} has scale {} and zero point {}, expected scale {} and zero point 0",
                n, scale, zp, expected
            )));
        }
    }
    Ok(())
}

pub fn eval_fully_connected(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let x = ctx.input(0)?;
    let w = ctx.input(1)?;
    let bias = ctx.optional_input(2);
    let act = ctx.params().activation;
    let (units, depth) = (w.shape()[0], w.shape()[1]);
    let batches = x.numel() / depth;
    let out = ctx.output(0)?;

    let integer = integer_path(
        (x.dtype(), x.quantization()),
        (w.dtype(), w.quantization()),
        bias.as_ref().map(|b| b.dtype()),
        out.dtype(),
    );
    if integer && out.quantization().is_some() {
        let (x_scale, x_zp) = x.quantization().map_or((1.0, 0.0), |q| q.params(0));
        let wq = w.quantization();
        let xb = x.bytes();
        let wb = w.bytes();
        for b in 0..batches {
            for n in 0..units {
                let (w_scale, w_zp) = wq.map_or((1.0, 0.0), |q| q.params(n));
                let (x_zp, w_zp) = (x_zp as i64, w_zp as i64);
                let mut acc: i64 = 0;
                for k in 0..depth {
                    let xv = xb[b * depth + k] as i8 as i64 - x_zp;
                    let wv = wb[n * depth + k] as i8 as i64 - w_zp;
                    acc += xv * wv;
                }
                if let Some(bias) = &bias {
                    acc += bias.index(n);
                }
                let real = acc as f64 * x_scale * w_scale;
                out.set_real(b * units + n, act.apply(real));
            }
        }
        return Ok(());
    }

    for b in 0..batches {
        for n in 0..units {
            let mut acc = bias.as_ref().map_or(0.0, |t| t.real(n));
            for k in 0..depth {
                acc += x.real(b * depth + k) * w.real(n * depth + k);
            }
            out.set_real(b * units + n, act.apply(acc));
        }
    }
    Ok(())
}

/// `(rows, cols)` of the last two dimensions after the optional adjoint.
fn matrix_dims(shape: &[usize], adjoint: bool) -> (usize, usize) {
    let r = shape.len();
    let (a, b) = (shape[r - 2], shape[r - 1]);
    if adjoint { (b, a) } else { (a, b) }
}

pub fn prepare_batch_matmul(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(2, 1)?;
    let x = ctx.input(0)?;
    let y = ctx.input(1)?;
    if x.rank() < 2 || y.rank() < 2 {
        return Err(ctx.invalid("operands must have rank >= 2"));
    }
    let params = ctx.params();
    let (m, kx) = matrix_dims(x.shape(), params.adj_x);
    let (ky, n) = matrix_dims(y.shape(), params.adj_y);
    if kx != ky {
        return Err(ctx.invalid(format!("inner dimensions differ: {} vs {}", kx, ky)));
    }
    let bx = &x.shape()[..x.rank() - 2];
    let by = &y.shape()[..y.rank() - 2];
    let mut shape = broadcast_shapes(bx, by)
        .ok_or_else(|| ctx.invalid(format!("batch dims {:?} and {:?} do not broadcast", bx, by)))?;
    shape.extend([m, n]);
    ctx.set_output_shape(0, shape.into_vec())
}

pub fn eval_batch_matmul(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let x = ctx.input(0)?;
    let y = ctx.input(1)?;
    let params = ctx.params();
    let (m, k) = matrix_dims(x.shape(), params.adj_x);
    let (_, n) = matrix_dims(y.shape(), params.adj_y);
    let bx = &x.shape()[..x.rank() - 2];
    let by = &y.shape()[..y.rank() - 2];
    let out = ctx.output(0)?;
    let out_batch = &out.shape()[..out.shape().len() - 2];

    let x_at = |base: usize, i: usize, j: usize| {
        if params.adj_x { x.real(base + j * m + i) } else { x.real(base + i * k + j) }
    };
    let y_at = |base: usize, i: usize, j: usize| {
        if params.adj_y { y.real(base + j * k + i) } else { y.real(base + i * n + j) }
    };

    for b in 0..numel(out_batch) {
        let xb = broadcast_index(b, out_batch, bx) * m * k;
        let yb = broadcast_index(b, out_batch, by) * k * n;
        for i in 0..m {
            for j in 0..n {
                let acc: f64 = (0..k).map(|t| x_at(xb, i, t) * y_at(yb, t, j)).sum();
                out.set_real(b * m * n + i * n + j, acc);
            }
        }
    }
    Ok(())
}
