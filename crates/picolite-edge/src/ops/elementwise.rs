//! Element-wise arithmetic, comparison and logical kernels with
//! numpy-style broadcasting.

use super::{
    broadcast_index, broadcast_shapes, prepare_same_shape, EvalContext, PrepareContext, Shape, MAX_NODE_INPUTS,
};
use crate::error::{ExecutionError, ShapeError};
use crate::tensor::{DType, TensorView};

/// Two operands broadcast into one output of the same element type.
pub fn prepare_binary(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(2, 1)?;
    let a = ctx.input(0)?;
    let b = ctx.input(1)?;
    if a.dtype() != b.dtype() || a.dtype() != ctx.output(0)?.dtype() {
        return Err(ctx.invalid(format!(
            "operand types differ: {} and {} into {}",
            a.dtype(),
            b.dtype(),
            ctx.output(0)?.dtype()
        )));
    }
    let shape = broadcast_shapes(a.shape(), b.shape()).ok_or_else(|| {
        ctx.invalid(format!("shapes {:?} and {:?} do not broadcast", a.shape(), b.shape()))
    })?;
    ctx.set_output_shape(0, shape.into_vec())
}

/// Comparison: broadcast operands of one type into a bool output.
pub fn prepare_compare(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(2, 1)?;
    let a = ctx.input(0)?;
    let b = ctx.input(1)?;
    if a.dtype() != b.dtype() {
        return Err(ctx.invalid(format!("operand types differ: {} and {}", a.dtype(), b.dtype())));
    }
    if ctx.output(0)?.dtype() != DType::Bool {
        return Err(ctx.invalid("comparison output must be bool"));
    }
    let shape = broadcast_shapes(a.shape(), b.shape()).ok_or_else(|| {
        ctx.invalid(format!("shapes {:?} and {:?} do not broadcast", a.shape(), b.shape()))
    })?;
    ctx.set_output_shape(0, shape.into_vec())
}

/// LogicalNot (one input) or LogicalAnd/LogicalOr (two inputs), all bool.
pub fn prepare_logical(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    let n = ctx.num_inputs();
    if !(1..=2).contains(&n) || ctx.num_outputs() != 1 {
        return Err(ctx.invalid("expected one or two inputs and one output"));
    }
    let mut shape = Shape::new();
    for i in 0..n {
        let t = ctx.input(i)?;
        if t.dtype() != DType::Bool {
            return Err(ctx.invalid(format!("input {} must be bool", i)));
        }
        shape = broadcast_shapes(&shape, t.shape())
            .ok_or_else(|| ctx.invalid("input shapes do not broadcast"))?;
    }
    if ctx.output(0)?.dtype() != DType::Bool {
        return Err(ctx.invalid("output must be bool"));
    }
    ctx.set_output_shape(0, shape.into_vec())
}

/// Same shape and element type in and out.
pub fn prepare_unary(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    prepare_same_shape(ctx)?;
    let (i, o) = (ctx.input(0)?.dtype(), ctx.output(0)?.dtype());
    if i != o {
        return Err(ctx.invalid(format!("input type {} but output type {}", i, o)));
    }
    Ok(())
}

pub fn prepare_select(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(3, 1)?;
    let cond = ctx.input(0)?;
    let x = ctx.input(1)?;
    let y = ctx.input(2)?;
    if cond.dtype() != DType::Bool {
        return Err(ctx.invalid("condition must be bool"));
    }
    if x.dtype() != y.dtype() {
        return Err(ctx.invalid("value operands must share a type"));
    }
    let shape = broadcast_shapes(cond.shape(), x.shape())
        .and_then(|s| broadcast_shapes(&s, y.shape()))
        .ok_or_else(|| ctx.invalid("operand shapes do not broadcast"))?;
    ctx.set_output_shape(0, shape.into_vec())
}

pub fn prepare_add_n(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    if ctx.num_inputs() == 0 || ctx.num_outputs() != 1 {
        return Err(ctx.invalid("expected at least one input and one output"));
    }
    let first = ctx.input(0)?;
    for i in 1..ctx.num_inputs() {
        let t = ctx.input(i)?;
        if t.shape() != first.shape() || t.dtype() != first.dtype() {
            return Err(ctx.invalid(format!("input {} differs from input 0", i)));
        }
    }
    ctx.set_output_shape(0, first.shape().to_vec())
}

#[inline]
fn operand(t: &TensorView<'_>, i: usize, out_shape: &[usize], same: bool) -> f64 {
    if same {
        t.real(i)
    } else {
        t.real(broadcast_index(i, out_shape, t.shape()))
    }
}

/// Applies `f` over broadcast operands, then the fused activation.
/// `f` returns `None` when a numeric precondition fails.
fn binary<F>(ctx: &mut EvalContext<'_>, f: F) -> Result<(), ExecutionError>
where
    F: Fn(f64, f64, bool) -> Option<f64>,
{
    let a = ctx.input(0)?;
    let b = ctx.input(1)?;
    let act = ctx.params().activation;
    let out = ctx.output(0)?;
    let shape = out.shape();
    let integral = out.dtype().is_integer() && out.quantization().is_none();
    let (sa, sb) = (a.shape() == shape, b.shape() == shape);
    let mut failed = false;
    for i in 0..out.numel() {
        let x = operand(&a, i, shape, sa);
        let y = operand(&b, i, shape, sb);
        match f(x, y, integral) {
            Some(v) => out.set_real(i, act.apply(v)),
            None => {
                failed = true;
                break;
            }
        }
    }
    if failed {
        return Err(ctx.fail("integer division by zero"));
    }
    Ok(())
}

fn compare(ctx: &mut EvalContext<'_>, f: fn(f64, f64) -> bool) -> Result<(), ExecutionError> {
    let a = ctx.input(0)?;
    let b = ctx.input(1)?;
    let out = ctx.output(0)?;
    let shape = out.shape();
    let (sa, sb) = (a.shape() == shape, b.shape() == shape);
    for i in 0..out.numel() {
        let r = f(operand(&a, i, shape, sa), operand(&b, i, shape, sb));
        out.set_value(i, r as u8 as f64);
    }
    Ok(())
}

/// Applies `f` to every element; shared by the activation kernels.
pub(crate) fn unary<F>(ctx: &mut EvalContext<'_>, f: F) -> Result<(), ExecutionError>
where
    F: Fn(f64) -> f64,
{
    let x = ctx.input(0)?;
    let out = ctx.output(0)?;
    for i in 0..out.numel() {
        out.set_real(i, f(x.real(i)));
    }
    Ok(())
}

pub fn eval_add(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    binary(ctx, |x, y, _| Some(x + y))
}

pub fn eval_sub(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    binary(ctx, |x, y, _| Some(x - y))
}

pub fn eval_mul(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    binary(ctx, |x, y, _| Some(x * y))
}

/// Integer tensors truncate toward zero and reject a zero divisor.
pub fn eval_div(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    binary(ctx, |x, y, integral| {
        if integral {
            (y != 0.0).then(|| (x / y).trunc())
        } else {
            Some(x / y)
        }
    })
}

pub fn eval_floor_div(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    binary(ctx, |x, y, integral| {
        if integral && y == 0.0 {
            None
        } else {
            Some((x / y).floor())
        }
    })
}

/// Result takes the sign of the divisor.
pub fn eval_floor_mod(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    binary(ctx, |x, y, integral| {
        if integral && y == 0.0 {
            return None;
        }
        let r = x % y;
        Some(if r != 0.0 && (r < 0.0) != (y < 0.0) { r + y } else { r })
    })
}

pub fn eval_maximum(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    binary(ctx, |x, y, _| Some(x.max(y)))
}

pub fn eval_minimum(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    binary(ctx, |x, y, _| Some(x.min(y)))
}

pub fn eval_squared_difference(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    binary(ctx, |x, y, _| Some((x - y) * (x - y)))
}

pub fn eval_equal(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    compare(ctx, |x, y| x == y)
}

pub fn eval_not_equal(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    compare(ctx, |x, y| x != y)
}

pub fn eval_greater(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    compare(ctx, |x, y| x > y)
}

pub fn eval_greater_equal(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    compare(ctx, |x, y| x >= y)
}

pub fn eval_less(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    compare(ctx, |x, y| x < y)
}

pub fn eval_less_equal(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    compare(ctx, |x, y| x <= y)
}

pub fn eval_logical_and(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    compare(ctx, |x, y| x != 0.0 && y != 0.0)
}

pub fn eval_logical_or(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    compare(ctx, |x, y| x != 0.0 || y != 0.0)
}

pub fn eval_logical_not(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let x = ctx.input(0)?;
    let out = ctx.output(0)?;
    for i in 0..out.numel() {
        out.set_value(i, (x.value(i) == 0.0) as u8 as f64);
    }
    Ok(())
}

pub fn eval_select(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let cond = ctx.input(0)?;
    let x = ctx.input(1)?;
    let y = ctx.input(2)?;
    let out = ctx.output(0)?;
    let shape = out.shape();
    for i in 0..out.numel() {
        let pick = cond.value(broadcast_index(i, shape, cond.shape())) != 0.0;
        let src = if pick { &x } else { &y };
        out.set_real(i, src.real(broadcast_index(i, shape, src.shape())));
    }
    Ok(())
}

pub fn eval_add_n(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let n = ctx.num_inputs();
    let mut inputs = smallvec::SmallVec::<[TensorView<'_>; MAX_NODE_INPUTS]>::new();
    for i in 0..n {
        inputs.push(ctx.input(i)?);
    }
    let out = ctx.output(0)?;
    for i in 0..out.numel() {
        let sum: f64 = inputs.iter().map(|t| t.real(i)).sum();
        out.set_real(i, sum);
    }
    Ok(())
}

pub fn eval_abs(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    unary(ctx, f64::abs)
}

pub fn eval_neg(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    unary(ctx, |v| -v)
}

pub fn eval_ceil(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    unary(ctx, f64::ceil)
}

pub fn eval_floor(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    unary(ctx, f64::floor)
}

/// Rounds half to even.
pub fn eval_round(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    unary(ctx, round_half_even)
}

fn round_half_even(v: f64) -> f64 {
    let floor = v.floor();
    let diff = v - floor;
    if diff < 0.5 || (diff == 0.5 && floor % 2.0 == 0.0) {
        floor
    } else {
        floor + 1.0
    }
}

pub fn eval_sqrt(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    unary(ctx, f64::sqrt)
}

pub fn eval_rsqrt(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    unary(ctx, |v| 1.0 / v.sqrt())
}

pub fn eval_square(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    unary(ctx, |v| v * v)
}

pub fn eval_exp(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    unary(ctx, f64::exp)
}

pub fn eval_log(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    unary(ctx, f64::ln)
}

pub fn eval_sin(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    unary(ctx, f64::sin)
}

pub fn eval_cos(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    unary(ctx, f64::cos)
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::ops::{Activation, OpParams};
    use crate::registry::OpKind;
    use crate::tensor::{Quantization, TensorDesc};

    #[test]
    fn test_add_broadcast() {
        let a = f32_tensor(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = f32_tensor(&[3], &[10.0, 20.0, 30.0]);
        let out = run(OpKind::Add, &OpParams::default(), &[a, b], &[f32_out(&[2, 3])]).unwrap();
        assert_eq!(out[0], vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn test_add_fused_relu() {
        let a = f32_tensor(&[3], &[-5.0, 1.0, 2.0]);
        let b = f32_tensor(&[3], &[1.0, 1.0, 1.0]);
        let params = OpParams::default().with_activation(Activation::Relu);
        let out = run(OpKind::Add, &params, &[a, b], &[f32_out(&[3])]).unwrap();
        assert_eq!(out[0], vec![0.0, 2.0, 3.0]);
    }

    #[test]
    fn test_sub_shape_mismatch() {
        let a = f32_tensor(&[2], &[1.0, 2.0]);
        let b = f32_tensor(&[3], &[1.0, 2.0, 3.0]);
        let err = run(OpKind::Sub, &OpParams::default(), &[a, b], &[f32_out(&[3])]).unwrap_err();
        assert!(err.contains("do not broadcast"));
    }

    #[test]
    fn test_declared_shape_checked() {
        let a = f32_tensor(&[2], &[1.0, 2.0]);
        let b = f32_tensor(&[2], &[1.0, 2.0]);
        assert!(run(OpKind::Mul, &OpParams::default(), &[a, b], &[f32_out(&[4])]).is_err());
    }

    #[test]
    fn test_int_div_by_zero_fails() {
        let a = i32_tensor(&[2], &[7, 8]);
        let b = i32_tensor(&[2], &[2, 0]);
        let out = TensorDesc::new("o", DType::Int32, &[2]);
        let err = run(OpKind::Div, &OpParams::default(), &[a, b], &[out]).unwrap_err();
        assert!(err.contains("division by zero"));
    }

    #[test]
    fn test_int_div_truncates() {
        let a = i32_tensor(&[2], &[7, -7]);
        let b = i32_tensor(&[2], &[2, 2]);
        let out = TensorDesc::new("o", DType::Int32, &[2]);
        let r = run(OpKind::Div, &OpParams::default(), &[a, b], &[out]).unwrap();
        assert_eq!(r[0], vec![3.0, -3.0]);
    }

    #[test]
    fn test_float_div_by_zero_is_inf() {
        let a = f32_tensor(&[1], &[1.0]);
        let b = f32_tensor(&[1], &[0.0]);
        let r = run(OpKind::Div, &OpParams::default(), &[a, b], &[f32_out(&[1])]).unwrap();
        assert!(r[0][0].is_infinite());
    }

    #[test]
    fn test_floor_div_and_mod() {
        let a = i32_tensor(&[2], &[-7, 7]);
        let b = i32_tensor(&[2], &[2, -2]);
        let out = TensorDesc::new("o", DType::Int32, &[2]);
        let d = run(OpKind::FloorDiv, &OpParams::default(), &[a.clone(), b.clone()], &[out.clone()]).unwrap();
        assert_eq!(d[0], vec![-4.0, -4.0]);
        let m = run(OpKind::FloorMod, &OpParams::default(), &[a, b], &[out]).unwrap();
        assert_eq!(m[0], vec![1.0, -1.0]);
    }

    #[test]
    fn test_quantized_add() {
        let q = Quantization::per_tensor(0.5, 0);
        let a = typed_tensor(TensorDesc::new("a", DType::Int8, &[2]).with_quant(q.clone()), &[1.0, 2.0]);
        let b = typed_tensor(TensorDesc::new("b", DType::Int8, &[2]).with_quant(q.clone()), &[0.5, 60.0]);
        let out = TensorDesc::new("o", DType::Int8, &[2]).with_quant(q);
        let r = run(OpKind::Add, &OpParams::default(), &[a, b], &[out]).unwrap();
        // 62.0 / 0.5 = 124 fits; 1.5 exact
        assert_eq!(r[0], vec![1.5, 62.0]);
    }

    #[test]
    fn test_compare_outputs_bool() {
        let a = f32_tensor(&[3], &[1.0, 2.0, 3.0]);
        let b = f32_tensor(&[1], &[2.0]);
        let out = TensorDesc::new("o", DType::Bool, &[3]);
        let r = run_raw(OpKind::Greater, &OpParams::default(), &[a, b], &[out]).unwrap();
        assert_eq!(r[0], vec![0, 0, 1]);
    }

    #[test]
    fn test_compare_rejects_non_bool_output() {
        let a = f32_tensor(&[1], &[1.0]);
        let b = f32_tensor(&[1], &[2.0]);
        assert!(run(OpKind::Less, &OpParams::default(), &[a, b], &[f32_out(&[1])]).is_err());
    }

    #[test]
    fn test_logical_ops() {
        let bools = |v: &[u8]| (TensorDesc::new("b", DType::Bool, &[v.len()]), v.to_vec());
        let out = TensorDesc::new("o", DType::Bool, &[4]);
        let p = OpParams::default();
        let and = run_raw(OpKind::LogicalAnd, &p, &[bools(&[0, 1, 0, 1]), bools(&[0, 0, 1, 1])], &[out.clone()]).unwrap();
        assert_eq!(and[0], vec![0, 0, 0, 1]);
        let or = run_raw(OpKind::LogicalOr, &p, &[bools(&[0, 1, 0, 1]), bools(&[0, 0, 1, 1])], &[out.clone()]).unwrap();
        assert_eq!(or[0], vec![0, 1, 1, 1]);
        let not = run_raw(OpKind::LogicalNot, &p, &[bools(&[0, 1, 0, 1])], &[out]).unwrap();
        assert_eq!(not[0], vec![1, 0, 1, 0]);
    }

    #[test]
    fn test_select_v2() {
        let cond = (TensorDesc::new("c", DType::Bool, &[2, 1]), vec![1u8, 0]);
        let x = f32_tensor(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let y = f32_tensor(&[], &[9.0]);
        let r = run(OpKind::SelectV2, &OpParams::default(), &[cond, x, y], &[f32_out(&[2, 2])]).unwrap();
        assert_eq!(r[0], vec![1.0, 2.0, 9.0, 9.0]);
    }

    #[test]
    fn test_add_n() {
        let a = f32_tensor(&[2], &[1.0, 2.0]);
        let r = run(OpKind::AddN, &OpParams::default(), &[a.clone(), a.clone(), a], &[f32_out(&[2])]).unwrap();
        assert_eq!(r[0], vec![3.0, 6.0]);
    }

    #[test]
    fn test_unary_math() {
        let x = f32_tensor(&[4], &[-1.5, 0.5, 2.5, 4.0]);
        let p = OpParams::default();
        assert_eq!(run(OpKind::Abs, &p, &[x.clone()], &[f32_out(&[4])]).unwrap()[0], vec![1.5, 0.5, 2.5, 4.0]);
        assert_eq!(run(OpKind::Round, &p, &[x.clone()], &[f32_out(&[4])]).unwrap()[0], vec![-2.0, 0.0, 2.0, 4.0]);
        assert_eq!(run(OpKind::Floor, &p, &[x.clone()], &[f32_out(&[4])]).unwrap()[0], vec![-2.0, 0.0, 2.0, 4.0]);
        assert_eq!(run(OpKind::Square, &p, &[x], &[f32_out(&[4])]).unwrap()[0], vec![2.25, 0.25, 6.25, 16.0]);
        let y = f32_tensor(&[2], &[4.0, 16.0]);
        assert_eq!(run(OpKind::Rsqrt, &p, &[y], &[f32_out(&[2])]).unwrap()[0], vec![0.5, 0.25]);
    }

    #[test]
    fn test_unary_rejects_type_change() {
        let x = f32_tensor(&[2], &[1.0, 2.0]);
        let out = TensorDesc::new("o", DType::Int32, &[2]);
        assert!(run(OpKind::Neg, &OpParams::default(), &[x], &[out]).is_err());
    }
}
