//! Shape manipulation and data movement kernels.
//!
//! Shape arguments (target shapes, permutations, slice bounds, paddings)
//! are read from the node's [`OpParams`](super::OpParams), never from
//! tensor contents, so every output shape is known at planning time.

use smallvec::SmallVec;

use super::{
    broadcast_index, broadcast_shapes, normalize_axis, same_repr, strides, transfer, unravel,
    EvalContext, MirrorMode, OpParams, PrepareContext, MAX_NODE_INPUTS,
};
use crate::error::{ExecutionError, ShapeError};
use crate::tensor::{exact_integers, numel, DType, TensorView, TensorViewMut, MAX_RANK};

/// Resolves a target shape with at most one `-1` against `count` elements.
pub(crate) fn resolve_shape(spec: &[i64], count: usize) -> Option<Vec<usize>> {
    let mut infer = None;
    let mut known = 1usize;
    for (i, &d) in spec.iter().enumerate() {
        match d {
            -1 if infer.is_none() => infer = Some(i),
            d if d >= 0 => known = known.checked_mul(d as usize)?,
            _ => return None,
        }
    }
    let mut shape: Vec<usize> = spec.iter().map(|&d| d.max(0) as usize).collect();
    if let Some(i) = infer {
        if known == 0 || count % known != 0 {
            return None;
        }
        shape[i] = count / known;
    }
    Some(shape)
}

/// Output element count must equal the input's; `new_shape` wins over the
/// declared shape when present.
pub fn prepare_reshape(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(1, 1)?;
    let x = ctx.input(0)?;
    let spec = &ctx.params().new_shape;
    let target = if spec.is_empty() {
        ctx.output(0)?.shape().to_vec()
    } else {
        resolve_shape(spec, x.numel())
            .ok_or_else(|| ctx.invalid(format!("cannot reshape {:?} to {:?}", x.shape(), spec)))?
    };
    if numel(&target) != x.numel() {
        return Err(ctx.invalid(format!("cannot reshape {:?} to {:?}", x.shape(), target)));
    }
    ctx.set_output_shape(0, target)
}

pub fn prepare_squeeze(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(1, 1)?;
    let x = ctx.input(0)?;
    let axes = &ctx.params().axes;
    let mut drop = [false; MAX_RANK];
    if axes.is_empty() {
        for (d, &n) in x.shape().iter().enumerate() {
            drop[d] = n == 1;
        }
    } else {
        for &a in axes {
            let d = normalize_axis(a as i64, x.rank())
                .ok_or_else(|| ctx.invalid(format!("axis {} out of range", a)))?;
            if x.shape()[d] != 1 {
                return Err(ctx.invalid(format!("cannot squeeze dimension {} of size {}", d, x.shape()[d])));
            }
            drop[d] = true;
        }
    }
    let shape = x.shape().iter().enumerate().filter(|(d, _)| !drop[*d]).map(|(_, &n)| n).collect();
    ctx.set_output_shape(0, shape)
}

pub fn prepare_expand_dims(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(1, 1)?;
    let x = ctx.input(0)?;
    let axis = ctx.params().axis.ok_or_else(|| ctx.invalid("missing axis"))?;
    let d = normalize_axis(axis as i64, x.rank() + 1)
        .ok_or_else(|| ctx.invalid(format!("axis {} out of range", axis)))?;
    let mut shape = x.shape().to_vec();
    shape.insert(d, 1);
    ctx.set_output_shape(0, shape)
}

/// Reshape, Squeeze and ExpandDims only relabel the data.
pub fn eval_copy(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let x = ctx.input(0)?;
    ctx.output(0)?.copy_from(&x);
    Ok(())
}

pub fn prepare_shape(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(1, 1)?;
    let rank = ctx.input(0)?.rank();
    if !matches!(ctx.output(0)?.dtype(), DType::Int32 | DType::Int64) {
        return Err(ctx.invalid("output must be int32 or int64"));
    }
    ctx.set_output_shape(0, vec![rank])
}

pub fn eval_shape(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let x = ctx.input(0)?;
    let out = ctx.output(0)?;
    for (i, &d) in x.shape().iter().enumerate() {
        out.set_index(i, d as i64);
    }
    Ok(())
}

/// Empty `perm` reverses the dimensions.
fn permutation(params: &OpParams, rank: usize) -> Option<SmallVec<[usize; MAX_RANK]>> {
    if params.perm.is_empty() {
        return Some((0..rank).rev().collect());
    }
    if params.perm.len() != rank {
        return None;
    }
    let mut seen = [false; MAX_RANK];
    for &p in &params.perm {
        if p >= rank || seen[p] {
            return None;
        }
        seen[p] = true;
    }
    Some(params.perm.iter().copied().collect())
}

pub fn prepare_transpose(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(1, 1)?;
    let x = ctx.input(0)?;
    let perm = permutation(ctx.params(), x.rank())
        .ok_or_else(|| ctx.invalid(format!("invalid permutation {:?}", ctx.params().perm)))?;
    let shape = perm.iter().map(|&p| x.shape()[p]).collect();
    ctx.set_output_shape(0, shape)
}

/// Copies output element `i` from the input index chosen by `map`, or
/// writes `fill` (a real value) where `map` yields nothing.
fn remap<F>(ctx: &mut EvalContext<'_>, fill: f64, map: F) -> Result<(), ExecutionError>
where
    F: Fn(usize, &[usize]) -> Option<usize>,
{
    let x = ctx.input(0)?;
    let out = ctx.output(0)?;
    let shape = out.shape();
    let raw = same_repr(&x, out);
    let mut coords = [0usize; MAX_RANK];
    for i in 0..out.numel() {
        unravel(i, shape, &mut coords);
        match map(i, &coords[..shape.len()]) {
            Some(j) => transfer(&x, j, out, i, raw),
            None => out.set_real(i, fill),
        }
    }
    Ok(())
}

pub fn eval_transpose(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let x = ctx.input(0)?;
    let perm = permutation(ctx.params(), x.rank()).ok_or_else(|| ctx.fail("invalid permutation"))?;
    let in_strides = strides(x.shape());
    remap(ctx, 0.0, |_, c| Some(c.iter().zip(&perm).map(|(&o, &p)| o * in_strides[p]).sum()))
}

pub fn prepare_concatenation(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    if ctx.num_inputs() == 0 || ctx.num_outputs() != 1 {
        return Err(ctx.invalid("expected at least one input and one output"));
    }
    let first = ctx.input(0)?;
    let axis = ctx.params().axis.unwrap_or(0);
    let d = normalize_axis(axis as i64, first.rank())
        .ok_or_else(|| ctx.invalid(format!("axis {} out of range", axis)))?;
    let mut shape = first.shape().to_vec();
    for i in 1..ctx.num_inputs() {
        let t = ctx.input(i)?;
        let compatible = t.rank() == first.rank()
            && t.shape().iter().zip(first.shape()).enumerate().all(|(k, (a, b))| k == d || a == b);
        if !compatible {
            return Err(ctx.invalid(format!(
                "input {} shape {:?} incompatible with {:?} along axis {}",
                i,
                t.shape(),
                first.shape(),
                d
            )));
        }
        shape[d] = shape[d]
            .checked_add(t.shape()[d])
            .ok_or_else(|| ctx.invalid(format!("concatenated dimension {} overflows", d)))?;
    }
    ctx.set_output_shape(0, shape)
}

/// Interleaves `inputs` into `out` as `outer` contiguous chunks.
fn concat_into(inputs: &[TensorView<'_>], outer: usize, out: &mut TensorViewMut<'_>) {
    let out_inner = out.numel() / outer.max(1);
    let mut offset = 0;
    for t in inputs {
        let inner = t.numel() / outer.max(1);
        let raw = same_repr(t, out);
        for o in 0..outer {
            for k in 0..inner {
                transfer(t, o * inner + k, out, o * out_inner + offset + k, raw);
            }
        }
        offset += inner;
    }
}

/// Splits `x` into `outputs` along the chunking of `concat_into`.
fn split_from(x: &TensorView<'_>, outer: usize, outputs: &mut [TensorViewMut<'_>]) {
    let in_inner = x.numel() / outer.max(1);
    let mut offset = 0;
    for out in outputs.iter_mut() {
        let inner = out.numel() / outer.max(1);
        let raw = same_repr(x, out);
        for o in 0..outer {
            for k in 0..inner {
                transfer(x, o * in_inner + offset + k, out, o * inner + k, raw);
            }
        }
        offset += inner;
    }
}

fn collect_inputs<'a>(ctx: &EvalContext<'a>) -> Result<SmallVec<[TensorView<'a>; MAX_NODE_INPUTS]>, ExecutionError> {
    (0..ctx.num_inputs()).map(|i| ctx.input(i)).collect()
}

pub fn eval_concatenation(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let inputs = collect_inputs(ctx)?;
    let rank = inputs[0].rank();
    let d = normalize_axis(ctx.params().axis.unwrap_or(0) as i64, rank).ok_or_else(|| ctx.fail("bad axis"))?;
    let outer = numel(&inputs[0].shape()[..d]);
    concat_into(&inputs, outer, ctx.output(0)?);
    Ok(())
}

pub fn prepare_pack(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    if ctx.num_inputs() == 0 || ctx.num_outputs() != 1 {
        return Err(ctx.invalid("expected at least one input and one output"));
    }
    let first = ctx.input(0)?;
    for i in 1..ctx.num_inputs() {
        if ctx.input(i)?.shape() != first.shape() {
            return Err(ctx.invalid(format!("input {} shape differs from input 0", i)));
        }
    }
    let axis = ctx.params().axis.unwrap_or(0);
    let d = normalize_axis(axis as i64, first.rank() + 1)
        .ok_or_else(|| ctx.invalid(format!("axis {} out of range", axis)))?;
    let mut shape = first.shape().to_vec();
    shape.insert(d, ctx.num_inputs());
    ctx.set_output_shape(0, shape)
}

pub fn eval_pack(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let inputs = collect_inputs(ctx)?;
    let rank = inputs[0].rank() + 1;
    let d = normalize_axis(ctx.params().axis.unwrap_or(0) as i64, rank).ok_or_else(|| ctx.fail("bad axis"))?;
    let outer = numel(&inputs[0].shape()[..d]);
    concat_into(&inputs, outer, ctx.output(0)?);
    Ok(())
}

pub fn prepare_unpack(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(1, ctx.num_outputs())?;
    let x = ctx.input(0)?;
    let axis = ctx.params().axis.unwrap_or(0);
    let d = normalize_axis(axis as i64, x.rank())
        .ok_or_else(|| ctx.invalid(format!("axis {} out of range", axis)))?;
    if x.shape()[d] != ctx.num_outputs() {
        return Err(ctx.invalid(format!(
            "dimension {} has size {} but node has {} outputs",
            d,
            x.shape()[d],
            ctx.num_outputs()
        )));
    }
    let mut shape = x.shape().to_vec();
    shape.remove(d);
    for i in 0..ctx.num_outputs() {
        ctx.set_output_shape(i, shape.clone())?;
    }
    Ok(())
}

pub fn eval_unpack(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let x = ctx.input(0)?;
    let d = normalize_axis(ctx.params().axis.unwrap_or(0) as i64, x.rank()).ok_or_else(|| ctx.fail("bad axis"))?;
    let outer = numel(&x.shape()[..d]);
    split_from(&x, outer, ctx.outputs_mut());
    Ok(())
}

/// Split (even, `num_outputs` parts) or SplitV (`size_splits`, one `-1`
/// inferred) along `axis`.
pub fn prepare_split(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    let n = ctx.num_outputs();
    ctx.expect_io(1, n)?;
    let x = ctx.input(0)?;
    let axis = ctx.params().axis.unwrap_or(0);
    let d = normalize_axis(axis as i64, x.rank())
        .ok_or_else(|| ctx.invalid(format!("axis {} out of range", axis)))?;
    let dim = x.shape()[d];
    let sizes: Vec<usize> = if ctx.params().size_splits.is_empty() {
        if let Some(k) = ctx.params().num_splits {
            if k != n {
                return Err(ctx.invalid(format!("num_splits {} but {} outputs", k, n)));
            }
        }
        if n == 0 || dim % n != 0 {
            return Err(ctx.invalid(format!("dimension {} not divisible into {} parts", dim, n)));
        }
        vec![dim / n; n]
    } else {
        let spec = &ctx.params().size_splits;
        resolve_shape(spec, dim)
            .filter(|s| s.len() == n && s.iter().try_fold(0usize, |acc, &v| acc.checked_add(v)) == Some(dim))
            .ok_or_else(|| ctx.invalid(format!("size_splits {:?} do not cover {}", spec, dim)))?
    };
    for (i, s) in sizes.into_iter().enumerate() {
        let mut shape = x.shape().to_vec();
        shape[d] = s;
        ctx.set_output_shape(i, shape)?;
    }
    Ok(())
}

pub fn eval_split(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let x = ctx.input(0)?;
    let d = normalize_axis(ctx.params().axis.unwrap_or(0) as i64, x.rank()).ok_or_else(|| ctx.fail("bad axis"))?;
    let outer = numel(&x.shape()[..d]);
    split_from(&x, outer, ctx.outputs_mut());
    Ok(())
}

/// Per-dimension `(begin, len)` of a Slice; `size` of `-1` runs to the end.
fn slice_bounds(params: &OpParams, shape: &[usize]) -> Result<SmallVec<[(usize, usize); MAX_RANK]>, String> {
    if params.begin.len() != shape.len() || params.size.len() != shape.len() {
        return Err(format!("begin/size must have {} entries", shape.len()));
    }
    let mut bounds = SmallVec::new();
    for (d, &n) in shape.iter().enumerate() {
        let b = params.begin[d];
        if b < 0 || b as usize > n {
            return Err(format!("begin {} out of range for dimension {}", b, d));
        }
        let b = b as usize;
        let len = match params.size[d] {
            -1 => n - b,
            s if s >= 0 && b.checked_add(s as usize).is_some_and(|end| end <= n) => s as usize,
            s => return Err(format!("size {} out of range for dimension {}", s, d)),
        };
        bounds.push((b, len));
    }
    Ok(bounds)
}

pub fn prepare_slice(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(1, 1)?;
    let x = ctx.input(0)?;
    let bounds = slice_bounds(ctx.params(), x.shape()).map_err(|r| ctx.invalid(r))?;
    ctx.set_output_shape(0, bounds.iter().map(|&(_, len)| len).collect())
}

pub fn eval_slice(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let x = ctx.input(0)?;
    let bounds = slice_bounds(ctx.params(), x.shape()).map_err(|r| ctx.fail(r))?;
    let in_strides = strides(x.shape());
    remap(ctx, 0.0, |_, c| Some(c.iter().enumerate().map(|(d, &o)| (o + bounds[d].0) * in_strides[d]).sum()))
}

struct SliceDim {
    begin: i64,
    stride: i64,
    len: usize,
    shrink: bool,
}

fn strided_bounds(params: &OpParams, shape: &[usize]) -> Result<SmallVec<[SliceDim; MAX_RANK]>, String> {
    let rank = shape.len();
    if params.begin.len() != rank || params.end.len() != rank {
        return Err(format!("begin/end must have {} entries", rank));
    }
    if !params.strides.is_empty() && params.strides.len() != rank {
        return Err(format!("strides must have {} entries", rank));
    }
    let mut dims = SmallVec::new();
    for (d, &n) in shape.iter().enumerate() {
        let n = n as i64;
        let bit = 1u32 << d;
        let shrink = params.shrink_axis_mask & bit != 0;
        let stride = params.strides.get(d).copied().unwrap_or(1);
        if stride == 0 {
            return Err(format!("stride of dimension {} is zero", d));
        }
        let (lo, hi) = if stride > 0 { (0, n) } else { (-1, n - 1) };
        let norm = |v: i64| (if v < 0 { v + n } else { v }).clamp(lo, hi);
        let begin = if params.begin_mask & bit != 0 {
            if stride > 0 { 0 } else { n - 1 }
        } else {
            norm(params.begin[d])
        };
        if shrink {
            if !(0..n).contains(&begin) {
                return Err(format!("shrink index out of range for dimension {}", d));
            }
            dims.push(SliceDim { begin, stride: 1, len: 1, shrink });
            continue;
        }
        let end = if params.end_mask & bit != 0 {
            if stride > 0 { n } else { -1 }
        } else {
            norm(params.end[d])
        };
        let span = if stride > 0 { end - begin } else { begin - end };
        let len = if span > 0 { (span as u64).div_ceil(stride.unsigned_abs()) as usize } else { 0 };
        dims.push(SliceDim { begin, stride, len, shrink });
    }
    Ok(dims)
}

pub fn prepare_strided_slice(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(1, 1)?;
    let x = ctx.input(0)?;
    let dims = strided_bounds(ctx.params(), x.shape()).map_err(|r| ctx.invalid(r))?;
    ctx.set_output_shape(0, dims.iter().filter(|s| !s.shrink).map(|s| s.len).collect())
}

pub fn eval_strided_slice(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let x = ctx.input(0)?;
    let dims = strided_bounds(ctx.params(), x.shape()).map_err(|r| ctx.fail(r))?;
    let in_strides = strides(x.shape());
    let full: SmallVec<[usize; MAX_RANK]> = dims.iter().map(|s| s.len).collect();
    let mut coords = [0usize; MAX_RANK];
    let out = ctx.output(0)?;
    let raw = same_repr(&x, out);
    for i in 0..out.numel() {
        // shrunk dimensions have extent 1, so the flat order is unchanged
        unravel(i, &full, &mut coords);
        let j: i64 = dims
            .iter()
            .enumerate()
            .map(|(d, s)| (s.begin + coords[d] as i64 * s.stride) * in_strides[d] as i64)
            .sum();
        transfer(&x, j as usize, out, i, raw);
    }
    Ok(())
}

fn check_paddings(ctx: &PrepareContext<'_>, rank: usize) -> Result<(), ShapeError> {
    if ctx.params().paddings.len() != rank {
        return Err(ctx.invalid(format!(
            "paddings has {} entries for rank {}",
            ctx.params().paddings.len(),
            rank
        )));
    }
    Ok(())
}

fn padded_shape(ctx: &PrepareContext<'_>, shape: &[usize]) -> Result<Vec<usize>, ShapeError> {
    shape
        .iter()
        .zip(&ctx.params().paddings)
        .map(|(&d, p)| p[0].checked_add(d).and_then(|v| v.checked_add(p[1])))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| ctx.invalid("padded dimension overflows"))
}

/// Pad and PadV2; PadV2 may carry a scalar pad value as input 1.
pub fn prepare_pad(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    let n = ctx.num_inputs();
    if !(1..=2).contains(&n) || ctx.num_outputs() != 1 {
        return Err(ctx.invalid("expected one or two inputs and one output"));
    }
    let x = ctx.input(0)?;
    if let Some(v) = ctx.optional_input(1) {
        if v.numel() != 1 {
            return Err(ctx.invalid("pad value must be a scalar"));
        }
    }
    check_paddings(ctx, x.rank())?;
    let shape = padded_shape(ctx, x.shape())?;
    ctx.set_output_shape(0, shape)
}

pub fn eval_pad(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let x = ctx.input(0)?;
    let fill = match ctx.optional_input(1) {
        Some(v) => v.real(0),
        None => ctx.params().value.unwrap_or(0.0) as f64,
    };
    let paddings = &ctx.params().paddings;
    let in_shape = x.shape();
    let in_strides = strides(in_shape);
    remap(ctx, fill, |_, c| {
        let mut j = 0;
        for (d, &o) in c.iter().enumerate() {
            let before = paddings[d][0];
            if o < before || o - before >= in_shape[d] {
                return None;
            }
            j += (o - before) * in_strides[d];
        }
        Some(j)
    })
}

pub fn prepare_mirror_pad(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(1, 1)?;
    let x = ctx.input(0)?;
    check_paddings(ctx, x.rank())?;
    let limit_offset = match ctx.params().mirror_mode {
        MirrorMode::Reflect => 1,
        MirrorMode::Symmetric => 0,
    };
    for (d, p) in ctx.params().paddings.iter().enumerate() {
        let limit = x.shape()[d].saturating_sub(limit_offset);
        if p[0] > limit || p[1] > limit {
            return Err(ctx.invalid(format!("padding {:?} too large for dimension {}", p, d)));
        }
    }
    let shape = padded_shape(ctx, x.shape())?;
    ctx.set_output_shape(0, shape)
}

pub fn eval_mirror_pad(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let x = ctx.input(0)?;
    let params = ctx.params();
    let symmetric = params.mirror_mode == MirrorMode::Symmetric;
    let in_shape = x.shape();
    let in_strides = strides(in_shape);
    remap(ctx, 0.0, |_, c| {
        let mut j = 0;
        for (d, &o) in c.iter().enumerate() {
            let n = in_shape[d] as i64;
            let mut pos = o as i64 - params.paddings[d][0] as i64;
            if pos < 0 {
                pos = if symmetric { -pos - 1 } else { -pos };
            } else if pos >= n {
                pos = if symmetric { 2 * n - 1 - pos } else { 2 * n - 2 - pos };
            }
            j += pos as usize * in_strides[d];
        }
        Some(j)
    })
}

/// Output shape is the declared one (or `new_shape`); the value comes from
/// an optional scalar input, then `value`, then zero.
pub fn prepare_fill(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    if ctx.num_inputs() > 1 || ctx.num_outputs() != 1 {
        return Err(ctx.invalid("expected at most one input and one output"));
    }
    if let Some(v) = ctx.optional_input(0) {
        if v.numel() != 1 {
            return Err(ctx.invalid("fill value must be a scalar"));
        }
    }
    let spec = &ctx.params().new_shape;
    if !spec.is_empty() {
        if spec.iter().any(|&d| d < 0) {
            return Err(ctx.invalid(format!("invalid fill shape {:?}", spec)));
        }
        ctx.set_output_shape(0, spec.iter().map(|&d| d as usize).collect())?;
    }
    Ok(())
}

pub fn eval_fill(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let default = ctx.params().value.unwrap_or(0.0) as f64;
    let value = ctx.optional_input(0);
    let out = ctx.output(0)?;
    match value {
        Some(v) if exact_integers(&v, out.desc()) => {
            let n = v.index(0);
            for i in 0..out.numel() {
                out.set_index(i, n);
            }
        }
        Some(v) => out.fill_real(v.real(0)),
        None => out.fill_real(default),
    }
    Ok(())
}

pub fn eval_zeros_like(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    ctx.output(0)?.bytes_mut().fill(0);
    Ok(())
}

pub fn prepare_broadcast_to(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(1, 1)?;
    let x = ctx.input(0)?;
    let spec = &ctx.params().new_shape;
    let target = if spec.is_empty() {
        ctx.output(0)?.shape().to_vec()
    } else if spec.iter().all(|&d| d >= 0) {
        spec.iter().map(|&d| d as usize).collect()
    } else {
        return Err(ctx.invalid(format!("invalid target shape {:?}", spec)));
    };
    match broadcast_shapes(x.shape(), &target) {
        Some(s) if s.as_slice() == target.as_slice() => ctx.set_output_shape(0, target),
        _ => Err(ctx.invalid(format!("cannot broadcast {:?} to {:?}", x.shape(), target))),
    }
}

pub fn eval_broadcast_to(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let x = ctx.input(0)?;
    let in_shape = x.shape();
    let out_shape = ctx.output(0)?.shape();
    remap(ctx, 0.0, |i, _| Some(broadcast_index(i, out_shape, in_shape)))
}

/// Two 1-D integer shape vectors in, their broadcast shape out.
pub fn prepare_broadcast_args(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(2, 1)?;
    let a = ctx.input(0)?;
    let b = ctx.input(1)?;
    for t in [a, b] {
        if t.rank() != 1 || !matches!(t.dtype(), DType::Int32 | DType::Int64) {
            return Err(ctx.invalid("shape operands must be 1-D int32 or int64"));
        }
        if t.numel() > MAX_RANK {
            return Err(ctx.invalid(format!("shape operand of rank {} exceeds {}", t.numel(), MAX_RANK)));
        }
    }
    ctx.set_output_shape(0, vec![a.numel().max(b.numel())])
}

pub fn eval_broadcast_args(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let a = ctx.input(0)?;
    let b = ctx.input(1)?;
    let read = |t: &TensorView<'_>| -> SmallVec<[usize; MAX_RANK]> {
        (0..t.numel()).map(|i| t.index(i).max(0) as usize).collect()
    };
    let shape = broadcast_shapes(&read(&a), &read(&b))
        .ok_or_else(|| ctx.fail("shapes do not broadcast"))?;
    let out = ctx.output(0)?;
    for (i, d) in shape.into_iter().enumerate() {
        out.set_index(i, d as i64);
    }
    Ok(())
}

fn block_size(ctx: &PrepareContext<'_>) -> Result<usize, ShapeError> {
    match ctx.params().block_size {
        Some(b) if b >= 1 => Ok(b),
        _ => Err(ctx.invalid("block_size must be at least 1")),
    }
}

pub fn prepare_depth_to_space(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(1, 1)?;
    let x = ctx.input(0)?;
    let b = block_size(ctx)?;
    let s = x.shape();
    let area = b.checked_mul(b).filter(|&a| x.rank() == 4 && s[3] % a == 0);
    let shape = area.and_then(|a| Some(vec![s[0], s[1].checked_mul(b)?, s[2].checked_mul(b)?, s[3] / a]));
    let shape = shape.ok_or_else(|| ctx.invalid(format!("input {:?} incompatible with block size {}", s, b)))?;
    ctx.set_output_shape(0, shape)
}

pub fn eval_depth_to_space(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let x = ctx.input(0)?;
    let b = ctx.params().block_size.unwrap_or(1);
    let st = strides(x.shape());
    let out_c = x.shape()[3] / (b * b);
    remap(ctx, 0.0, |_, c| {
        let (n, oh, ow, oc) = (c[0], c[1], c[2], c[3]);
        let ic = ((oh % b) * b + ow % b) * out_c + oc;
        Some(n * st[0] + (oh / b) * st[1] + (ow / b) * st[2] + ic)
    })
}

pub fn prepare_space_to_depth(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(1, 1)?;
    let x = ctx.input(0)?;
    let b = block_size(ctx)?;
    let s = x.shape();
    if x.rank() != 4 || s[1] % b != 0 || s[2] % b != 0 {
        return Err(ctx.invalid(format!("input {:?} incompatible with block size {}", s, b)));
    }
    let depth = s[3]
        .checked_mul(b)
        .and_then(|c| c.checked_mul(b))
        .ok_or_else(|| ctx.invalid(format!("input {:?} incompatible with block size {}", s, b)))?;
    ctx.set_output_shape(0, vec![s[0], s[1] / b, s[2] / b, depth])
}

pub fn eval_space_to_depth(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let x = ctx.input(0)?;
    let b = ctx.params().block_size.unwrap_or(1);
    let st = strides(x.shape());
    let in_c = x.shape()[3];
    remap(ctx, 0.0, |_, c| {
        let (n, oh, ow, oc) = (c[0], c[1], c[2], c[3]);
        let block = oc / in_c;
        let ih = oh * b + block / b;
        let iw = ow * b + block % b;
        Some(n * st[0] + ih * st[1] + iw * st[2] + oc % in_c)
    })
}
