//! Index-driven lookups: EmbeddingLookup, Gather and GatherNd.
//!
//! Index values are data, so an out-of-range index is an execution error
//! rather than a planning error.

use super::{normalize_axis, same_repr, transfer, EvalContext, PrepareContext};
use crate::error::{ExecutionError, ShapeError};
use crate::tensor::{numel, TensorView};

fn require_index_tensor(ctx: &PrepareContext<'_>, slot: usize) -> Result<(), ShapeError> {
    let t = ctx.input(slot)?;
    if !t.dtype().is_integer() || t.quantization().is_some() {
        return Err(ctx.invalid(format!("input {} must hold integer indices, got {}", slot, t.dtype())));
    }
    Ok(())
}

/// Resolves index element `i` of `indices` against `limit`.
#[inline]
fn lookup(indices: &TensorView<'_>, i: usize, limit: usize) -> Option<usize> {
    let v = indices.index(i);
    (v >= 0 && (v as usize) < limit).then_some(v as usize)
}

/// `ids: [n]` (int) and `table: [rows, ..]` give `[n, ..]`.
pub fn prepare_embedding_lookup(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(2, 1)?;
    require_index_tensor(ctx, 0)?;
    let ids = ctx.input(0)?;
    let table = ctx.input(1)?;
    if ids.rank() != 1 || table.rank() < 1 {
        return Err(ctx.invalid(format!("ids {:?} must be 1-D and table {:?} at least 1-D", ids.shape(), table.shape())));
    }
    let mut shape = table.shape().to_vec();
    shape[0] = ids.numel();
    ctx.set_output_shape(0, shape)
}

pub fn eval_embedding_lookup(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let ids = ctx.input(0)?;
    let table = ctx.input(1)?;
    let rows = table.shape()[0];
    let row_len = numel(&table.shape()[1..]);
    let mut bad = None;
    let out = ctx.output(0)?;
    let raw = same_repr(&table, out);
    for i in 0..ids.numel() {
        let Some(row) = lookup(&ids, i, rows) else {
            bad = Some(ids.index(i));
            break;
        };
        for k in 0..row_len {
            transfer(&table, row * row_len + k, out, i * row_len + k, raw);
        }
    }
    match bad {
        Some(id) => Err(ctx.fail(format!("id {} outside table of {} rows", id, rows))),
        None => Ok(()),
    }
}

/// `params[.., axis, ..]` indexed by an integer tensor along `axis`.
pub fn prepare_gather(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(2, 1)?;
    require_index_tensor(ctx, 1)?;
    let params = ctx.input(0)?;
    let indices = ctx.input(1)?;
    let axis = ctx.params().axis.unwrap_or(0);
    let d = normalize_axis(axis as i64, params.rank())
        .ok_or_else(|| ctx.invalid(format!("axis {} out of range", axis)))?;
    let mut shape = params.shape()[..d].to_vec();
    shape.extend_from_slice(indices.shape());
    shape.extend_from_slice(&params.shape()[d + 1..]);
    ctx.set_output_shape(0, shape)
}

pub fn eval_gather(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let params = ctx.input(0)?;
    let indices = ctx.input(1)?;
    let d = normalize_axis(ctx.params().axis.unwrap_or(0) as i64, params.rank())
        .ok_or_else(|| ctx.fail("axis out of range"))?;
    let outer = numel(&params.shape()[..d]);
    let dim = params.shape()[d];
    let inner = numel(&params.shape()[d + 1..]);
    let n_idx = indices.numel();
    let mut bad = None;
    let out = ctx.output(0)?;
    let raw = same_repr(&params, out);
    'outer: for o in 0..outer {
        for p in 0..n_idx {
            let Some(j) = lookup(&indices, p, dim) else {
                bad = Some(indices.index(p));
                break 'outer;
            };
            for k in 0..inner {
                transfer(&params, (o * dim + j) * inner + k, out, (o * n_idx + p) * inner + k, raw);
            }
        }
    }
    match bad {
        Some(v) => Err(ctx.fail(format!("index {} outside dimension of size {}", v, dim))),
        None => Ok(()),
    }
}

/// `indices: [.., D]` addresses the leading `D` dimensions of `params`.
pub fn prepare_gather_nd(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(2, 1)?;
    require_index_tensor(ctx, 1)?;
    let params = ctx.input(0)?;
    let indices = ctx.input(1)?;
    let depth = indices.shape().last().copied().unwrap_or(0);
    if indices.rank() == 0 || depth > params.rank() {
        return Err(ctx.invalid(format!(
            "indices {:?} cannot address params {:?}",
            indices.shape(),
            params.shape()
        )));
    }
    let mut shape = indices.shape()[..indices.rank() - 1].to_vec();
    shape.extend_from_slice(&params.shape()[depth..]);
    ctx.set_output_shape(0, shape)
}

pub fn eval_gather_nd(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let params = ctx.input(0)?;
    let indices = ctx.input(1)?;
    let depth = indices.shape().last().copied().unwrap_or(0);
    let slices = indices.numel() / depth.max(1);
    let slice_len = numel(&params.shape()[depth..]);
    let mut bad = false;
    let out = ctx.output(0)?;
    let raw = same_repr(&params, out);
    'outer: for s in 0..slices {
        let mut base = 0;
        for d in 0..depth {
            let dim = params.shape()[d];
            let Some(j) = lookup(&indices, s * depth + d, dim) else {
                bad = true;
                break 'outer;
            };
            base = base * dim + j;
        }
        for k in 0..slice_len {
            transfer(&params, base * slice_len + k, out, s * slice_len + k, raw);
        }
    }
    if bad {
        return Err(ctx.fail("index out of range"));
    }
    Ok(())
}
