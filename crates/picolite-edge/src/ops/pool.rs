//! 2-D pooling and spatial resize over NHWC tensors.

use super::{window_output, EvalContext, PrepareContext};
use crate::error::{ExecutionError, ShapeError};

/// Window bounds of one pooled output position, clipped to the input.
#[inline]
fn window(o: usize, stride: usize, pad: usize, size: usize, extent: usize) -> (usize, usize) {
    let start = o.saturating_mul(stride);
    let end = start.saturating_add(size).saturating_sub(pad).min(extent);
    (start.saturating_sub(pad).min(end), end)
}

pub fn prepare_pool(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(1, 1)?;
    let x = ctx.input(0)?;
    if x.rank() != 4 {
        return Err(ctx.invalid(format!("input {:?} must be rank 4", x.shape())));
    }
    let params = ctx.params();
    let [fh, fw] = params.filter.ok_or_else(|| ctx.invalid("missing filter size"))?;
    if fh == 0 || fw == 0 {
        return Err(ctx.invalid("filter size must be positive"));
    }
    let (sh, sw) = params.stride();
    let s = x.shape();
    let (oh, _) = window_output(s[1], fh, sh, 1, params.padding)
        .ok_or_else(|| ctx.invalid(format!("filter height {} does not fit input height {}", fh, s[1])))?;
    let (ow, _) = window_output(s[2], fw, sw, 1, params.padding)
        .ok_or_else(|| ctx.invalid(format!("filter width {} does not fit input width {}", fw, s[2])))?;
    ctx.set_output_shape(0, vec![s[0], oh, ow, s[3]])
}

#[derive(Clone, Copy)]
enum Pool {
    Average,
    Max,
    L2,
}

fn pool(ctx: &mut EvalContext<'_>, kind: Pool) -> Result<(), ExecutionError> {
    let x = ctx.input(0)?;
    let params = ctx.params();
    let [fh, fw] = params.filter.ok_or_else(|| ctx.fail("missing filter size"))?;
    let (sh, sw) = params.stride();
    let s = x.shape();
    let (batch, in_h, in_w, ch) = (s[0], s[1], s[2], s[3]);
    let (_, pad_top) = window_output(in_h, fh, sh, 1, params.padding).ok_or_else(|| ctx.fail("bad window"))?;
    let (_, pad_left) = window_output(in_w, fw, sw, 1, params.padding).ok_or_else(|| ctx.fail("bad window"))?;
    let act = params.activation;
    let out = ctx.output(0)?;
    let (out_h, out_w) = (out.shape()[1], out.shape()[2]);

    for n in 0..batch {
        for oy in 0..out_h {
            let (y0, y1) = window(oy, sh, pad_top, fh, in_h);
            for ox in 0..out_w {
                let (x0, x1) = window(ox, sw, pad_left, fw, in_w);
                for c in 0..ch {
                    let mut acc = match kind {
                        Pool::Max => f64::NEG_INFINITY,
                        _ => 0.0,
                    };
                    let mut count = 0usize;
                    for iy in y0..y1 {
                        for ix in x0..x1 {
                            let v = x.real(((n * in_h + iy) * in_w + ix) * ch + c);
                            acc = match kind {
                                Pool::Average => acc + v,
                                Pool::Max => acc.max(v),
                                Pool::L2 => acc + v * v,
                            };
                            count += 1;
                        }
                    }
                    let v = match kind {
                        Pool::Average if count > 0 => acc / count as f64,
                        Pool::L2 if count > 0 => (acc / count as f64).sqrt(),
                        Pool::Max if count > 0 => acc,
                        _ => 0.0,
                    };
                    out.set_real(((n * out_h + oy) * out_w + ox) * ch + c, act.apply(v));
                }
            }
        }
    }
    Ok(())
}

/// Mean over the in-bounds part of each window.
pub fn eval_average_pool(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    pool(ctx, Pool::Average)
}

pub fn eval_max_pool(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    pool(ctx, Pool::Max)
}

pub fn eval_l2_pool(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    pool(ctx, Pool::L2)
}

/// Target `[height, width]` comes from `new_shape` or the declared output.
pub fn prepare_resize(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(1, 1)?;
    let x = ctx.input(0)?;
    if x.rank() != 4 {
        return Err(ctx.invalid(format!("input {:?} must be rank 4", x.shape())));
    }
    let params = ctx.params();
    if params.align_corners && params.half_pixel_centers {
        return Err(ctx.invalid("align_corners and half_pixel_centers are exclusive"));
    }
    let (h, w) = match params.new_shape.as_slice() {
        [] => {
            let o = ctx.output(0)?;
            if o.rank() != 4 {
                return Err(ctx.invalid("output must be rank 4"));
            }
            (o.shape()[1], o.shape()[2])
        }
        &[h, w] if h > 0 && w > 0 => (h as usize, w as usize),
        other => return Err(ctx.invalid(format!("invalid resize target {:?}", other))),
    };
    let s = x.shape();
    ctx.set_output_shape(0, vec![s[0], h, w, s[3]])
}

#[inline]
fn resize_scale(input: usize, output: usize, align_corners: bool) -> f64 {
    if align_corners && output > 1 {
        (input as f64 - 1.0) / (output as f64 - 1.0)
    } else {
        input as f64 / output as f64
    }
}

pub fn eval_resize_nearest(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let x = ctx.input(0)?;
    let params = ctx.params();
    let s = x.shape();
    let (batch, in_h, in_w, ch) = (s[0], s[1], s[2], s[3]);
    let out = ctx.output(0)?;
    let (out_h, out_w) = (out.shape()[1], out.shape()[2]);
    let sy = resize_scale(in_h, out_h, params.align_corners);
    let sx = resize_scale(in_w, out_w, params.align_corners);
    let offset = if params.half_pixel_centers { 0.5 } else { 0.0 };
    let nearest = |o: usize, scale: f64, extent: usize| {
        let v = (o as f64 + offset) * scale;
        let v = if params.align_corners { v.round() } else { v.floor() };
        (v.max(0.0) as usize).min(extent - 1)
    };

    for n in 0..batch {
        for oy in 0..out_h {
            let iy = nearest(oy, sy, in_h);
            for ox in 0..out_w {
                let ix = nearest(ox, sx, in_w);
                for c in 0..ch {
                    let v = x.real(((n * in_h + iy) * in_w + ix) * ch + c);
                    out.set_real(((n * out_h + oy) * out_w + ox) * ch + c, v);
                }
            }
        }
    }
    Ok(())
}

pub fn eval_resize_bilinear(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let x = ctx.input(0)?;
    let params = ctx.params();
    let s = x.shape();
    let (batch, in_h, in_w, ch) = (s[0], s[1], s[2], s[3]);
    let out = ctx.output(0)?;
    let (out_h, out_w) = (out.shape()[1], out.shape()[2]);
    let sy = resize_scale(in_h, out_h, params.align_corners);
    let sx = resize_scale(in_w, out_w, params.align_corners);
    // (scaled position, lower index, upper index)
    let interp = |o: usize, scale: f64, extent: usize| {
        let v = if params.half_pixel_centers { (o as f64 + 0.5) * scale - 0.5 } else { o as f64 * scale };
        let lo = v.floor().max(0.0) as usize;
        let hi = (v.ceil().max(0.0) as usize).min(extent - 1);
        (v, lo.min(extent - 1), hi)
    };

    for n in 0..batch {
        for oy in 0..out_h {
            let (y, y0, y1) = interp(oy, sy, in_h);
            let dy = y - y0 as f64;
            for ox in 0..out_w {
                let (xf, x0, x1) = interp(ox, sx, in_w);
                let dx = xf - x0 as f64;
                for c in 0..ch {
                    let at = |iy: usize, ix: usize| x.real(((n * in_h + iy) * in_w + ix) * ch + c);
                    let v = at(y0, x0) * (1.0 - dy) * (1.0 - dx)
                        + at(y1, x0) * dy * (1.0 - dx)
                        + at(y0, x1) * (1.0 - dy) * dx
                        + at(y1, x1) * dy * dx;
                    out.set_real(((n * out_h + oy) * out_w + ox) * ch + c, v);
                }
            }
        }
    }
    Ok(())
}
