//! 2-D convolutions over NHWC tensors.
//!
//! Filters are `[out_channels, kh, kw, in_channels]` for Conv2D and
//! `[1, kh, kw, in_channels * multiplier]` for DepthwiseConv2D. Bias is an
//! optional third input with one value per output channel.

use super::{window_output, EvalContext, PrepareContext};
use crate::error::{ExecutionError, ShapeError};

/// Input and output extents shared by both convolutions.
#[derive(Debug, Clone, Copy)]
struct ConvGeometry {
    batch: usize,
    in_h: usize,
    in_w: usize,
    in_c: usize,
    k_h: usize,
    k_w: usize,
    out_h: usize,
    out_w: usize,
    out_c: usize,
    stride: (usize, usize),
    dilation: (usize, usize),
    pad_top: usize,
    pad_left: usize,
}

fn geometry(ctx: &PrepareContext<'_>, depthwise: bool) -> Result<ConvGeometry, ShapeError> {
    let n_in = ctx.num_inputs();
    if !(2..=3).contains(&n_in) || ctx.num_outputs() != 1 {
        return Err(ctx.invalid("expected input, filter, optional bias and one output"));
    }
    let x = ctx.input(0)?;
    let f = ctx.input(1)?;
    if x.rank() != 4 || f.rank() != 4 {
        return Err(ctx.invalid(format!("input {:?} and filter {:?} must be rank 4", x.shape(), f.shape())));
    }
    let params = ctx.params();
    let [batch, in_h, in_w, in_c] = [x.shape()[0], x.shape()[1], x.shape()[2], x.shape()[3]];
    let (k_h, k_w) = (f.shape()[1], f.shape()[2]);
    let out_c = if depthwise {
        let out_c = f.shape()[3];
        if f.shape()[0] != 1 || in_c == 0 || out_c % in_c != 0 {
            return Err(ctx.invalid(format!("depthwise filter {:?} incompatible with {} input channels", f.shape(), in_c)));
        }
        if let Some(m) = params.depth_multiplier {
            if m.checked_mul(in_c) != Some(out_c) {
                return Err(ctx.invalid(format!("depth_multiplier {} disagrees with filter {:?}", m, f.shape())));
            }
        }
        out_c
    } else {
        if f.shape()[3] != in_c {
            return Err(ctx.invalid(format!("filter {:?} expects {} input channels, got {}", f.shape(), f.shape()[3], in_c)));
        }
        f.shape()[0]
    };
    if let Some(b) = ctx.optional_input(2) {
        if b.numel() != out_c {
            return Err(ctx.invalid(format!("bias has {} elements, expected {}", b.numel(), out_c)));
        }
    }
    let stride = params.stride();
    let dilation = params.dilation();
    let (out_h, pad_top) = window_output(in_h, k_h, stride.0, dilation.0, params.padding)
        .ok_or_else(|| ctx.invalid(format!("filter height {} does not fit input height {}", k_h, in_h)))?;
    let (out_w, pad_left) = window_output(in_w, k_w, stride.1, dilation.1, params.padding)
        .ok_or_else(|| ctx.invalid(format!("filter width {} does not fit input width {}", k_w, in_w)))?;
    Ok(ConvGeometry {
        batch,
        in_h,
        in_w,
        in_c,
        k_h,
        k_w,
        out_h,
        out_w,
        out_c,
        stride,
        dilation,
        pad_top,
        pad_left,
    })
}

/// Recomputes the geometry from concrete shapes at eval time.
fn eval_geometry(ctx: &EvalContext<'_>, depthwise: bool) -> Result<ConvGeometry, ExecutionError> {
    let x = ctx.input(0)?;
    let f = ctx.input(1)?;
    let params = ctx.params();
    let (stride, dilation) = (params.stride(), params.dilation());
    let (in_h, in_w) = (x.shape()[1], x.shape()[2]);
    let (k_h, k_w) = (f.shape()[1], f.shape()[2]);
    let (out_h, pad_top) = window_output(in_h, k_h, stride.0, dilation.0, params.padding)
        .ok_or_else(|| ctx.fail("filter exceeds input"))?;
    let (out_w, pad_left) = window_output(in_w, k_w, stride.1, dilation.1, params.padding)
        .ok_or_else(|| ctx.fail("filter exceeds input"))?;
    Ok(ConvGeometry {
        batch: x.shape()[0],
        in_h,
        in_w,
        in_c: x.shape()[3],
        k_h,
        k_w,
        out_h,
        out_w,
        out_c: if depthwise { f.shape()[3] } else { f.shape()[0] },
        stride,
        dilation,
        pad_top,
        pad_left,
    })
}

pub fn prepare_conv2d(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    let g = geometry(ctx, false)?;
    ctx.set_output_shape(0, vec![g.batch, g.out_h, g.out_w, g.out_c])
}

pub fn prepare_depthwise_conv2d(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    let g = geometry(ctx, true)?;
    ctx.set_output_shape(0, vec![g.batch, g.out_h, g.out_w, g.out_c])
}

/// Input row/column for kernel tap `k` at output position `o`, if inside.
#[inline]
fn tap(o: usize, k: usize, stride: usize, dilation: usize, pad: usize, extent: usize) -> Option<usize> {
    let pos = (o * stride + k * dilation).checked_sub(pad)?;
    (pos < extent).then_some(pos)
}

pub fn eval_conv2d(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let g = eval_geometry(ctx, false)?;
    let x = ctx.input(0)?;
    let f = ctx.input(1)?;
    let bias = ctx.optional_input(2);
    let act = ctx.params().activation;
    let out = ctx.output(0)?;

    for n in 0..g.batch {
        for oy in 0..g.out_h {
            for ox in 0..g.out_w {
                for oc in 0..g.out_c {
                    let mut acc = bias.as_ref().map_or(0.0, |b| b.real(oc));
                    for ky in 0..g.k_h {
                        let Some(iy) = tap(oy, ky, g.stride.0, g.dilation.0, g.pad_top, g.in_h) else {
                            continue;
                        };
                        for kx in 0..g.k_w {
                            let Some(ix) = tap(ox, kx, g.stride.1, g.dilation.1, g.pad_left, g.in_w) else {
                                continue;
                            };
                            let x_base = ((n * g.in_h + iy) * g.in_w + ix) * g.in_c;
                            let f_base = ((oc * g.k_h + ky) * g.k_w + kx) * g.in_c;
                            for ic in 0..g.in_c {
                                acc += x.real(x_base + ic) * f.real(f_base + ic);
                            }
                        }
                    }
                    let o = ((n * g.out_h + oy) * g.out_w + ox) * g.out_c + oc;
                    out.set_real(o, act.apply(acc));
                }
            }
        }
    }
    Ok(())
}

pub fn eval_depthwise_conv2d(ctx: &mut EvalContext<'_>) -> Result<(), ExecutionError> {
    let g = eval_geometry(ctx, true)?;
    let x = ctx.input(0)?;
    let f = ctx.input(1)?;
    let bias = ctx.optional_input(2);
    let act = ctx.params().activation;
    let multiplier = g.out_c / g.in_c;
    let out = ctx.output(0)?;

    for n in 0..g.batch {
        for oy in 0..g.out_h {
            for ox in 0..g.out_w {
                for oc in 0..g.out_c {
                    let ic = oc / multiplier;
                    let mut acc = bias.as_ref().map_or(0.0, |b| b.real(oc));
                    for ky in 0..g.k_h {
                        let Some(iy) = tap(oy, ky, g.stride.0, g.dilation.0, g.pad_top, g.in_h) else {
                            continue;
                        };
                        for kx in 0..g.k_w {
                            let Some(ix) = tap(ox, kx, g.stride.1, g.dilation.1, g.pad_left, g.in_w) else {
                                continue;
                            };
                            let xi = ((n * g.in_h + iy) * g.in_w + ix) * g.in_c + ic;
                            let fi = (ky * g.k_w + kx) * g.out_c + oc;
                            acc += x.real(xi) * f.real(fi);
                        }
                    }
                    let o = ((n * g.out_h + oy) * g.out_w + ox) * g.out_c + oc;
                    out.set_real(o, act.apply(acc));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::ops::{OpParams, Padding};
    use crate::registry::OpKind;
    use crate::tensor::{DType, Quantization, TensorDesc};

    #[test]
    fn test_tap_bounds() {
        assert_eq!(tap(0, 0, 1, 1, 1, 3), None);
        assert_eq!(tap(0, 1, 1, 1, 1, 3), Some(0));
        assert_eq!(tap(2, 2, 1, 1, 1, 3), None);
    }

    #[test]
    fn test_conv_valid_3x3_ones() {
        let x = f32_tensor(&[1, 3, 3, 1], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        let f = f32_tensor(&[1, 3, 3, 1], &[1.0; 9]);
        let r = run(OpKind::Conv2D, &OpParams::default(), &[x, f], &[f32_out(&[1, 1, 1, 1])]).unwrap();
        assert_eq!(r[0], vec![45.0]);
    }

    #[test]
    fn test_conv_same_padding_with_bias() {
        let x = f32_tensor(&[1, 2, 2, 1], &[1.0, 2.0, 3.0, 4.0]);
        let f = f32_tensor(&[2, 1, 1, 1], &[1.0, -1.0]);
        let b = f32_tensor(&[2], &[10.0, 0.0]);
        let p = OpParams { padding: Padding::Same, ..Default::default() };
        let r = run(OpKind::Conv2D, &p, &[x, f, b], &[f32_out(&[1, 2, 2, 2])]).unwrap();
        assert_eq!(r[0], vec![11.0, -1.0, 12.0, -2.0, 13.0, -3.0, 14.0, -4.0]);
    }

    #[test]
    fn test_conv_same_stride2_output_size() {
        let x = f32_tensor(&[1, 5, 5, 1], &[1.0; 25]);
        let f = f32_tensor(&[1, 3, 3, 1], &[1.0; 9]);
        let p = OpParams { padding: Padding::Same, stride: Some([2, 2]), ..Default::default() };
        let r = run(OpKind::Conv2D, &p, &[x, f], &[f32_out(&[1, 3, 3, 1])]).unwrap();
        // corner windows see 2x2 of the input, the centre sees 3x3
        assert_eq!(r[0][0], 4.0);
        assert_eq!(r[0][4], 9.0);
    }

    #[test]
    fn test_conv_rejects_oversized_filter() {
        let x = f32_tensor(&[1, 2, 2, 1], &[1.0; 4]);
        let f = f32_tensor(&[1, 3, 3, 1], &[1.0; 9]);
        let err = run(OpKind::Conv2D, &OpParams::default(), &[x, f], &[f32_out(&[1, 1, 1, 1])]).unwrap_err();
        assert!(err.contains("does not fit"));
    }

    #[test]
    fn test_conv_rejects_overflowing_dilation() {
        let x = f32_tensor(&[1, 3, 3, 1], &[1.0; 9]);
        let f = f32_tensor(&[1, 2, 2, 1], &[1.0; 4]);
        for padding in [Padding::Valid, Padding::Same] {
            let p = OpParams { dilation: Some([usize::MAX, 1]), padding, ..Default::default() };
            assert!(run(OpKind::Conv2D, &p, &[x.clone(), f.clone()], &[f32_out(&[1, 3, 3, 1])]).is_err());
        }
        let p = OpParams { depth_multiplier: Some(usize::MAX), ..Default::default() };
        let f = f32_tensor(&[1, 1, 1, 2], &[1.0; 2]);
        let x = f32_tensor(&[1, 1, 1, 2], &[1.0; 2]);
        assert!(run(OpKind::DepthwiseConv2D, &p, &[x, f], &[f32_out(&[1, 1, 1, 2])]).is_err());
    }

    #[test]
    fn test_conv_channel_mismatch() {
        let x = f32_tensor(&[1, 2, 2, 2], &[1.0; 8]);
        let f = f32_tensor(&[1, 1, 1, 1], &[1.0]);
        assert!(run(OpKind::Conv2D, &OpParams::default(), &[x, f], &[f32_out(&[1, 2, 2, 1])]).is_err());
    }

    #[test]
    fn test_depthwise_multiplier() {
        let x = f32_tensor(&[1, 1, 1, 2], &[1.0, 2.0]);
        let f = f32_tensor(&[1, 1, 1, 4], &[1.0, 2.0, 3.0, 4.0]);
        let p = OpParams { depth_multiplier: Some(2), ..Default::default() };
        let r = run(OpKind::DepthwiseConv2D, &p, &[x, f], &[f32_out(&[1, 1, 1, 4])]).unwrap();
        assert_eq!(r[0], vec![1.0, 2.0, 6.0, 8.0]);
    }

    #[test]
    fn test_depthwise_int8_per_channel() {
        let x = typed_tensor(
            TensorDesc::new("x", DType::Int8, &[1, 1, 2, 2]).with_quant(Quantization::per_tensor(0.5, 0)),
            &[1.0, 2.0, 3.0, 4.0],
        );
        let f = typed_tensor(
            TensorDesc::new("f", DType::Int8, &[1, 1, 2, 2])
                .with_quant(Quantization::per_channel(vec![0.5, 0.25], vec![0, 0], 3)),
            &[1.0, 1.0, 1.0, 1.0],
        );
        let out = TensorDesc::new("y", DType::Int8, &[1, 1, 1, 2]).with_quant(Quantization::per_tensor(0.5, 0));
        let r = run(OpKind::DepthwiseConv2D, &OpParams::default(), &[x, f], &[out]).unwrap();
        assert_eq!(r[0], vec![4.0, 6.0]);
    }
}
