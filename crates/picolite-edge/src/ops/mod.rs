//! Built-in operator kernels.
//!
//! Kernels see tensors through [`TensorView`]/[`TensorViewMut`] and work in
//! the real-value domain, so one implementation serves float and quantized
//! tensors alike. Dispatch is data-driven: [`BUILTIN_KERNELS`] maps each
//! supported [`OpKind`] to its `prepare`/`eval` pair.

pub mod activation;
pub mod conv;
pub mod elementwise;
pub mod embedding;
pub mod matmul;
pub mod params;
pub mod pool;
pub mod quant;
pub mod reduce;
pub mod shape;

pub use params::{Activation, MirrorMode, OpParams, Padding};

use smallvec::SmallVec;

use crate::error::{ExecutionError, ShapeError};
use crate::registry::{FnKernel, OpKind, OperatorCode};
use crate::tensor::{exact_integers, DType, Quantization, TensorDesc, TensorView, TensorViewMut, MAX_RANK};

/// Most inputs a node may have; invoke keeps its operand views inline.
pub const MAX_NODE_INPUTS: usize = 16;

/// Most outputs a node may have.
pub const MAX_NODE_OUTPUTS: usize = 8;

pub(crate) type InputViews<'a> = SmallVec<[Option<TensorView<'a>>; MAX_NODE_INPUTS]>;
pub(crate) type OutputViews<'a> = SmallVec<[TensorViewMut<'a>; MAX_NODE_OUTPUTS]>;

/// Planning-time view of one operand.
#[derive(Debug, Clone, Copy)]
pub struct TensorInfo<'a> {
    pub index: usize,
    pub desc: &'a TensorDesc,
    /// Constant data, when the tensor is backed by the model blob.
    pub data: Option<&'a [u8]>,
}

impl<'a> TensorInfo<'a> {
    pub fn shape(&self) -> &'a [usize] {
        &self.desc.shape
    }

    pub fn rank(&self) -> usize {
        self.desc.shape.len()
    }

    pub fn dtype(&self) -> DType {
        self.desc.dtype
    }

    pub fn numel(&self) -> usize {
        self.desc.numel()
    }

    pub fn quantization(&self) -> Option<&'a Quantization> {
        self.desc.quant.as_ref()
    }

    pub fn is_constant(&self) -> bool {
        self.data.is_some()
    }

    pub fn const_view(&self) -> Option<TensorView<'a>> {
        self.data.map(|d| TensorView::new(self.desc, d))
    }
}

/// Context handed to a kernel's `prepare` during planning.
pub struct PrepareContext<'a> {
    node: usize,
    op: &'a OperatorCode,
    params: &'a OpParams,
    inputs: Vec<Option<TensorInfo<'a>>>,
    outputs: Vec<TensorInfo<'a>>,
    inferred: Vec<Option<Vec<usize>>>,
    scratch_bytes: usize,
}

impl<'a> PrepareContext<'a> {
    pub(crate) fn new(
        node: usize,
        op: &'a OperatorCode,
        params: &'a OpParams,
        inputs: Vec<Option<TensorInfo<'a>>>,
        outputs: Vec<TensorInfo<'a>>,
    ) -> Self {
        let inferred = vec![None; outputs.len()];
        Self { node, op, params, inputs, outputs, inferred, scratch_bytes: 0 }
    }

    pub fn node(&self) -> usize {
        self.node
    }

    pub fn op(&self) -> &'a OperatorCode {
        self.op
    }

    pub fn params(&self) -> &'a OpParams {
        self.params
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn input(&self, i: usize) -> Result<TensorInfo<'a>, ShapeError> {
        self.optional_input(i)
            .ok_or_else(|| self.invalid(format!("missing input {}", i)))
    }

    pub fn optional_input(&self, i: usize) -> Option<TensorInfo<'a>> {
        self.inputs.get(i).copied().flatten()
    }

    pub fn output(&self, i: usize) -> Result<TensorInfo<'a>, ShapeError> {
        self.outputs
            .get(i)
            .copied()
            .ok_or_else(|| self.invalid(format!("missing output {}", i)))
    }

    /// Record the inferred shape of output `i`; the planner checks it
    /// against the declared shape.
    pub fn set_output_shape(&mut self, i: usize, shape: Vec<usize>) -> Result<(), ShapeError> {
        if i >= self.outputs.len() {
            return Err(self.invalid(format!("output {} out of range", i)));
        }
        self.inferred[i] = Some(shape);
        Ok(())
    }

    /// Ask for a per-node scratch buffer, live only while this node runs.
    pub fn request_scratch(&mut self, bytes: usize) {
        self.scratch_bytes = self.scratch_bytes.max(bytes);
    }

    pub fn invalid(&self, reason: impl Into<String>) -> ShapeError {
        ShapeError::Invalid { node: self.node, op: self.op.to_string(), reason: reason.into() }
    }

    /// Require exactly `n_in` inputs (counting omitted ones) and `n_out` outputs.
    pub fn expect_io(&self, n_in: usize, n_out: usize) -> Result<(), ShapeError> {
        if self.inputs.len() != n_in || self.outputs.len() != n_out {
            return Err(self.invalid(format!(
                "expected {} inputs and {} outputs, got {} and {}",
                n_in,
                n_out,
                self.inputs.len(),
                self.outputs.len()
            )));
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> (Vec<Option<Vec<usize>>>, usize) {
        (self.inferred, self.scratch_bytes)
    }
}

/// Context handed to a kernel's `eval` at invoke time.
pub struct EvalContext<'a> {
    node: usize,
    op: &'a OperatorCode,
    params: &'a OpParams,
    inputs: InputViews<'a>,
    outputs: OutputViews<'a>,
    scratch: &'a mut [u8],
}

impl<'a> EvalContext<'a> {
    pub(crate) fn new(
        node: usize,
        op: &'a OperatorCode,
        params: &'a OpParams,
        inputs: InputViews<'a>,
        outputs: OutputViews<'a>,
        scratch: &'a mut [u8],
    ) -> Self {
        Self { node, op, params, inputs, outputs, scratch }
    }

    pub fn node(&self) -> usize {
        self.node
    }

    pub fn params(&self) -> &'a OpParams {
        self.params
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn input(&self, i: usize) -> Result<TensorView<'a>, ExecutionError> {
        self.optional_input(i)
            .ok_or(ExecutionError::MissingTensor { node: self.node, slot: i })
    }

    pub fn optional_input(&self, i: usize) -> Option<TensorView<'a>> {
        self.inputs.get(i).copied().flatten()
    }

    pub fn output(&mut self, i: usize) -> Result<&mut TensorViewMut<'a>, ExecutionError> {
        let node = self.node;
        self.outputs
            .get_mut(i)
            .ok_or(ExecutionError::MissingTensor { node, slot: i })
    }

    pub fn outputs_mut(&mut self) -> &mut [TensorViewMut<'a>] {
        &mut self.outputs
    }

    pub fn output_and_scratch(
        &mut self,
        i: usize,
    ) -> Result<(&mut TensorViewMut<'a>, &mut [u8]), ExecutionError> {
        let node = self.node;
        let out = self
            .outputs
            .get_mut(i)
            .ok_or(ExecutionError::MissingTensor { node, slot: i })?;
        Ok((out, &mut *self.scratch))
    }

    pub fn scratch_len(&self) -> usize {
        self.scratch.len()
    }

    pub fn fail(&self, reason: impl Into<String>) -> ExecutionError {
        ExecutionError::Kernel { node: self.node, op: self.op.to_string(), reason: reason.into() }
    }
}

/// Inline shape storage; never spills for ranks up to [`MAX_RANK`].
pub(crate) type Shape = SmallVec<[usize; MAX_RANK]>;

/// Numpy-style broadcast of two shapes.
pub(crate) fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Shape> {
    let rank = a.len().max(b.len());
    let mut out = Shape::new();
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out.push(match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        });
    }
    Some(out)
}

/// Flat index into a broadcast operand for flat output index `flat`.
#[inline]
pub(crate) fn broadcast_index(flat: usize, out_shape: &[usize], in_shape: &[usize]) -> usize {
    let offset = out_shape.len() - in_shape.len();
    let mut rem = flat;
    let mut idx = 0;
    let mut stride = 1;
    for d in (0..out_shape.len()).rev() {
        let coord = rem % out_shape[d];
        rem /= out_shape[d];
        if d >= offset {
            let dim = in_shape[d - offset];
            if dim != 1 {
                idx += coord * stride;
            }
            stride *= dim;
        }
    }
    idx
}

/// Row-major strides, padded to [`MAX_RANK`].
pub(crate) fn strides(shape: &[usize]) -> [usize; MAX_RANK] {
    let mut s = [0usize; MAX_RANK];
    let mut acc = 1;
    for d in (0..shape.len().min(MAX_RANK)).rev() {
        s[d] = acc;
        acc *= shape[d];
    }
    s
}

/// Resolve a possibly negative axis against `rank`.
pub(crate) fn normalize_axis(axis: i64, rank: usize) -> Option<usize> {
    let r = rank as i64;
    let a = if axis < 0 { axis + r } else { axis };
    (0..r).contains(&a).then_some(a as usize)
}

/// Output extent and leading padding of a windowed op along one axis.
pub(crate) fn window_output(
    input: usize,
    filter: usize,
    stride: usize,
    dilation: usize,
    padding: Padding,
) -> Option<(usize, usize)> {
    let effective = filter.checked_sub(1)?.checked_mul(dilation)?.checked_add(1)?;
    match padding {
        Padding::Valid => {
            let out = input.checked_sub(effective)?.checked_div(stride)? + 1;
            Some((out, 0))
        }
        Padding::Same => {
            let out = input.checked_div(stride)? + usize::from(input % stride != 0);
            let span = out.saturating_sub(1).checked_mul(stride)?.checked_add(effective)?;
            Some((out, span.saturating_sub(input) / 2))
        }
    }
}

/// Writes the coordinates of flat index `flat` into `coords`.
#[inline]
pub(crate) fn unravel(mut flat: usize, shape: &[usize], coords: &mut [usize; MAX_RANK]) {
    for d in (0..shape.len()).rev() {
        coords[d] = flat % shape[d];
        flat /= shape[d];
    }
}

/// Whether elements can move between the two tensors as raw bytes.
pub(crate) fn same_repr(src: &TensorView<'_>, dst: &TensorViewMut<'_>) -> bool {
    src.dtype() == dst.dtype() && src.quantization() == dst.quantization()
}

/// Moves element `j` of `src` to element `i` of `dst`.
#[inline]
pub(crate) fn transfer(src: &TensorView<'_>, j: usize, dst: &mut TensorViewMut<'_>, i: usize, raw: bool) {
    if raw {
        let es = src.dtype().size();
        dst.bytes_mut()[i * es..(i + 1) * es].copy_from_slice(&src.bytes()[j * es..(j + 1) * es]);
    } else if exact_integers(src, dst.desc()) {
        dst.set_index(i, src.index(j));
    } else {
        dst.set_real(i, src.real(j));
    }
}

/// Shared prepare for ops whose single output mirrors the single input.
pub(crate) fn prepare_same_shape(ctx: &mut PrepareContext<'_>) -> Result<(), ShapeError> {
    ctx.expect_io(1, 1)?;
    let shape = ctx.input(0)?.shape().to_vec();
    ctx.set_output_shape(0, shape)
}

macro_rules! k {
    ($prepare:path, $eval:path) => {
        FnKernel::new($prepare, $eval)
    };
}

/// Built-in kernel table.
pub static BUILTIN_KERNELS: &[(OpKind, FnKernel)] = &[
    (OpKind::Abs, k!(elementwise::prepare_unary, elementwise::eval_abs)),
    (OpKind::Add, k!(elementwise::prepare_binary, elementwise::eval_add)),
    (OpKind::AddN, k!(elementwise::prepare_add_n, elementwise::eval_add_n)),
    (OpKind::ArgMax, k!(reduce::prepare_arg, reduce::eval_arg_max)),
    (OpKind::ArgMin, k!(reduce::prepare_arg, reduce::eval_arg_min)),
    (OpKind::AveragePool2D, k!(pool::prepare_pool, pool::eval_average_pool)),
    (OpKind::BatchMatMul, k!(matmul::prepare_batch_matmul, matmul::eval_batch_matmul)),
    (OpKind::BroadcastArgs, k!(shape::prepare_broadcast_args, shape::eval_broadcast_args)),
    (OpKind::BroadcastTo, k!(shape::prepare_broadcast_to, shape::eval_broadcast_to)),
    (OpKind::Cast, k!(prepare_same_shape, quant::eval_cast)),
    (OpKind::Ceil, k!(elementwise::prepare_unary, elementwise::eval_ceil)),
    (OpKind::Concatenation, k!(shape::prepare_concatenation, shape::eval_concatenation)),
    (OpKind::Conv2D, k!(conv::prepare_conv2d, conv::eval_conv2d)),
    (OpKind::Cos, k!(elementwise::prepare_unary, elementwise::eval_cos)),
    (OpKind::CumSum, k!(reduce::prepare_cum_sum, reduce::eval_cum_sum)),
    (OpKind::DepthToSpace, k!(shape::prepare_depth_to_space, shape::eval_depth_to_space)),
    (OpKind::DepthwiseConv2D, k!(conv::prepare_depthwise_conv2d, conv::eval_depthwise_conv2d)),
    (OpKind::Dequantize, k!(quant::prepare_dequantize, quant::eval_requantize)),
    (OpKind::Div, k!(elementwise::prepare_binary, elementwise::eval_div)),
    (OpKind::EmbeddingLookup, k!(embedding::prepare_embedding_lookup, embedding::eval_embedding_lookup)),
    (OpKind::Elu, k!(elementwise::prepare_unary, activation::eval_elu)),
    (OpKind::Equal, k!(elementwise::prepare_compare, elementwise::eval_equal)),
    (OpKind::Exp, k!(elementwise::prepare_unary, elementwise::eval_exp)),
    (OpKind::ExpandDims, k!(shape::prepare_expand_dims, shape::eval_copy)),
    (OpKind::Fill, k!(shape::prepare_fill, shape::eval_fill)),
    (OpKind::Floor, k!(elementwise::prepare_unary, elementwise::eval_floor)),
    (OpKind::FloorDiv, k!(elementwise::prepare_binary, elementwise::eval_floor_div)),
    (OpKind::FloorMod, k!(elementwise::prepare_binary, elementwise::eval_floor_mod)),
    (OpKind::FullyConnected, k!(matmul::prepare_fully_connected, matmul::eval_fully_connected)),
    (OpKind::Gather, k!(embedding::prepare_gather, embedding::eval_gather)),
    (OpKind::GatherNd, k!(embedding::prepare_gather_nd, embedding::eval_gather_nd)),
    (OpKind::Greater, k!(elementwise::prepare_compare, elementwise::eval_greater)),
    (OpKind::GreaterEqual, k!(elementwise::prepare_compare, elementwise::eval_greater_equal)),
    (OpKind::HardSwish, k!(elementwise::prepare_unary, activation::eval_hard_swish)),
    (OpKind::L2Normalization, k!(elementwise::prepare_unary, activation::eval_l2_normalization)),
    (OpKind::L2Pool2D, k!(pool::prepare_pool, pool::eval_l2_pool)),
    (OpKind::LeakyRelu, k!(elementwise::prepare_unary, activation::eval_leaky_relu)),
    (OpKind::Less, k!(elementwise::prepare_compare, elementwise::eval_less)),
    (OpKind::LessEqual, k!(elementwise::prepare_compare, elementwise::eval_less_equal)),
    (OpKind::Log, k!(elementwise::prepare_unary, elementwise::eval_log)),
    (OpKind::LogicalAnd, k!(elementwise::prepare_logical, elementwise::eval_logical_and)),
    (OpKind::LogicalNot, k!(elementwise::prepare_logical, elementwise::eval_logical_not)),
    (OpKind::LogicalOr, k!(elementwise::prepare_logical, elementwise::eval_logical_or)),
    (OpKind::Logistic, k!(elementwise::prepare_unary, activation::eval_logistic)),
    (OpKind::LogSoftmax, k!(activation::prepare_softmax, activation::eval_log_softmax)),
    (OpKind::Maximum, k!(elementwise::prepare_binary, elementwise::eval_maximum)),
    (OpKind::MaxPool2D, k!(pool::prepare_pool, pool::eval_max_pool)),
    (OpKind::MirrorPad, k!(shape::prepare_mirror_pad, shape::eval_mirror_pad)),
    (OpKind::Mean, k!(reduce::prepare_reduce, reduce::eval_mean)),
    (OpKind::Minimum, k!(elementwise::prepare_binary, elementwise::eval_minimum)),
    (OpKind::Mul, k!(elementwise::prepare_binary, elementwise::eval_mul)),
    (OpKind::Neg, k!(elementwise::prepare_unary, elementwise::eval_neg)),
    (OpKind::NotEqual, k!(elementwise::prepare_compare, elementwise::eval_not_equal)),
    (OpKind::Pack, k!(shape::prepare_pack, shape::eval_pack)),
    (OpKind::Pad, k!(shape::prepare_pad, shape::eval_pad)),
    (OpKind::PadV2, k!(shape::prepare_pad, shape::eval_pad)),
    (OpKind::Prelu, k!(activation::prepare_prelu, activation::eval_prelu)),
    (OpKind::Quantize, k!(quant::prepare_quantize, quant::eval_requantize)),
    (OpKind::ReduceMax, k!(reduce::prepare_reduce, reduce::eval_reduce_max)),
    (OpKind::Relu, k!(elementwise::prepare_unary, activation::eval_relu)),
    (OpKind::Relu6, k!(elementwise::prepare_unary, activation::eval_relu6)),
    (OpKind::Reshape, k!(shape::prepare_reshape, shape::eval_copy)),
    (OpKind::ResizeBilinear, k!(pool::prepare_resize, pool::eval_resize_bilinear)),
    (OpKind::ResizeNearestNeighbor, k!(pool::prepare_resize, pool::eval_resize_nearest)),
    (OpKind::Round, k!(elementwise::prepare_unary, elementwise::eval_round)),
    (OpKind::Rsqrt, k!(elementwise::prepare_unary, elementwise::eval_rsqrt)),
    (OpKind::SelectV2, k!(elementwise::prepare_select, elementwise::eval_select)),
    (OpKind::Shape, k!(shape::prepare_shape, shape::eval_shape)),
    (OpKind::Sin, k!(elementwise::prepare_unary, elementwise::eval_sin)),
    (OpKind::Slice, k!(shape::prepare_slice, shape::eval_slice)),
    (OpKind::Softmax, k!(activation::prepare_softmax, activation::eval_softmax)),
    (OpKind::SpaceToDepth, k!(shape::prepare_space_to_depth, shape::eval_space_to_depth)),
    (OpKind::Split, k!(shape::prepare_split, shape::eval_split)),
    (OpKind::SplitV, k!(shape::prepare_split, shape::eval_split)),
    (OpKind::Squeeze, k!(shape::prepare_squeeze, shape::eval_copy)),
    (OpKind::Sqrt, k!(elementwise::prepare_unary, elementwise::eval_sqrt)),
    (OpKind::Square, k!(elementwise::prepare_unary, elementwise::eval_square)),
    (OpKind::SquaredDifference, k!(elementwise::prepare_binary, elementwise::eval_squared_difference)),
    (OpKind::StridedSlice, k!(shape::prepare_strided_slice, shape::eval_strided_slice)),
    (OpKind::Sub, k!(elementwise::prepare_binary, elementwise::eval_sub)),
    (OpKind::Sum, k!(reduce::prepare_reduce, reduce::eval_sum)),
    (OpKind::Tanh, k!(elementwise::prepare_unary, activation::eval_tanh)),
    (OpKind::Transpose, k!(shape::prepare_transpose, shape::eval_transpose)),
    (OpKind::Unpack, k!(shape::prepare_unpack, shape::eval_unpack)),
    (OpKind::ZerosLike, k!(prepare_same_shape, shape::eval_zeros_like)),
];

/// Single-kernel harness for unit tests: every input is treated as constant
/// data, outputs and scratch are zeroed heap buffers.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) fn f32_tensor(shape: &[usize], values: &[f32]) -> (TensorDesc, Vec<u8>) {
        let desc = TensorDesc::new("t", DType::Float32, shape);
        (desc, values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    pub(crate) fn i32_tensor(shape: &[usize], values: &[i32]) -> (TensorDesc, Vec<u8>) {
        let desc = TensorDesc::new("t", DType::Int32, shape);
        (desc, values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    pub(crate) fn typed_tensor(desc: TensorDesc, real: &[f32]) -> (TensorDesc, Vec<u8>) {
        let mut data = vec![0u8; desc.nbytes()];
        TensorViewMut::new(&desc, &mut data).write_f32(real).unwrap();
        (desc, data)
    }

    pub(crate) fn f32_out(shape: &[usize]) -> TensorDesc {
        TensorDesc::new("out", DType::Float32, shape)
    }

    /// Runs prepare and eval, returning each output's dequantized values.
    pub(crate) fn run(
        kind: OpKind,
        params: &OpParams,
        inputs: &[(TensorDesc, Vec<u8>)],
        outputs: &[TensorDesc],
    ) -> Result<Vec<Vec<f32>>, String> {
        let raw = run_raw(kind, params, inputs, outputs)?;
        Ok(outputs
            .iter()
            .zip(&raw)
            .map(|(d, b)| TensorView::new(d, b).to_f32_vec())
            .collect())
    }

    /// Runs prepare and eval, returning each output's raw bytes.
    pub(crate) fn run_raw(
        kind: OpKind,
        params: &OpParams,
        inputs: &[(TensorDesc, Vec<u8>)],
        outputs: &[TensorDesc],
    ) -> Result<Vec<Vec<u8>>, String> {
        let kernel = kind.builtin_kernel().ok_or("no kernel")?;
        let code = OperatorCode::Builtin(kind);
        let in_infos = inputs
            .iter()
            .enumerate()
            .map(|(i, (d, b))| Some(TensorInfo { index: i, desc: d, data: Some(b.as_slice()) }))
            .collect();
        let out_infos = outputs
            .iter()
            .enumerate()
            .map(|(i, d)| TensorInfo { index: inputs.len() + i, desc: d, data: None })
            .collect();
        let mut pctx = PrepareContext::new(0, &code, params, in_infos, out_infos);
        (kernel.prepare)(&mut pctx).map_err(|e| e.to_string())?;
        let (inferred, scratch_bytes) = pctx.finish();
        for (desc, shape) in outputs.iter().zip(inferred) {
            if let Some(shape) = shape {
                if shape != desc.shape {
                    return Err(format!("inferred {:?}, declared {:?}", shape, desc.shape));
                }
            }
        }

        let mut bufs: Vec<Vec<u8>> = outputs.iter().map(|d| vec![0u8; d.nbytes()]).collect();
        let mut scratch = vec![0u8; scratch_bytes];
        {
            let views = inputs.iter().map(|(d, b)| Some(TensorView::new(d, b))).collect();
            let outs = outputs
                .iter()
                .zip(bufs.iter_mut())
                .map(|(d, b)| TensorViewMut::new(d, b))
                .collect();
            let mut ectx = EvalContext::new(0, &code, params, views, outs, &mut scratch);
            (kernel.eval)(&mut ectx).map_err(|e| e.to_string())?;
        }
        Ok(bufs)
    }
}
