//! Property tests over loading, planning and invoking.

use picolite_edge::arena::ARENA_ALIGN;
use picolite_edge::{
    DType, GreedyMemoryPlanner, Interpreter, Model, ModelBuilder, OpKind, OpParams, OpRegistry, Padding,
    Quantization, TensorDesc,
};
use proptest::prelude::*;

/// A chain of unary and binary nodes over tensors of `len` elements.
fn chain_model(kinds: &[OpKind], len: usize, constant: &[f32]) -> Vec<u8> {
    let mut b = ModelBuilder::new("chain");
    let mut prev = b.add_tensor(TensorDesc::new("x", DType::Float32, &[len]));
    b.set_inputs(&[prev]);
    let c = b.add_const_f32("c", &[len], constant);
    for (i, &kind) in kinds.iter().enumerate() {
        let next = b.add_tensor(TensorDesc::new(&format!("t{}", i), DType::Float32, &[len]));
        let inputs: Vec<i32> = match kind {
            OpKind::Add | OpKind::Mul | OpKind::Maximum => vec![prev as i32, c as i32],
            _ => vec![prev as i32],
        };
        b.add_node(kind, &inputs, &[next], OpParams::default());
        prev = next;
    }
    b.set_outputs(&[prev]);
    b.to_bytes().unwrap()
}

fn op_strategy() -> impl Strategy<Value = OpKind> {
    prop_oneof![
        Just(OpKind::Relu),
        Just(OpKind::Tanh),
        Just(OpKind::Abs),
        Just(OpKind::Add),
        Just(OpKind::Mul),
        Just(OpKind::Maximum),
    ]
}

fn all_builtins() -> OpRegistry {
    let mut reg = OpRegistry::new();
    reg.register_all_builtins().unwrap();
    reg
}

fn extreme_usize() -> impl Strategy<Value = usize> {
    prop_oneof![0usize..5, Just(usize::MAX), Just(usize::MAX / 2), Just(isize::MAX as usize), any::<usize>()]
}

fn extreme_i64() -> impl Strategy<Value = i64> {
    prop_oneof![-4i64..5, Just(i64::MIN), Just(i64::MAX), Just(-1), any::<i64>()]
}

fn extreme_pair() -> impl Strategy<Value = [usize; 2]> {
    (extreme_usize(), extreme_usize()).prop_map(|(a, b)| [a, b])
}

fn extreme_vec() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(extreme_i64(), 0..5)
}

prop_compose! {
    fn window_params()(
        stride in prop::option::of(extreme_pair()),
        dilation in prop::option::of(extreme_pair()),
        filter in prop::option::of(extreme_pair()),
        depth_multiplier in prop::option::of(extreme_usize()),
        same in any::<bool>(),
    ) -> OpParams {
        let padding = if same { Padding::Same } else { Padding::Valid };
        OpParams { stride, dilation, filter, depth_multiplier, padding, ..Default::default() }
    }
}

prop_compose! {
    fn layout_params()(
        axis in prop::option::of(prop_oneof![-5i32..5, Just(i32::MIN), Just(i32::MAX)]),
        axes in prop::collection::vec(prop_oneof![-5i32..5, Just(i32::MIN), Just(i32::MAX)], 0..4),
        new_shape in extreme_vec(),
        begin in extreme_vec(),
        size in extreme_vec(),
        end in extreme_vec(),
        strides in extreme_vec(),
        masks in (any::<u32>(), any::<u32>(), any::<u32>()),
        paddings in prop::collection::vec(extreme_pair(), 0..5),
        block_size in prop::option::of(extreme_usize()),
        size_splits in extreme_vec(),
    ) -> OpParams {
        let (begin_mask, end_mask, shrink_axis_mask) = masks;
        OpParams {
            axis,
            axes,
            new_shape,
            begin,
            size,
            end,
            strides,
            begin_mask,
            end_mask,
            shrink_axis_mask,
            paddings,
            block_size,
            size_splits,
            ..Default::default()
        }
    }
}

fn hostile_op() -> impl Strategy<Value = OpKind> {
    prop_oneof![
        Just(OpKind::Pad),
        Just(OpKind::MirrorPad),
        Just(OpKind::Reshape),
        Just(OpKind::Slice),
        Just(OpKind::StridedSlice),
        Just(OpKind::SpaceToDepth),
        Just(OpKind::DepthToSpace),
        Just(OpKind::Concatenation),
        Just(OpKind::Mean),
        Just(OpKind::Split),
        Just(OpKind::SplitV),
        Just(OpKind::BroadcastTo),
    ]
}

fn window_op() -> impl Strategy<Value = OpKind> {
    prop_oneof![
        Just(OpKind::Conv2D),
        Just(OpKind::DepthwiseConv2D),
        Just(OpKind::MaxPool2D),
        Just(OpKind::AveragePool2D),
    ]
}

fn small_shape(rank: std::ops::Range<usize>) -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1usize..5, rank)
}

/// One node reading `x` (plus a constant filter for convolutions) and
/// writing `outputs` with the given declared shapes.
fn single_node_model(kind: OpKind, params: OpParams, x: &[usize], filter: &[usize], outputs: &[Vec<usize>]) -> Vec<u8> {
    let mut b = ModelBuilder::new("hostile");
    let input = b.add_tensor(TensorDesc::new("x", DType::Float32, x));
    let mut inputs = vec![input as i32];
    if matches!(kind, OpKind::Conv2D | OpKind::DepthwiseConv2D) {
        let values = vec![0.5f32; filter.iter().product()];
        inputs.push(b.add_const_f32("f", filter, &values) as i32);
    }
    if kind == OpKind::Concatenation {
        inputs.push(input as i32);
    }
    let outs: Vec<usize> = outputs
        .iter()
        .enumerate()
        .map(|(i, shape)| b.add_tensor(TensorDesc::new(&format!("y{}", i), DType::Float32, shape)))
        .collect();
    b.add_node(kind, &inputs, &outs, params);
    b.set_inputs(&[input]);
    b.set_outputs(&outs);
    b.to_bytes().unwrap()
}

/// Loading, planning and invoking either succeed or report an error.
fn run_without_panicking(bytes: &[u8]) {
    let Ok(model) = Model::from_bytes(bytes) else {
        return;
    };
    let reg = all_builtins();
    let mut interp = Interpreter::new(&model, &reg, 64 * 1024);
    if interp.allocate_tensors().is_ok() {
        let _ = interp.invoke();
    }
}

proptest! {
    #[test]
    fn prop_extreme_layout_params_never_panic(
        kind in hostile_op(),
        params in layout_params(),
        x in small_shape(1..5),
        outputs in prop::collection::vec(small_shape(0..5), 1..3),
    ) {
        let outputs = if matches!(kind, OpKind::Split | OpKind::SplitV) { outputs } else { outputs[..1].to_vec() };
        run_without_panicking(&single_node_model(kind, params, &x, &[], &outputs));
    }

    #[test]
    fn prop_extreme_window_params_never_panic(
        kind in window_op(),
        params in window_params(),
        x in small_shape(4..5),
        filter in small_shape(4..5),
        out in small_shape(4..5),
    ) {
        run_without_panicking(&single_node_model(kind, params, &x, &filter, &[out]));
    }

    #[test]
    fn prop_every_prefix_is_rejected(
        kinds in prop::collection::vec(op_strategy(), 1..6),
        len in 1usize..16,
        cut in 0.0f64..1.0,
    ) {
        let constant: Vec<f32> = (0..len).map(|i| i as f32).collect();
        let bytes = chain_model(&kinds, len, &constant);
        let model = Model::from_bytes(&bytes).unwrap();
        prop_assert_eq!(model.num_nodes(), kinds.len());
        prop_assert_eq!(model.num_tensors(), kinds.len() + 2);
        let prefix = ((bytes.len() as f64) * cut) as usize;
        prop_assert!(Model::from_bytes(&bytes[..prefix.min(bytes.len() - 1)]).is_err());
    }

    #[test]
    fn prop_garbage_never_panics(mut bytes in prop::collection::vec(any::<u8>(), 0..256), magic in any::<bool>()) {
        if magic && bytes.len() >= 12 {
            bytes[..4].copy_from_slice(b"PLTE");
            bytes[4..8].copy_from_slice(&1u32.to_le_bytes());
        }
        let _ = Model::from_bytes(&bytes);
    }

    #[test]
    fn prop_planner_never_collides(
        reqs in prop::collection::vec((1usize..512, 0usize..10, 0usize..10), 1..24),
    ) {
        let mut planner = GreedyMemoryPlanner::new();
        for &(size, a, b) in &reqs {
            planner.add_buffer(size, a.min(b), a.max(b));
        }
        let high_water = planner.plan();
        for i in 0..reqs.len() {
            let ri = planner.request(i).unwrap();
            let oi = planner.offset(i).unwrap();
            prop_assert_eq!(oi % ARENA_ALIGN, 0);
            prop_assert!(oi + ri.size <= high_water);
            for j in i + 1..reqs.len() {
                let rj = planner.request(j).unwrap();
                let oj = planner.offset(j).unwrap();
                let live = ri.first_use <= rj.last_use && rj.first_use <= ri.last_use;
                let space = oi < oj + rj.size && oj < oi + ri.size;
                prop_assert!(!(live && space));
            }
        }
        for step in 0..10 {
            prop_assert!(planner.live_bytes_at(step) <= high_water);
        }
    }

    #[test]
    fn prop_live_bytes_within_arena(
        kinds in prop::collection::vec(op_strategy(), 1..8),
        len in 1usize..64,
        arena in 64usize..4096,
    ) {
        let constant = vec![0.5f32; len];
        let bytes = chain_model(&kinds, len, &constant);
        let model = Model::from_bytes(&bytes).unwrap();
        let reg = all_builtins();
        let mut interp = Interpreter::new(&model, &reg, arena);
        if interp.allocate_tensors().is_ok() {
            prop_assert!(interp.arena_used_bytes() <= arena);
            let plan = interp.plan().unwrap();
            for step in 0..plan.steps().len() {
                prop_assert!(plan.peak_live_bytes(step).unwrap() <= arena);
            }
        }
    }

    #[test]
    fn prop_invoke_is_idempotent(
        kinds in prop::collection::vec(op_strategy(), 1..6),
        input in prop::collection::vec(-10.0f32..10.0, 1..32),
    ) {
        let constant: Vec<f32> = input.iter().map(|v| v * 0.5 - 1.0).collect();
        let bytes = chain_model(&kinds, input.len(), &constant);
        let model = Model::from_bytes(&bytes).unwrap();
        let reg = all_builtins();
        let mut interp = Interpreter::new(&model, &reg, 16 * 1024);
        interp.allocate_tensors().unwrap();
        interp.input_mut(0).unwrap().write_f32(&input).unwrap();
        interp.invoke().unwrap();
        let first = interp.output(0).unwrap().bytes().to_vec();
        interp.invoke().unwrap();
        prop_assert_eq!(interp.output(0).unwrap().bytes(), &first[..]);
    }

    #[test]
    fn prop_quantize_dequantize_within_half_scale(
        values in prop::collection::vec(-3.0f32..3.0, 1..32),
        scale in 0.02f32..0.1,
        zero_point in -20i64..20,
    ) {
        let n = values.len();
        let mut b = ModelBuilder::new("qdq");
        let x = b.add_tensor(TensorDesc::new("x", DType::Float32, &[n]));
        let q = b.add_tensor(
            TensorDesc::new("q", DType::Int8, &[n]).with_quant(Quantization::per_tensor(scale, zero_point)),
        );
        let y = b.add_tensor(TensorDesc::new("y", DType::Float32, &[n]));
        b.add_node(OpKind::Quantize, &[x as i32], &[q], OpParams::default());
        b.add_node(OpKind::Dequantize, &[q as i32], &[y], OpParams::default());
        b.set_inputs(&[x]);
        b.set_outputs(&[y]);
        let bytes = b.to_bytes().unwrap();

        let model = Model::from_bytes(&bytes).unwrap();
        let reg = all_builtins();
        let mut interp = Interpreter::new(&model, &reg, 1024);
        interp.allocate_tensors().unwrap();
        interp.input_mut(0).unwrap().write_f32(&values).unwrap();
        interp.invoke().unwrap();
        let out = interp.output(0).unwrap().to_f32_vec();
        let lo = (-128 - zero_point) as f32 * scale;
        let hi = (127 - zero_point) as f32 * scale;
        for (v, o) in values.iter().zip(&out) {
            let expected = v.clamp(lo, hi);
            prop_assert!((expected - o).abs() <= scale / 2.0 + 1e-5, "{} -> {}", v, o);
        }
    }
}
