//! Invoke must run without touching the heap once tensors are allocated.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;

use picolite_edge::{
    Activation, DType, Interpreter, Model, ModelBuilder, OpKind, OpParams, OpRegistry, Padding, Quantization,
    TensorDesc, MAX_NODE_INPUTS,
};

struct CountingAlloc;

thread_local! {
    static COUNTING: Cell<bool> = const { Cell::new(false) };
    static ALLOCATIONS: Cell<usize> = const { Cell::new(0) };
}

fn record() {
    let _ = COUNTING.try_with(|on| {
        if on.get() {
            let _ = ALLOCATIONS.try_with(|n| n.set(n.get() + 1));
        }
    });
}

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        record();
        System.alloc(layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        record();
        System.alloc_zeroed(layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        record();
        System.realloc(ptr, layout, new_size)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }
}

#[global_allocator]
static GLOBAL: CountingAlloc = CountingAlloc;

/// Heap allocations made by this thread while `f` runs.
fn allocations_during<T>(f: impl FnOnce() -> T) -> (T, usize) {
    ALLOCATIONS.with(|n| n.set(0));
    COUNTING.with(|on| on.set(true));
    let out = f();
    COUNTING.with(|on| on.set(false));
    (out, ALLOCATIONS.with(Cell::get))
}

fn all_builtins() -> OpRegistry {
    let mut reg = OpRegistry::new();
    reg.register_all_builtins().unwrap();
    reg
}

fn f32_desc(name: &str, shape: &[usize]) -> TensorDesc {
    TensorDesc::new(name, DType::Float32, shape)
}

/// Wide nodes: concatenation and AddN over many operands, plus BroadcastArgs.
fn wide_model() -> Vec<u8> {
    let mut b = ModelBuilder::new("wide");
    let x = b.add_tensor(f32_desc("x", &[4]));
    let c = b.add_const_f32("c", &[4], &[1.0, 2.0, 3.0, 4.0]);
    let cat = b.add_tensor(f32_desc("cat", &[20]));
    let sum = b.add_tensor(f32_desc("sum", &[4]));
    let wide = b.add_tensor(f32_desc("wide", &[4]));
    let sa = b.add_const_i32("sa", &[3], &[2, 1, 3]);
    let sb = b.add_const_i32("sb", &[2], &[4, 1]);
    let shape = b.add_tensor(TensorDesc::new("shape", DType::Int32, &[3]));
    let (xi, ci) = (x as i32, c as i32);
    b.add_node(OpKind::Concatenation, &[xi, ci, xi, ci, xi], &[cat], OpParams::default());
    b.add_node(OpKind::AddN, &[xi, xi, xi, ci, ci, ci], &[sum], OpParams::default());
    let many: Vec<i32> = (0..MAX_NODE_INPUTS).map(|i| if i % 2 == 0 { xi } else { ci }).collect();
    b.add_node(OpKind::AddN, &many, &[wide], OpParams::default());
    b.add_node(OpKind::BroadcastArgs, &[sa as i32, sb as i32], &[shape], OpParams::default());
    b.set_inputs(&[x]);
    b.set_outputs(&[cat, sum, wide, shape]);
    b.to_bytes().unwrap()
}

/// Quantized conv, pooling, reduction with scratch, FC and softmax.
fn int8_model() -> Vec<u8> {
    let q = |name: &str, shape: &[usize], scale: f32| {
        TensorDesc::new(name, DType::Int8, shape).with_quant(Quantization::per_tensor(scale, 0))
    };
    let mut b = ModelBuilder::new("int8");
    let x = b.add_tensor(q("x", &[1, 4, 4, 1], 1.0 / 64.0));
    let filter: Vec<f32> = (0..8).map(|i| (i as f32 - 3.5) * 0.25).collect();
    let f = b.add_const_quantized(q("f", &[2, 2, 2, 1], 1.0 / 64.0), &filter);
    let conv = b.add_tensor(q("conv", &[1, 4, 4, 2], 1.0 / 32.0));
    let pool = b.add_tensor(q("pool", &[1, 2, 2, 2], 1.0 / 32.0));
    let mean = b.add_tensor(q("mean", &[1, 2], 1.0 / 32.0));
    let w = b.add_const_quantized(q("w", &[3, 2], 1.0 / 128.0), &[0.5, -0.5, 0.25, 0.25, -0.75, 0.1]);
    let logits = b.add_tensor(q("logits", &[1, 3], 1.0 / 16.0));
    let probs = b.add_tensor(q("probs", &[1, 3], 1.0 / 128.0));

    let conv_params = OpParams { padding: Padding::Same, ..Default::default() }.with_activation(Activation::Relu);
    b.add_node(OpKind::Conv2D, &[x as i32, f as i32], &[conv], conv_params);
    let pool_params = OpParams { filter: Some([2, 2]), stride: Some([2, 2]), ..Default::default() };
    b.add_node(OpKind::MaxPool2D, &[conv as i32], &[pool], pool_params);
    let mean_params = OpParams { axes: vec![1, 2], ..Default::default() };
    b.add_node(OpKind::Mean, &[pool as i32], &[mean], mean_params);
    b.add_node(OpKind::FullyConnected, &[mean as i32, w as i32], &[logits], OpParams::default());
    b.add_node(OpKind::Softmax, &[logits as i32], &[probs], OpParams::default());
    b.set_inputs(&[x]);
    b.set_outputs(&[probs]);
    b.to_bytes().unwrap()
}

#[test]
fn test_wide_nodes_invoke_without_allocating() {
    let bytes = wide_model();
    let model = Model::from_bytes(&bytes).unwrap();
    let reg = all_builtins();
    let mut interp = Interpreter::new(&model, &reg, 4096);
    interp.allocate_tensors().unwrap();
    interp.input_mut(0).unwrap().write_f32(&[1.0, -1.0, 0.5, 2.0]).unwrap();
    // first invoke registers logging callsites
    interp.invoke().unwrap();

    let (result, allocations) = allocations_during(|| interp.invoke());
    result.unwrap();
    assert_eq!(allocations, 0);

    assert_eq!(interp.output(1).unwrap().to_f32_vec(), vec![6.0, 3.0, 10.5, 18.0]);
    assert_eq!(interp.output(2).unwrap().to_f32_vec(), vec![16.0, 8.0, 28.0, 48.0]);
    assert_eq!(interp.output(3).unwrap().to_f32_vec(), vec![2.0, 4.0, 3.0]);
    let cat = interp.output(0).unwrap().to_f32_vec();
    assert_eq!(&cat[..8], &[1.0, -1.0, 0.5, 2.0, 1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_quantized_pipeline_invokes_without_allocating() {
    let bytes = int8_model();
    let model = Model::from_bytes(&bytes).unwrap();
    let reg = all_builtins();
    let mut interp = Interpreter::new(&model, &reg, 4096);
    interp.allocate_tensors().unwrap();
    let image: Vec<f32> = (0..16).map(|i| i as f32 / 32.0).collect();
    interp.input_mut(0).unwrap().write_f32(&image).unwrap();
    interp.invoke().unwrap();

    for _ in 0..3 {
        let (result, allocations) = allocations_during(|| interp.invoke());
        result.unwrap();
        assert_eq!(allocations, 0);
    }
    let probs = interp.output(0).unwrap().to_f32_vec();
    assert!((probs.iter().sum::<f32>() - 1.0).abs() < 0.05, "{:?}", probs);
}

#[test]
fn test_counter_sees_allocations() {
    let (v, allocations) = allocations_during(|| vec![0u8; 64]);
    assert_eq!(v.len(), 64);
    assert!(allocations >= 1);
}
