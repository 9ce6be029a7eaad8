//! Benchmark: invoke latency of float and int8 fully-connected stacks.

use std::time::Instant;

use picolite_edge::{
    Activation, DType, Interpreter, Model, ModelBuilder, OpKind, OpParams, OpRegistry, Quantization, TensorDesc,
};

/// `layers` FullyConnected(relu) layers of width `d`.
fn mlp(d: usize, layers: usize, int8: bool) -> Vec<u8> {
    let desc = |name: &str, shape: &[usize]| {
        if int8 {
            TensorDesc::new(name, DType::Int8, shape).with_quant(Quantization::per_tensor(0.05, 0))
        } else {
            TensorDesc::new(name, DType::Float32, shape)
        }
    };
    let mut b = ModelBuilder::new("mlp");
    let mut prev = b.add_tensor(desc("x", &[1, d]));
    b.set_inputs(&[prev]);
    for l in 0..layers {
        let weights: Vec<f32> = (0..d * d).map(|i| ((i * 7 + l) % 13) as f32 * 0.01 - 0.06).collect();
        let w = b.add_const_quantized(desc(&format!("w{}", l), &[d, d]), &weights);
        let y = b.add_tensor(desc(&format!("h{}", l), &[1, d]));
        let params = OpParams::default().with_activation(Activation::Relu);
        b.add_node(OpKind::FullyConnected, &[prev as i32, w as i32], &[y], params);
        prev = y;
    }
    b.set_outputs(&[prev]);
    b.to_bytes().expect("serialize model")
}

fn bench(bytes: &[u8], iters: usize) -> (f64, usize) {
    let model = Model::from_bytes(bytes).expect("valid model");
    let mut reg = OpRegistry::new();
    reg.register(OpKind::FullyConnected).expect("register");
    let mut interp = Interpreter::new(&model, &reg, 1 << 20);
    interp.allocate_tensors().expect("allocate");
    let d = interp.input(0).map_or(0, |t| t.numel());
    let input: Vec<f32> = (0..d).map(|i| (i % 5) as f32 * 0.1).collect();
    if let Some(mut t) = interp.input_mut(0) {
        t.write_f32(&input).expect("write input");
    }
    interp.invoke().expect("warmup");

    let start = Instant::now();
    for _ in 0..iters {
        interp.invoke().expect("invoke");
    }
    (start.elapsed().as_secs_f64() / iters as f64, interp.arena_used_bytes())
}

fn main() {
    println!("=== picolite invoke benchmark ===\n");
    println!("{:<10} {:>8} {:>14} {:>14} {:>12}", "Width", "Layers", "f32 (us)", "int8 (us)", "Arena (B)");
    println!("{}", "-".repeat(62));

    for &(d, layers) in &[(16, 4), (64, 4), (128, 8), (256, 8)] {
        let iters = (200_000 / (d * d * layers)).max(10);
        let (f32_secs, arena) = bench(&mlp(d, layers, false), iters);
        let (i8_secs, _) = bench(&mlp(d, layers, true), iters);
        println!(
            "{:<10} {:>8} {:>14.2} {:>14.2} {:>12}",
            d,
            layers,
            f32_secs * 1e6,
            i8_secs * 1e6,
            arena
        );
    }
}
