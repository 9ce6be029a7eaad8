use std::path::Path;
use std::time::Instant;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use picolite_edge::{
    Activation, DType, Interpreter, Model, ModelBuilder, OpKind, OpParams, Padding, Quantization,
    RuntimeConfig, TensorDesc,
};

#[derive(Parser)]
#[command(
    name = "picolite",
    about = "picolite model tools",
    long_about = "Inspect, run and benchmark .plite models with the static-memory interpreter.",
    version,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Print a model's tensors, nodes and graph I/O
    Inspect {
        /// Path to a .plite file
        model: String,
    },
    /// Allocate and invoke a model once (or N times)
    Run {
        model: String,
        /// Arena size in bytes (overrides the config)
        #[arg(long)]
        arena: Option<usize>,
        /// JSON runtime config: arena_size, registry_capacity, ops
        #[arg(long)]
        config: Option<String>,
        /// Comma-separated values for input 0 (zeros if omitted)
        #[arg(long)]
        input: Option<String>,
        /// Number of invocations
        #[arg(long, default_value = "1")]
        repeat: usize,
    },
    /// Measure invoke latency
    Bench {
        model: String,
        #[arg(long, default_value = "100")]
        iters: usize,
        #[arg(long)]
        arena: Option<usize>,
    },
    /// List operator kinds and whether a built-in kernel exists
    Ops,
    /// Write a small demonstration model
    Sample {
        /// Output .plite file path
        #[arg(long, default_value = "sample.plite")]
        output: String,
        /// Emit an int8-quantized model instead of float32
        #[arg(long)]
        int8: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Inspect { model } => cmd_inspect(&model),
        Commands::Run { model, arena, config, input, repeat } => {
            cmd_run(&model, arena, config.as_deref(), input.as_deref(), repeat)
        }
        Commands::Bench { model, iters, arena } => cmd_bench(&model, iters, arena),
        Commands::Ops => {
            cmd_ops();
            Ok(())
        }
        Commands::Sample { output, int8 } => cmd_sample(&output, int8),
    };
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn read_model(path: &str) -> Result<Vec<u8>, String> {
    std::fs::read(path).map_err(|e| format!("cannot read {}: {}", path, e))
}

fn load_config(path: Option<&str>, arena: Option<usize>) -> Result<RuntimeConfig, String> {
    let mut cfg = match path {
        Some(p) => RuntimeConfig::from_json_file(p).map_err(|e| e.to_string())?,
        None => RuntimeConfig::default(),
    };
    if let Some(a) = arena {
        cfg.arena_size = a;
    }
    Ok(cfg)
}

fn fmt_quant(q: Option<&Quantization>) -> String {
    match q {
        None => String::new(),
        Some(q) if q.is_per_channel() => format!(" q[{} ch, dim {}]", q.scale.len(), q.quantized_dimension),
        Some(q) => format!(" q[scale={}, zp={}]", q.scale[0], q.zero_point[0]),
    }
}

fn cmd_inspect(path: &str) -> Result<(), String> {
    let bytes = read_model(path)?;
    let model = Model::from_bytes(&bytes).map_err(|e| e.to_string())?;

    println!("=== {} ===", path);
    println!("Version:     {}", model.version());
    if !model.description().is_empty() {
        println!("Description: {}", model.description());
    }
    println!("Size:        {} bytes", bytes.len());

    println!("\nTensors ({})", model.num_tensors());
    for (i, t) in model.tensors().iter().enumerate() {
        let kind = if t.is_constant() { "const" } else { "" };
        println!(
            "  {:>3} {:<20} {:<8} {:<16} {:>8} B {}{}",
            i,
            t.name,
            t.dtype,
            format!("{:?}", t.shape),
            t.nbytes(),
            kind,
            fmt_quant(t.quant.as_ref())
        );
    }

    println!("\nNodes ({})", model.num_nodes());
    for (i, n) in model.nodes().iter().enumerate() {
        println!("  {:>3} {:<24} in={:?} out={:?}", i, n.op.to_string(), n.inputs, n.outputs);
    }

    println!("\nInputs:  {:?}", model.inputs());
    println!("Outputs: {:?}", model.outputs());
    Ok(())
}

fn parse_values(text: &str) -> Result<Vec<f32>, String> {
    text.split(',')
        .map(|s| s.trim().parse::<f32>().map_err(|e| format!("bad input value '{}': {}", s.trim(), e)))
        .collect()
}

fn cmd_run(
    path: &str,
    arena: Option<usize>,
    config: Option<&str>,
    input: Option<&str>,
    repeat: usize,
) -> Result<(), String> {
    let cfg = load_config(config, arena)?;
    let registry = cfg.build_registry().map_err(|e| e.to_string())?;
    let bytes = read_model(path)?;
    let model = Model::from_bytes(&bytes).map_err(|e| e.to_string())?;

    let mut interp = Interpreter::new(&model, &registry, cfg.arena_size);
    interp.allocate_tensors().map_err(|e| e.to_string())?;

    if let Some(text) = input {
        let values = parse_values(text)?;
        let mut t = interp.input_mut(0).ok_or("model has no inputs")?;
        t.write_f32(&values).map_err(|e| e.to_string())?;
    }

    for _ in 0..repeat.max(1) {
        interp.invoke().map_err(|e| e.to_string())?;
    }

    for n in 0..interp.outputs_size() {
        if let Some(t) = interp.output(n) {
            println!("output {} {} {:?} = {:?}", n, t.dtype(), t.shape(), t.to_f32_vec());
        }
    }
    println!(
        "arena: {} / {} bytes used",
        interp.arena_used_bytes(),
        interp.arena_capacity()
    );
    Ok(())
}

fn cmd_bench(path: &str, iters: usize, arena: Option<usize>) -> Result<(), String> {
    let cfg = load_config(None, arena)?;
    let registry = cfg.build_registry().map_err(|e| e.to_string())?;
    let bytes = read_model(path)?;
    let model = Model::from_bytes(&bytes).map_err(|e| e.to_string())?;
    let mut interp = Interpreter::new(&model, &registry, cfg.arena_size);
    interp.allocate_tensors().map_err(|e| e.to_string())?;

    // Warmup
    interp.invoke().map_err(|e| e.to_string())?;

    let iters = iters.max(1);
    let start = Instant::now();
    for _ in 0..iters {
        interp.invoke().map_err(|e| e.to_string())?;
    }
    let secs = start.elapsed().as_secs_f64() / iters as f64;

    println!("=== picolite bench: {} ===", path);
    println!("nodes:   {}", model.num_nodes());
    println!("arena:   {} bytes", interp.arena_used_bytes());
    println!("iters:   {}", iters);
    println!("invoke:  {:.2} us", secs * 1e6);
    Ok(())
}

fn cmd_ops() {
    let mut builtin = 0;
    for kind in OpKind::ALL {
        let has = kind.builtin_kernel().is_some();
        builtin += has as usize;
        println!("  {:<28} {}", kind.name(), if has { "[x]" } else { "[ ]" });
    }
    println!("\n{} kinds, {} with built-in kernels", OpKind::COUNT, builtin);
}

/// Conv2D(relu) → MaxPool → Reshape → FullyConnected → Softmax on a 4x4 image.
fn sample_model(int8: bool) -> Result<Vec<u8>, String> {
    let desc = |name: &str, shape: &[usize], scale: f32| {
        if int8 {
            TensorDesc::new(name, DType::Int8, shape).with_quant(Quantization::per_tensor(scale, 0))
        } else {
            TensorDesc::new(name, DType::Float32, shape)
        }
    };
    let mut b = ModelBuilder::new(if int8 { "sample-int8" } else { "sample-f32" });
    let x = b.add_tensor(desc("image", &[1, 4, 4, 1], 1.0 / 64.0));
    let filter: Vec<f32> = (0..8).map(|i| (i as f32 - 3.5) * 0.25).collect();
    let f = b.add_const_quantized(desc("conv_w", &[2, 2, 2, 1], 1.0 / 64.0), &filter);
    let c = b.add_tensor(desc("conv", &[1, 4, 4, 2], 1.0 / 32.0));
    let p = b.add_tensor(desc("pool", &[1, 2, 2, 2], 1.0 / 32.0));
    let r = b.add_tensor(desc("flat", &[1, 8], 1.0 / 32.0));
    let weights: Vec<f32> = (0..24).map(|i| ((i * 7 % 11) as f32 - 5.0) * 0.1).collect();
    let w = b.add_const_quantized(desc("fc_w", &[3, 8], 1.0 / 128.0), &weights);
    let logits = b.add_tensor(desc("logits", &[1, 3], 1.0 / 16.0));
    let probs = b.add_tensor(desc("probs", &[1, 3], 1.0 / 128.0));

    let conv = OpParams { padding: Padding::Same, ..Default::default() }
        .with_activation(Activation::Relu);
    b.add_node(OpKind::Conv2D, &[x as i32, f as i32], &[c], conv);
    let pool = OpParams { filter: Some([2, 2]), stride: Some([2, 2]), ..Default::default() };
    b.add_node(OpKind::MaxPool2D, &[c as i32], &[p], pool);
    b.add_node(OpKind::Reshape, &[p as i32], &[r], OpParams::default().with_new_shape(&[1, -1]));
    b.add_node(OpKind::FullyConnected, &[r as i32, w as i32], &[logits], OpParams::default());
    b.add_node(OpKind::Softmax, &[logits as i32], &[probs], OpParams::default());
    b.set_inputs(&[x]);
    b.set_outputs(&[probs]);
    b.to_bytes().map_err(|e| e.to_string())
}

fn cmd_sample(output: &str, int8: bool) -> Result<(), String> {
    let bytes = sample_model(int8)?;
    // Verify before writing so a broken builder never produces a file.
    Model::from_bytes(&bytes).map_err(|e| e.to_string())?;
    std::fs::write(Path::new(output), &bytes).map_err(|e| format!("cannot write {}: {}", output, e))?;
    println!("wrote {} ({} bytes)", output, bytes.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_values() {
        assert_eq!(parse_values("1, 2.5,-3").unwrap(), vec![1.0, 2.5, -3.0]);
        assert!(parse_values("1,x").is_err());
    }

    #[test]
    fn test_sample_models_run() {
        for int8 in [false, true] {
            let bytes = sample_model(int8).unwrap();
            let model = Model::from_bytes(&bytes).unwrap();
            let registry = RuntimeConfig::default().build_registry().unwrap();
            let mut interp = Interpreter::new(&model, &registry, 4096);
            interp.allocate_tensors().unwrap();
            interp.invoke().unwrap();
            let probs = interp.output(0).unwrap().to_f32_vec();
            assert!((probs.iter().sum::<f32>() - 1.0).abs() < 0.05, "{:?}", probs);
        }
    }

    #[test]
    fn test_config_arena_override() {
        let cfg = load_config(None, Some(512)).unwrap();
        assert_eq!(cfg.arena_size, 512);
    }
}
