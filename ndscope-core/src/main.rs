//! ndscope - scope tree demo runner
//!
//! Builds a small scope tree on the configured engine, runs a few
//! operators, closes everything and logs the lifecycle counters.

use anyhow::Result;
use ndscope_core::{init, DataType, EngineConfig, OpParams, ResourceScope, Shape};
use tracing::info;

fn print_help() {
    println!("ndscope - Hierarchical Native Array Lifetimes v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  ndscope [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("  -h, --help       Print this help message");
    println!("  -v, --version    Print version information");
    println!();
    println!("ENVIRONMENT:");
    println!("  NDSCOPE_CONFIG       JSON config file");
    println!("  NDSCOPE_DEVICE       Default device, e.g. cpu(0) or gpu(1)");
    println!("  NDSCOPE_ENGINE_LIB   Native engine shared library");
    println!("  NDSCOPE_LOG          Log filter when RUST_LOG is unset");
    println!("  NDSCOPE_SEED         Seed for the host engine");
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    for arg in &args[1..] {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            "-v" | "--version" => {
                println!("ndscope {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            _ => {
                eprintln!("error: unrecognized argument '{}'", arg);
                eprintln!("Run 'ndscope --help' for usage information.");
                std::process::exit(1);
            }
        }
    }

    let config = EngineConfig::from_env();
    init(&config)?;

    let root = ResourceScope::install_root(&config)?;
    info!(engine = root.dispatcher().name(), "Root scope ready");

    let session = root.new_sub_scope(None)?;
    let batch = session.new_sub_scope(None)?;

    let shape = Shape::from([2, 3]);
    let ones = session.ones(None, &shape, DataType::Float32)?;
    let steps = session.arange(0, 6, 1, None, DataType::Float32)?;
    info!(values = ?steps.to_vec::<f32>()?, "arange");

    let noise = batch.random_normal(0.0, 1.0, &shape, None, DataType::Float32)?;
    let sum = batch.invoke("elemwise_add", &[&*ones, &*noise], &OpParams::new());
    match sum {
        Ok(outputs) => info!(outputs = outputs.len(), "elemwise_add"),
        Err(err) => info!(%err, "elemwise_add not supported by this engine"),
    }
    info!(session = session.live_count(), batch = batch.live_count(), "Live arrays");

    if let Some(report) = session.close_with_report() {
        info!(released = report.released, failures = report.failures.len(), "Session closed");
    }
    info!(batch_open = batch.is_open(), "Nested scope state");

    info!("{}", root.metrics().snapshot().summary());
    Ok(())
}
