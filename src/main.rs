//! Cloud Segmentation CLI
//!
//! Entry point for running the U-Net cloud segmentation pipeline, inspecting
//! the network schedule, producing parameter sets and benchmarking.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tracing::{debug, info};

use cloudseg::backend::{backend_name, default_device, DefaultBackend};
use cloudseg::config::{ENV_OUTPUT_DIR, ENV_WEIGHTS_PATH};
use cloudseg::inference::{run_benchmark, BenchmarkConfig};
use cloudseg::model::{load_network, parameter_specs, BoundNetwork, NamedTensor, ParameterSet, UNetConfig};
use cloudseg::utils::logging::{init_logging, LogConfig, LogLevel};
use cloudseg::utils::{format_millis, format_number};
use cloudseg::{PipelineConfig, SegmentationPipeline, INPUT_SIZE};

/// U-Net Cloud Segmentation
///
/// Segments clouds in satellite imagery and reports the cloud coverage,
/// using the Burn framework on CPU or CUDA.
#[derive(Parser, Debug)]
#[command(name = "cloudseg")]
#[command(version)]
#[command(about = "Cloud segmentation inference with Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, default_value = "false", conflicts_with = "verbose")]
    quiet: bool,

    /// Explicit log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Disable colored log output
    #[arg(long, default_value = "false")]
    no_color: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Segment one image and report its cloud coverage
    Segment {
        /// Path to the source image
        #[arg(short, long)]
        input: PathBuf,

        /// Parameter-set file (overrides UNET_WEIGHTS_PATH)
        #[arg(short, long)]
        weights: Option<PathBuf>,

        /// Artifact directory (overrides SEGMENTATED_IMAGES_DIR)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Print the result as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Print the stage schedule, propagated shapes and parameter schedule
    Describe {
        /// Square input resolution to propagate
        #[arg(long, default_value_t = INPUT_SIZE)]
        input_size: usize,
    },

    /// Write a parameter set matching the network schedule
    ExportWeights {
        /// Output safetensors file
        #[arg(short, long)]
        output: PathBuf,

        /// How to initialize the parameters
        #[arg(long, value_enum, default_value_t = InitKind::Random)]
        init: InitKind,

        /// Constant bias for the output head
        #[arg(long)]
        head_bias: Option<f32>,
    },

    /// Benchmark forward-pass latency
    Benchmark {
        /// Parameter-set file (random weights if not specified)
        #[arg(short, long)]
        weights: Option<PathBuf>,

        /// Number of timed iterations
        #[arg(short, long, default_value = "20")]
        iterations: usize,

        /// Number of warmup iterations
        #[arg(long, default_value = "3")]
        warmup: usize,

        /// Image size (square)
        #[arg(long, default_value_t = INPUT_SIZE)]
        image_size: usize,

        /// Output JSON file for benchmark results
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum InitKind {
    /// Fresh random initialization
    Random,
    /// Every tensor zero
    Zeros,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = if cli.verbose {
        LogConfig::verbose()
    } else if cli.quiet {
        LogConfig::quiet()
    } else {
        LogConfig::default()
    };
    if let Some(level) = &cli.log_level {
        log_config.level = LogLevel::parse(level);
    }
    if cli.no_color {
        log_config.ansi_colors = false;
    }

    let _ = init_logging(&log_config);
    debug!("Logging at {}", log_config.level);

    match cli.command {
        Commands::Segment {
            input,
            weights,
            output_dir,
            json,
        } => cmd_segment(&input, weights, output_dir, json),
        Commands::Describe { input_size } => cmd_describe(input_size),
        Commands::ExportWeights { output, init, head_bias } => cmd_export_weights(&output, init, head_bias),
        Commands::Benchmark {
            weights,
            iterations,
            warmup,
            image_size,
            output,
        } => cmd_benchmark(weights.as_deref(), iterations, warmup, image_size, output),
    }
}

fn print_banner() {
    println!(
        "{}",
        r#"
 ╔════════════════════════════════════════════════════════════╗
 ║   ☁  Cloud Segmentation                                    ║
 ║   U-Net inference with Burn + Rust                         ║
 ╚════════════════════════════════════════════════════════════╝
  "#
        .cyan()
    );
}

fn cmd_segment(input: &Path, weights: Option<PathBuf>, output_dir: Option<PathBuf>, json: bool) -> Result<()> {
    // flags win over the environment
    let config = PipelineConfig::from_lookup(|key| {
        let flag = match key {
            ENV_WEIGHTS_PATH => weights.as_ref(),
            ENV_OUTPUT_DIR => output_dir.as_ref(),
            _ => None,
        };
        flag.map(|p| p.to_string_lossy().into_owned())
            .or_else(|| std::env::var(key).ok())
    })?;

    info!("Running segmentation");
    info!("  Input: {:?}", input);
    info!("  Weights: {:?}", config.weights_path);
    info!("  Output dir: {:?}", config.output_dir);

    if !json {
        print_banner();
        println!("{}", "Segmentation Configuration:".cyan().bold());
        println!("  Input:     {}", input.display());
        println!("  Weights:   {}", config.weights_path.display());
        println!("  Output:    {}", config.output_dir.display());
        println!("  Backend:   {}", backend_name());
        println!("  Coverage:  {} (threshold {})", config.coverage_mode, config.threshold);
        println!();
    }

    let device = default_device();
    let pipeline = SegmentationPipeline::<DefaultBackend>::from_config(config, &device)
        .context("failed to initialize the segmentation pipeline")?;

    let start = std::time::Instant::now();
    let result = pipeline.run(input)?;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", "Result:".green().bold());
        println!("  Artifact:  {}", result.artifact_path.display());
        println!("  Coverage:  {}", format!("{:.4}", result.coverage).bold());
        println!("  Time:      {}", format_millis(elapsed_ms));
    }

    Ok(())
}

fn cmd_describe(input_size: usize) -> Result<()> {
    let config = UNetConfig::new();
    let stages = config.stages();
    let shapes = config.propagate([1, config.in_channels, input_size, input_size])?;

    println!("{}", "Stage Schedule:".cyan().bold());
    for (stage, shape) in stages.iter().zip(&shapes) {
        println!(
            "  {:<12} {:<28} {:>4} -> {:<4} {:?}",
            stage.name,
            format!("{:?}", stage.op),
            stage.in_channels,
            stage.out_channels,
            shape.shape
        );
    }

    println!();
    println!("{}", "Parameter Schedule:".cyan().bold());
    let specs = parameter_specs(&stages);
    for spec in &specs {
        println!("  {:<22} {:?}", spec.name, spec.shape);
    }

    let total: usize = specs.iter().map(|s| s.numel()).sum();
    println!();
    println!(
        "  {} {} tensors, {} parameters",
        "Total:".green(),
        specs.len(),
        format_number(total).bold()
    );

    Ok(())
}

fn cmd_export_weights(output: &Path, init: InitKind, head_bias: Option<f32>) -> Result<()> {
    let config = UNetConfig::new();
    let specs = parameter_specs(&config.stages());

    println!("{}", "Exporting parameter set...".cyan());
    let mut set = match init {
        InitKind::Random => {
            let device = default_device();
            ParameterSet::from_network(&config.init::<DefaultBackend>(&device))?
        }
        InitKind::Zeros => ParameterSet::zeros(&specs),
    };

    if let Some(bias) = head_bias {
        set.insert("out_conv.bias", NamedTensor::filled(vec![config.out_channels], bias));
    }

    set.validate(&specs)?;
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    set.write(output)?;

    println!(
        "{} Wrote {} tensors ({} parameters) to {}",
        "✓".green().bold(),
        set.len(),
        format_number(set.numel()),
        output.display()
    );
    Ok(())
}

fn cmd_benchmark(
    weights: Option<&Path>,
    iterations: usize,
    warmup: usize,
    image_size: usize,
    output: Option<PathBuf>,
) -> Result<()> {
    info!("Running benchmark");
    if let Some(w) = weights {
        info!("  Weights: {:?}", w);
    }
    info!("  Iterations: {}", iterations);
    info!("  Warmup: {}", warmup);
    info!("  Image size: {}", image_size);

    print_banner();

    let device = default_device();
    let network = match weights {
        Some(path) => load_network::<DefaultBackend>(path, &UNetConfig::new(), &device)?,
        None => {
            println!("{}", "No weights given, benchmarking random parameters".yellow());
            BoundNetwork::new(UNetConfig::new().init(&device), device.clone())
        }
    };

    let config = BenchmarkConfig {
        warmup_iterations: warmup,
        iterations,
        batch_size: 1,
        verbose: false,
        output_path: output.clone(),
    };

    println!("{}", "Running benchmark...".green().bold());
    let result = run_benchmark(&network, config, image_size)?;
    println!("{}", result);

    if let Some(path) = output {
        println!("  Saved results to: {}", path.display());
    }

    Ok(())
}
