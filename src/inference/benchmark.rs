//! Benchmark Module for Forward-Pass Latency
//!
//! Measures how long the bound network takes per segmentation so deployments
//! can size the inference deadline.
//!
//! ## Key Metrics
//!
//! - **Latency**: Time per forward pass (ms)
//! - **Throughput**: Images segmented per second

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use burn::tensor::{backend::Backend, Distribution, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::engine::infer_batch;
use crate::backend::{backend_name, ComputeDevice};
use crate::model::BoundNetwork;
use crate::utils::error::{CloudSegError, Result};

/// Configuration for benchmarking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    /// Number of warmup iterations (excluded from measurements)
    pub warmup_iterations: usize,

    /// Number of benchmark iterations
    pub iterations: usize,

    /// Batch size for inference
    pub batch_size: usize,

    /// Whether to keep individual iteration times
    pub verbose: bool,

    /// Output file for results (optional)
    pub output_path: Option<PathBuf>,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            warmup_iterations: 3,
            iterations: 20,
            batch_size: 1,
            verbose: false,
            output_path: None,
        }
    }
}

impl BenchmarkConfig {
    /// Create a quick benchmark config for testing
    pub fn quick() -> Self {
        Self {
            warmup_iterations: 1,
            iterations: 5,
            batch_size: 1,
            verbose: false,
            output_path: None,
        }
    }
}

/// Results from a benchmark run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkResult {
    /// Latency statistics
    pub latency: LatencyStats,

    /// Throughput (images per second)
    pub throughput: f64,

    /// Individual iteration times (if verbose)
    pub iteration_times_ms: Vec<f64>,

    /// Configuration used for this benchmark
    pub config: BenchmarkConfig,

    /// Square input resolution
    pub image_size: usize,

    /// Backend the network ran on
    pub backend: String,

    /// Placement of the bound network
    pub device: ComputeDevice,

    /// Timestamp of when benchmark was run
    pub timestamp: String,
}

impl BenchmarkResult {
    /// Create a new benchmark result from timing data
    pub fn from_timings(timings: &[Duration], config: BenchmarkConfig, image_size: usize, device: ComputeDevice) -> Self {
        let latency = LatencyStats::from_durations(timings);
        let throughput = if latency.mean_ms > 0.0 {
            config.batch_size as f64 / (latency.mean_ms / 1000.0)
        } else {
            0.0
        };

        let iteration_times_ms = if config.verbose {
            timings.iter().map(|d| d.as_secs_f64() * 1000.0).collect()
        } else {
            Vec::new()
        };

        Self {
            latency,
            throughput,
            iteration_times_ms,
            config,
            image_size,
            backend: backend_name().to_string(),
            device,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Save results to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CloudSegError::file(parent, e))?;
        }

        std::fs::write(path, json).map_err(|e| CloudSegError::file(path, e))?;
        Ok(())
    }

    /// Load results from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| CloudSegError::file(path, e))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Check if p95 latency meets the target (in milliseconds)
    pub fn meets_latency_target(&self, target_ms: f64) -> bool {
        self.latency.p95_ms <= target_ms
    }

    /// Get a summary string
    pub fn summary(&self) -> String {
        format!(
            "Latency: {:.2}ms (mean), {:.2}ms (p95), {:.2}ms (p99) | Throughput: {:.2} img/s",
            self.latency.mean_ms, self.latency.p95_ms, self.latency.p99_ms, self.throughput
        )
    }
}

impl std::fmt::Display for BenchmarkResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════════════════╗")?;
        writeln!(f, "║              Segmentation Benchmark                          ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════════════════╣")?;
        writeln!(f, "║ Backend: {:53} ║", format!("{} on {}", self.backend, self.device))?;
        writeln!(f, "║ Timestamp: {:51} ║", self.timestamp.get(..19).unwrap_or(&self.timestamp))?;
        writeln!(f, "║ Input: {:55} ║", format!("{0}x{0}", self.image_size))?;
        writeln!(f, "╠══════════════════════════════════════════════════════════════╣")?;
        writeln!(f, "║ Latency Statistics                                           ║")?;
        writeln!(f, "║   Mean:     {:8.2} ms                                      ║", self.latency.mean_ms)?;
        writeln!(f, "║   Std Dev:  {:8.2} ms                                      ║", self.latency.std_ms)?;
        writeln!(f, "║   Min:      {:8.2} ms                                      ║", self.latency.min_ms)?;
        writeln!(f, "║   Max:      {:8.2} ms                                      ║", self.latency.max_ms)?;
        writeln!(f, "║   P50:      {:8.2} ms                                      ║", self.latency.p50_ms)?;
        writeln!(f, "║   P95:      {:8.2} ms                                      ║", self.latency.p95_ms)?;
        writeln!(f, "║   P99:      {:8.2} ms                                      ║", self.latency.p99_ms)?;
        writeln!(f, "╠══════════════════════════════════════════════════════════════╣")?;
        writeln!(f, "║ Throughput: {:8.2} images/second                          ║", self.throughput)?;
        writeln!(f, "╠══════════════════════════════════════════════════════════════╣")?;
        writeln!(f, "║ Configuration                                                ║")?;
        writeln!(f, "║   Batch Size:   {:5}                                        ║", self.config.batch_size)?;
        writeln!(f, "║   Iterations:   {:5}                                        ║", self.config.iterations)?;
        writeln!(f, "║   Warmup:       {:5}                                        ║", self.config.warmup_iterations)?;
        writeln!(f, "╚══════════════════════════════════════════════════════════════╝")?;
        Ok(())
    }
}

/// Latency statistics from benchmark
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyStats {
    /// Mean latency in milliseconds
    pub mean_ms: f64,
    /// Standard deviation in milliseconds
    pub std_ms: f64,
    /// Minimum latency
    pub min_ms: f64,
    /// Maximum latency
    pub max_ms: f64,
    /// Median (50th percentile)
    pub p50_ms: f64,
    /// 95th percentile
    pub p95_ms: f64,
    /// 99th percentile
    pub p99_ms: f64,
}

impl LatencyStats {
    /// Calculate statistics from a list of durations
    pub fn from_durations(durations: &[Duration]) -> Self {
        if durations.is_empty() {
            return Self::default();
        }

        let mut times_ms: Vec<f64> = durations.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        times_ms.sort_by(|a, b| a.total_cmp(b));

        let n = times_ms.len();
        let mean = times_ms.iter().sum::<f64>() / n as f64;
        let variance = times_ms.iter().map(|t| (t - mean).powi(2)).sum::<f64>() / n as f64;

        Self {
            mean_ms: mean,
            std_ms: variance.sqrt(),
            min_ms: times_ms[0],
            max_ms: times_ms[n - 1],
            p50_ms: percentile(&times_ms, 50.0),
            p95_ms: percentile(&times_ms, 95.0),
            p99_ms: percentile(&times_ms, 99.0),
        }
    }
}

/// Calculate percentile from sorted data
fn percentile(sorted_data: &[f64], p: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let idx = (p / 100.0 * (sorted_data.len() - 1) as f64).round() as usize;
    sorted_data[idx.min(sorted_data.len() - 1)]
}

/// Timer utility for benchmarking
pub struct Timer {
    start: Instant,
    times: Vec<Duration>,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            times: Vec::new(),
        }
    }

    pub fn start(&mut self) {
        self.start = Instant::now();
    }

    /// Stop timing and record the duration
    pub fn stop(&mut self) -> Duration {
        let elapsed = self.start.elapsed();
        self.times.push(elapsed);
        elapsed
    }

    pub fn times(&self) -> &[Duration] {
        &self.times
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Time forward passes of `network` on random input.
///
/// Each timed pass includes readback of the map to the host, which is what a
/// pipeline invocation pays.
pub fn run_benchmark<B: Backend>(
    network: &BoundNetwork<B>,
    config: BenchmarkConfig,
    image_size: usize,
) -> Result<BenchmarkResult> {
    info!(
        "Benchmarking {}x{} input on {} ({} warmup, {} timed)",
        image_size, image_size, network.placement(), config.warmup_iterations, config.iterations
    );

    let input = Tensor::<B, 4>::random(
        [config.batch_size.max(1), network.in_channels(), image_size, image_size],
        Distribution::Uniform(0.0, 1.0),
        network.device(),
    );

    for i in 0..config.warmup_iterations {
        infer_batch(network, input.clone())?;
        debug!("Warmup iteration {}/{}", i + 1, config.warmup_iterations);
    }

    let mut timer = Timer::new();
    for i in 0..config.iterations {
        timer.start();
        infer_batch(network, input.clone())?;
        let elapsed = timer.stop();
        debug!("Iteration {}/{}: {:?}", i + 1, config.iterations, elapsed);
    }

    let result = BenchmarkResult::from_timings(timer.times(), config, image_size, network.placement());
    info!("{}", result.summary());

    if let Some(path) = &result.config.output_path {
        result.save(path)?;
        info!("Saved benchmark results to {:?}", path);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UNetConfig;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    #[test]
    fn test_latency_stats() {
        let durations: Vec<Duration> = vec![
            Duration::from_millis(10),
            Duration::from_millis(12),
            Duration::from_millis(11),
            Duration::from_millis(15),
            Duration::from_millis(9),
        ];

        let stats = LatencyStats::from_durations(&durations);

        assert!((stats.mean_ms - 11.4).abs() < 0.1);
        assert_eq!(stats.min_ms, 9.0);
        assert_eq!(stats.max_ms, 15.0);
        assert_eq!(stats.p50_ms, 11.0);
    }

    #[test]
    fn test_empty_stats() {
        let stats = LatencyStats::from_durations(&[]);
        assert_eq!(stats.mean_ms, 0.0);
    }

    #[test]
    fn test_timer() {
        let mut timer = Timer::new();

        for _ in 0..5 {
            timer.start();
            std::thread::sleep(Duration::from_millis(1));
            timer.stop();
        }

        assert_eq!(timer.times().len(), 5);
        assert!(LatencyStats::from_durations(timer.times()).mean_ms >= 1.0);
    }

    #[test]
    fn test_meets_latency_target() {
        let timings = vec![
            Duration::from_millis(100),
            Duration::from_millis(120),
            Duration::from_millis(110),
        ];

        let result = BenchmarkResult::from_timings(&timings, BenchmarkConfig::default(), 384, ComputeDevice::Cpu);

        assert!(result.meets_latency_target(500.0));
        assert!(!result.meets_latency_target(50.0));
        assert!(result.to_string().contains("384x384"));
    }

    #[test]
    fn test_quick_benchmark_saves_results() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let network = BoundNetwork::new(UNetConfig::new().init::<NdArray>(&device), device);

        let mut config = BenchmarkConfig::quick();
        config.verbose = true;
        config.output_path = Some(dir.path().join("reports").join("bench.json"));

        let result = run_benchmark(&network, config, 32).unwrap();
        assert_eq!(result.iteration_times_ms.len(), 5);
        assert!(result.throughput > 0.0);

        let loaded = BenchmarkResult::load(&dir.path().join("reports").join("bench.json")).unwrap();
        assert_eq!(loaded.image_size, 32);
        assert_eq!(loaded.device, ComputeDevice::Cpu);
    }
}
