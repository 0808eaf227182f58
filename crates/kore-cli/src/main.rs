use std::path::PathBuf;

use clap::Parser;
use serde_json::json;

use kore_driver::{Dim3, Driver, DriverError, ErrorReporter, LifecycleCoordinator, MockDriver, RunConfig};

#[derive(Parser)]
#[command(
    name = "kore",
    about = "Run a precompiled CUDA kernel through the driver API",
    long_about = "Resolves a device, creates contexts, loads a PTX/cubin module, uploads\ninputs, launches vector_add, downloads the result, and tears everything down.\n\nAny driver failure prints `Driver Error: <description> <file> <line>` and exits\nwith the driver status code.",
    version,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show driver version and device properties
    Info {
        /// Use the in-process mock driver instead of libcuda
        #[arg(long)]
        mock: bool,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run vector_add end to end
    Run(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// JSON run configuration; the flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,
    /// Precompiled module path
    #[arg(long)]
    module: Option<PathBuf>,
    /// Entry point name
    #[arg(long)]
    kernel: Option<String>,
    /// Device index
    #[arg(long)]
    device: Option<usize>,
    /// Number of elements
    #[arg(short = 'n', long)]
    problem_size: Option<usize>,
    /// Threads per block
    #[arg(long)]
    block_size: Option<u32>,
    /// Number of contexts to create
    #[arg(long)]
    contexts: Option<usize>,
    /// Context that runs the kernel (default: the last created)
    #[arg(long)]
    active_context: Option<usize>,
    /// Dynamic shared memory per block, in bytes
    #[arg(long)]
    shared_mem: Option<u32>,
    /// Use the in-process mock driver instead of libcuda
    #[arg(long)]
    mock: bool,
    /// Print the run report as JSON
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut RunConfig) {
        if let Some(path) = &self.module {
            config.module_path = path.clone();
        }
        if let Some(name) = &self.kernel {
            config.kernel_name = name.clone();
        }
        if let Some(index) = self.device {
            config.device_index = index;
        }
        if let Some(n) = self.problem_size {
            config.problem_size = n;
        }
        if let Some(b) = self.block_size {
            config.block_size = b;
        }
        if let Some(count) = self.contexts {
            config.context_count = count;
        }
        if let Some(active) = self.active_context {
            config.active_context = Some(active);
        }
        if let Some(bytes) = self.shared_mem {
            config.shared_mem_bytes = bytes;
        }
    }
}

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Info { mock, json } => cmd_info(mock, json).map(|()| true),
        Commands::Run(args) => cmd_run(&args),
    };
    // Every driver resource is released by the time a command returns.
    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => ErrorReporter::stderr().fatal(&e),
    }
}

fn open_driver(mock: bool) -> Result<Driver, DriverError> {
    if mock {
        Driver::new(MockDriver::new(1).with_vector_add())
    } else {
        Driver::cuda()
    }
}

fn cmd_info(mock: bool, as_json: bool) -> Result<(), DriverError> {
    let driver = open_driver(mock)?;
    let version = driver.version()?;
    let count = driver.device_count()?;
    let mut devices = Vec::with_capacity(count);
    for index in 0..count {
        let device = driver.device(index)?;
        devices.push(driver.device_info(&device)?);
    }

    if as_json {
        println!("{:#}", json!({ "driver_version": version, "devices": devices }));
        return Ok(());
    }

    println!("CUDA driver {}.{}", version / 1000, (version % 1000) / 10);
    println!("Devices: {}", count);
    for info in &devices {
        println!("\nDevice {}: {}", info.index, info.name);
        println!("  Memory:             {} MiB", info.total_mem / (1024 * 1024));
        println!("  Compute capability: {}.{}", info.compute_capability.0, info.compute_capability.1);
        println!("  Multiprocessors:    {}", info.multiprocessors);
        println!("  Threads per block:  {}", info.limits.max_threads_per_block);
        println!("  Max block:          {}", fmt_dim(info.limits.max_block));
        println!("  Max grid:           {}", fmt_dim(info.limits.max_grid));
        println!("  Shared mem / block: {} KiB", info.limits.max_shared_mem_per_block / 1024);
    }
    Ok(())
}

/// Returns whether the output matched `fill_a + fill_b` everywhere.
fn cmd_run(args: &RunArgs) -> Result<bool, DriverError> {
    let mut config = match &args.config {
        Some(path) => RunConfig::from_json_file(path)?,
        None => RunConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;
    tracing::debug!("run config: {:?}", config);

    let driver = open_driver(args.mock)?;
    let expected = config.expected_value();
    let report = LifecycleCoordinator::new(&driver, config).run()?;
    let mismatches = report.mismatches(expected);

    if args.json {
        println!("{:#}", json!({ "report": report, "expected": expected, "mismatches": mismatches }));
        return Ok(mismatches == 0);
    }

    println!("=== Kore vector_add ===");
    println!("Device:  {} ({})", report.device.index, report.device.name);
    println!("Grid:    {}", fmt_dim(report.grid));
    println!("Block:   {}", fmt_dim(report.block));
    println!("Threads: {} ({} padding)", report.total_threads, report.padding_threads);
    let preview: Vec<f32> = report.output.iter().take(4).copied().collect();
    println!("Output:  {} elements, first {:?}", report.output.len(), preview);
    if mismatches == 0 {
        println!("Check:   all elements == {}", expected);
    } else {
        println!("Check:   {} of {} elements != {}", mismatches, report.output.len(), expected);
    }
    let stages: Vec<String> = report.transitions.iter().map(|s| format!("{:?}", s)).collect();
    println!("Stages:  {}", stages.join(" -> "));
    Ok(mismatches == 0)
}

fn fmt_dim(d: Dim3) -> String {
    format!("({}, {}, {})", d.x, d.y, d.z)
}
