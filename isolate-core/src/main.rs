//! isolated - drive a batch of sandboxed isolates on the simulated engine
//!
//! Creates a platform with the calling thread as host loop, one privileged
//! isolate and N sandboxes. Each sandbox runs a few tasks that burn CPU,
//! allocate managed and external memory, and yield through the unlocked
//! section; the report at the end shows per-isolate CPU and wall time and
//! the platform counters.

use anyhow::{bail, Context, Result};
use isolate_core::engine::SimulatedEngine;
use isolate_core::{
    host_loop, init, HeapCheck, IsolateConfig, IsolateEnvironment, Platform, PlatformConfig,
    SimulatedEngineFactory, Task,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const MIB: usize = 1024 * 1024;
const TASKS_PER_ISOLATE: usize = 4;

struct Options {
    isolates: usize,
    memory_limit_mb: usize,
    busy: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            isolates: 4,
            memory_limit_mb: 64,
            busy: Duration::from_millis(20),
        }
    }
}

fn print_help() {
    println!("isolated - resource-bounded isolate demo v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  isolated [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("  -h, --help              Print this help message");
    println!("  -v, --version           Print version information");
    println!("  --isolates <N>          Number of sandboxed isolates (default: 4)");
    println!("  --memory-limit <MB>     Memory limit per isolate (default: 64)");
    println!("  --busy-ms <MS>          CPU time burned per task (default: 20)");
    println!();
    println!("ENVIRONMENT:");
    println!("  RUST_LOG                Log filter, e.g. RUST_LOG=isolate_core=debug");
}

fn parse_value(flag: &str, value: Option<&String>) -> Result<usize> {
    let value = value.with_context(|| format!("missing value for '{flag}'"))?;
    value
        .parse()
        .with_context(|| format!("invalid value '{value}' for '{flag}'"))
}

/// Spin for `duration` without yielding the thread.
fn burn_cpu(duration: Duration) {
    let start = Instant::now();
    let mut acc = 0u64;
    while start.elapsed() < duration {
        acc = acc.wrapping_mul(31).wrapping_add(7);
        std::hint::black_box(acc);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let mut options = Options::default();

    let mut iter = args[1..].iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            "-v" | "--version" => {
                println!("isolated {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--isolates" => options.isolates = parse_value(arg, iter.next())?,
            "--memory-limit" => options.memory_limit_mb = parse_value(arg, iter.next())?,
            "--busy-ms" => {
                options.busy = Duration::from_millis(parse_value(arg, iter.next())? as u64)
            }
            _ => {
                eprintln!("error: unrecognized argument '{}'", arg);
                eprintln!("Run 'isolated --help' for usage information.");
                std::process::exit(1);
            }
        }
    }
    if options.isolates == 0 {
        bail!("--isolates must be at least 1");
    }

    init()?;

    let (handle, driver) = host_loop::channel();
    let platform = Platform::new(PlatformConfig::default(), handle)?;

    let root = IsolateEnvironment::new_privileged(&platform, Arc::new(SimulatedEngine::unconstrained()))?;
    let root_env = root.require()?;
    root_env.schedule_task(Task::new(|lock| {
        info!(isolate = %lock.env().engine_id(), "Host task running on the loop thread");
    }))?;

    let factory = SimulatedEngineFactory::new();
    let mut sandboxes = Vec::with_capacity(options.isolates);
    for _ in 0..options.isolates {
        let holder = IsolateEnvironment::new(
            &platform,
            &factory,
            IsolateConfig::with_memory_limit(options.memory_limit_mb),
        )?;
        let engine = factory
            .last_created()
            .context("engine dropped right after creation")?;
        let env = holder.require()?;

        for task in 0..TASKS_PER_ISOLATE {
            let engine = engine.clone();
            let busy = options.busy;
            env.schedule_task(Task::new(move |lock| {
                let env = lock.env();
                if engine.allocate(2 * MIB).is_err() {
                    return;
                }
                burn_cpu(busy);

                let check = HeapCheck::new(env, false);
                env.adjust_extra_allocated_memory(MIB as isize);
                if let Err(err) = check.epilogue() {
                    warn!(isolate = %env.engine_id(), task, %err, "Task stopped");
                    return;
                }

                // Waiting on the outside world is not billed as CPU time
                lock.unlocked(|| std::thread::sleep(busy));

                engine.release(2 * MIB);
                env.adjust_extra_allocated_memory(-(MIB as isize));
                if let Err(err) = env.task_epilogue() {
                    warn!(isolate = %env.engine_id(), task, %err, "Task failed");
                }
            }))?;
        }
        sandboxes.push(env);
    }
    info!(isolates = sandboxes.len(), "Work scheduled, running host loop");

    let started = Instant::now();
    driver.run(&platform).await?;
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "All isolates idle");

    for env in &sandboxes {
        info!(
            isolate = %env.engine_id(),
            cpu_ms = env.cpu_time().as_millis() as u64,
            wall_ms = env.wall_time().as_millis() as u64,
            heap_used = env.total_memory_usage(),
            hit_memory_limit = env.hit_memory_limit(),
            "Isolate summary"
        );
    }

    platform.metrics().snapshot().print_report();
    Ok(())
}
