// Story Runner - drive one scripted swarm experiment
//
// Usage:
//   cargo run --bin story_runner -- --story simulation
//   cargo run --bin story_runner -- --story vod --replacements "late:n9/size:200"
//   cargo run --bin story_runner -- --story vod --duration 120 --config experiment.yaml

mod clients;
mod kernel;

use std::cell::RefCell;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::rc::Rc;

use log::LevelFilter;
use rand::rngs::StdRng;
use rand::SeedableRng;
use simple_logger::SimpleLogger;

use swarm_story::sim_interface::{repeat_every, SimTime, SimulationClock, MILLIS_PER_SECOND};
use swarm_story::sim_metrics::{MetricsGatherer, StopPolicy, STOP_GRACE_MS};
use swarm_story::sim_partition::PartitionOracle;
use swarm_story::sim_report::{wallclock_time, ReportWriter};
use swarm_story::sim_reserve::ReservePool;
use swarm_story::sim_schedule::schedule;
use swarm_story::sim_story::{read_story, VariableBinding};

use clients::SwarmSink;
use kernel::EventQueueClock;

/// Optional experiment configuration overrides, loaded from YAML
#[derive(Debug, Default, serde::Deserialize)]
struct ExperimentFile {
    #[serde(default)]
    meta: ExperimentMeta,

    #[serde(default)]
    config: ExperimentOverrides,
}

#[derive(Debug, Default, serde::Deserialize)]
struct ExperimentMeta {
    name: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct ExperimentOverrides {
    /// Simulation horizon in seconds
    duration: Option<u64>,

    /// Metrics sampling cadence in milliseconds
    tick_period_ms: Option<u64>,

    /// Stop thresholds; negative active fraction = never auto-stop
    active_stop_fraction: Option<f64>,
    reserve_stop_fraction: Option<f64>,

    /// Synthetic download duration window in milliseconds
    completion_window_ms: Option<(u64, u64)>,

    /// Emulation mode: rely on an external stop only
    emulation: Option<bool>,
}

struct CliArgs {
    story: String,
    replacements: String,
    duration_secs: u64,
    logging: bool,
    comment: String,
    seed: Option<[u8; 32]>,
    config: Option<PathBuf>,
}

impl Default for CliArgs {
    fn default() -> Self {
        CliArgs {
            story: "simulation".to_string(),
            replacements: String::new(),
            duration_secs: 25_000,
            logging: false,
            comment: String::new(),
            seed: None,
            config: None,
        }
    }
}

fn main() {
    let args = parse_args();

    let level = if args.logging { LevelFilter::Debug } else { LevelFilter::Info };
    SimpleLogger::new().with_level(level).init().unwrap();

    println!("Setting up story-driven swarm experiment...");

    // Optional YAML overrides
    let overrides = match &args.config {
        Some(path) => load_experiment_file(path),
        None => ExperimentFile::default(),
    };
    if let Some(name) = &overrides.meta.name {
        println!("Experiment: {}", name);
    }
    if let Some(description) = &overrides.meta.description {
        println!("{}", description);
    }

    let duration_secs = overrides.config.duration.unwrap_or(args.duration_secs);
    let horizon: SimTime = duration_secs * MILLIS_PER_SECOND;

    println!("Reading story file and registering simulation events...");

    let binding = VariableBinding::parse(&args.replacements).unwrap_or_else(|e| {
        eprintln!("Invalid --replacements: {}", e);
        process::exit(1);
    });
    let story_path = PathBuf::from(format!("{}.story", args.story));
    let story = read_story(&story_path, horizon, &binding).unwrap_or_else(|e| {
        eprintln!("Story error: {}", e);
        process::exit(1);
    });
    let reserve = ReservePool::from_entries(story.reserve).unwrap_or_else(|e| {
        eprintln!("Reserve pool error: {}", e);
        process::exit(1);
    });
    let reserve = Rc::new(RefCell::new(reserve));
    println!("size of the reserve pool is {}", reserve.borrow().size());

    println!("Configuring global metrics gatherer...");

    let emulation = overrides.config.emulation.unwrap_or(false);
    let policy = if emulation {
        // never auto-stop on completion; an external stop ends the run
        StopPolicy::new(-1.0, overrides.config.reserve_stop_fraction.unwrap_or(1.0))
    } else {
        StopPolicy::new(
            overrides.config.active_stop_fraction.unwrap_or(1.0),
            overrides.config.reserve_stop_fraction.unwrap_or(1.0),
        )
    }
    .unwrap_or_else(|e| {
        eprintln!("Invalid stop policy: {}", e);
        process::exit(1);
    });

    let report = ReportWriter::new(&story.simulation_id, story.log_to_file || args.logging);
    let gatherer = Rc::new(RefCell::new(MetricsGatherer::new(policy, horizon, report)));
    gatherer.borrow_mut().attach_reserve(reserve.clone());
    if let Some(period) = overrides.config.tick_period_ms {
        gatherer.borrow_mut().set_tick_period(period);
    }

    println!("Configuring clients for the swarm...");

    let seed = args.seed.unwrap_or([0u8; 32]);
    let completion_window = overrides.config.completion_window_ms.unwrap_or((5_000, 20_000));
    let sink = Rc::new(RefCell::new(SwarmSink::new(
        gatherer.clone(),
        reserve.clone(),
        StdRng::from_seed(seed),
        completion_window,
    )));

    // This binary always runs the whole story itself; partitioned runs feed
    // the oracle a topology assignment instead.
    let oracle = PartitionOracle::single_process();
    let mut clock = EventQueueClock::new();
    let summary = schedule(story.actions, &oracle, sink.clone(), &mut clock);
    println!(
        "Registered {} actions with the clock ({} foreign-owned skipped)",
        summary.registered, summary.skipped_foreign
    );

    println!("Starting story-driven swarm experiment...");

    repeat_every(&mut clock, MILLIS_PER_SECOND, |c| {
        println!(
            "It is now {:.1}s ({})",
            c.now() as f64 / MILLIS_PER_SECOND as f64,
            wallclock_time()
        );
        true
    });
    MetricsGatherer::arm(&gatherer, &mut clock);
    clock.request_stop(horizon + STOP_GRACE_MS);

    if !args.comment.is_empty() {
        gatherer.borrow().write_to_file("comment", &args.comment, false);
    }
    gatherer.borrow().write_to_file("simulation-started", &wallclock_time(), false);

    let end = clock.run();
    gatherer.borrow_mut().finish_at_horizon();

    if let Some(tracker) = sink.borrow().tracker() {
        println!("Tracker for this run: {}", tracker);
    }
    let gatherer = gatherer.borrow();
    println!(
        "\nRun ended at {:.1}s: {} of {} clients completed (stop decision: {})",
        end as f64 / MILLIS_PER_SECOND as f64,
        gatherer.completed_count(),
        gatherer.active_count(),
        match gatherer.stopped_at() {
            Some(t) => format!("{}ms", t),
            None => "horizon".to_string(),
        }
    );
    println!("{}: swarm experiment finished successfully :=)", wallclock_time());
}

fn parse_args() -> CliArgs {
    let mut args = CliArgs::default();
    let mut iter = env::args().skip(1);

    while let Some(flag) = iter.next() {
        match flag.as_str() {
            "--story" => args.story = expect_value(&mut iter, "--story"),
            "--replacements" => args.replacements = expect_value(&mut iter, "--replacements"),
            "--duration" => {
                let value = expect_value(&mut iter, "--duration");
                args.duration_secs = value.parse().unwrap_or_else(|_| {
                    eprintln!("--duration expects seconds, got {:?}", value);
                    process::exit(1);
                });
            }
            "--logging" => args.logging = expect_value(&mut iter, "--logging") == "1",
            "--comment" => args.comment = expect_value(&mut iter, "--comment"),
            "--seed" => args.seed = Some(parse_seed_hex(&expect_value(&mut iter, "--seed"))),
            "--config" => args.config = Some(PathBuf::from(expect_value(&mut iter, "--config"))),
            "--help" | "-h" => {
                print_usage();
                process::exit(0);
            }
            other => {
                eprintln!("Unknown argument {:?}", other);
                print_usage();
                process::exit(1);
            }
        }
    }
    args
}

fn expect_value(iter: &mut impl Iterator<Item = String>, flag: &str) -> String {
    iter.next().unwrap_or_else(|| {
        eprintln!("{} expects a value", flag);
        process::exit(1);
    })
}

fn print_usage() {
    eprintln!("Usage: story_runner [OPTIONS]");
    eprintln!();
    eprintln!("  --story NAME          story file base name, without \".story\" (default: simulation)");
    eprintln!("  --replacements SPEC   variable replacements, \"var_1:value_1/var_2:value_2\"");
    eprintln!("  --duration SECONDS    length of the simulation (default: 25000)");
    eprintln!("  --logging 0|1         full-scale logging (default: 0)");
    eprintln!("  --comment TEXT        debugging comment attached to the report");
    eprintln!("  --seed 0xHEX          seed for the synthetic client workload");
    eprintln!("  --config FILE         experiment overrides in YAML");
}

fn load_experiment_file(path: &Path) -> ExperimentFile {
    let yaml = fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Failed to read {}: {}", path.display(), e);
        process::exit(1);
    });
    serde_yaml::from_str(&yaml).unwrap_or_else(|e| {
        eprintln!("Failed to parse {}: {}", path.display(), e);
        process::exit(1);
    })
}

fn parse_seed_hex(hex: &str) -> [u8; 32] {
    let hex = hex.strip_prefix("0x").unwrap_or(hex);
    let mut seed = [0u8; 32];

    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        if i >= 32 {
            break;
        }
        let byte_str = std::str::from_utf8(chunk).unwrap_or_else(|_| {
            eprintln!("Invalid hex seed");
            process::exit(1);
        });
        seed[i] = u8::from_str_radix(byte_str, 16).unwrap_or_else(|e| {
            eprintln!("Invalid hex seed: {}", e);
            process::exit(1);
        });
    }

    seed
}
