//! `tierd`: loads a policy+routines config (spec.md §6), runs the policy's
//! pidwatcher/tick loop, ticks its configured routines, and optionally drops
//! into the interactive prompt on stdio.
use std::{path::PathBuf, sync::Arc, time::Instant};

use structopt::StructOpt;
use tierd::{
    config,
    pidwatcher,
    prompt::Prompt,
    stats::{StatActions, StatActionsConfig, StatsStore},
    tracker::RemovePids,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "tierd", about = "user-space NUMA memory tiering daemon")]
struct Args {
    /// Path to the policy+routines YAML document.
    #[structopt(long, parse(from_os_str))]
    config: PathBuf,

    /// Print the effective config as JSON and exit without running anything.
    #[structopt(long = "config-dump-json")]
    config_dump_json: bool,

    /// Drop into the interactive prompt on stdio once the daemon is running.
    #[structopt(long)]
    prompt: bool,

    /// Verbose (debug-level) logging.
    #[structopt(short, long)]
    debug: bool,
}

fn main() {
    let args = Args::from_args();

    let level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let root = match config::RootConfig::load(&args.config) {
        Ok(root) => root,
        Err(err) => {
            eprintln!("tierd: {}", err);
            std::process::exit(1);
        }
    };

    if args.config_dump_json {
        match root.dump_json() {
            Ok(json) => println!("{}", json),
            Err(err) => {
                eprintln!("tierd: {}", err);
                std::process::exit(1);
            }
        }
        return;
    }

    let built = match config::build_policy(&root.policy) {
        Ok(built) => built,
        Err(err) => {
            eprintln!("tierd: {}", err);
            std::process::exit(1);
        }
    };

    // Only `statactions` is registered today (spec.md §4.7); an unknown
    // routine name is logged and dropped rather than aborting the daemon.
    let routine_configs: Vec<StatActionsConfig> = root
        .routines
        .iter()
        .filter_map(|named| {
            if named.name != "statactions" {
                log::warn!("routine: unknown routine {:?}, skipping", named.name);
                return None;
            }
            serde_json::from_value(named.config.clone())
                .map_err(|err| log::warn!("routine: invalid statactions config: {}", err))
                .ok()
        })
        .collect();

    let stats = Arc::new(StatsStore::new(4096));

    if args.prompt {
        let prompt_stats = Arc::clone(&stats);
        std::thread::spawn(move || run_loop(built, stats, routine_configs));

        let stdin = std::io::stdin();
        Prompt::new(prompt_stats).run(stdin.lock());
        return;
    }

    run_loop(built, stats, routine_configs);
}

fn run_loop(mut built: config::BuiltPolicy, stats: Arc<StatsStore>, routine_configs: Vec<StatActionsConfig>) {
    let epoch = Instant::now();
    let mut seen: Vec<usize> = Vec::new();

    loop {
        match built.pidwatcher.poll() {
            Ok(current) => {
                let (added, removed) = pidwatcher::diff(&seen, &current);
                if !added.is_empty() {
                    if let Err(err) = built.policy.add_pids(&added) {
                        log::warn!("policy: add_pids failed: {}", err);
                    }
                }
                if !removed.is_empty() {
                    if let Err(err) = built.policy.remove_pids(RemovePids::Some(removed)) {
                        log::warn!("policy: remove_pids failed: {}", err);
                    }
                }
                seen = current;
            }
            Err(err) => log::warn!("pidwatcher poll failed: {}", err),
        }

        let elapsed = epoch.elapsed();
        built.policy.tick(elapsed.as_nanos() as u64, elapsed.as_millis() as u64);

        for cfg in &routine_configs {
            StatActions::new(&stats, cfg.clone()).tick();
        }

        std::thread::sleep(std::time::Duration::from_millis(built.interval_ms.max(1)));
    }
}
