//! Interactive prompt (spec.md §6): a line-oriented REPL reading commands
//! off stdin, parsed against the grammar `help | q | tracker | pages |
//! arange | mover | policy | routines | swap | stats | <cmd> | <shell>`.
//! Anything that doesn't parse as one of the named subcommands is handed to
//! [`config::exec_line`] and run as a shell command -- the `<cmd>`/`<shell>`
//! fallback.
use std::{
    collections::HashMap,
    io::{self, BufRead, Write},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crate::{
    addr::range::{AddrRange, AddrRanges, PageAttrs},
    config::{self, BuiltPolicy},
    deps::{
        crossbeam_channel::{self, Sender},
        log::warn,
        serde_json,
        structopt::StructOpt,
    },
    error::Error,
    heatmap::{heat_class, Heatmap, HeatmapConfig},
    mover::{MoverConfig, MoverHandle},
    node::Node,
    osaccess::{
        idlebitmap::ProcPageIdleBitmap,
        kpageflags::ProcKpageflags,
        madvise,
        movepages,
        pagemap::{ProcPagemap, Readahead},
        proc_maps_eligible,
    },
    pidwatcher,
    policy::NamedConfig,
    stats::{StatActions, StatActionsConfig, StatsStore},
    tracker::{RemovePids, Tracker},
};

const HELP_TEXT: &str = "\
help                                          this text
q                                             quit
tracker -ls|-create NAME|-config JSON|-start PIDS|-stop|-counters|-heat|-reset|-dump ARGS
pages --pid PID [--ranges R,...] [--attrs A,...] [--node N] [--pr N|--pm N|--pk PFN|--pi PFN|--si PFN]
arange --pid PID [--ls] [--split-length N] [--min-length N]
mover -start|-stop|-pause|-continue|-pages-to N|-config JSON|-tasks|-remove-task ID
policy -ls|-create NAME|-config JSON|-start|-stop|-dump
routines -ls|-create NAME|-config JSON|-start|-stop|-use IDX
swap --pid PID --in|--out|--status|--vaddrs [--ranges R,...]
stats [--lm PID|--le PID|--dump]
<anything else> runs as a shell command";

#[derive(Debug, StructOpt)]
#[structopt(name = "tierd", no_binary_name = true)]
enum Command {
    Help,
    Q,
    Tracker(TrackerArgs),
    Pages(PagesArgs),
    Arange(ArangeArgs),
    Mover(MoverArgs),
    Policy(PolicyArgs),
    Routines(RoutinesArgs),
    Swap(SwapArgs),
    Stats(StatsArgs),
}

#[derive(Debug, StructOpt)]
struct TrackerArgs {
    #[structopt(long)]
    ls: bool,
    #[structopt(long)]
    create: Option<String>,
    #[structopt(long)]
    config: Option<String>,
    #[structopt(long)]
    start: Option<String>,
    #[structopt(long)]
    stop: bool,
    #[structopt(long)]
    counters: bool,
    #[structopt(long)]
    heat: bool,
    #[structopt(long)]
    reset: bool,
    #[structopt(long)]
    dump: Option<String>,
}

#[derive(Debug, StructOpt)]
struct PagesArgs {
    #[structopt(long)]
    pid: usize,
    #[structopt(long)]
    ranges: Option<String>,
    #[structopt(long)]
    attrs: Option<String>,
    #[structopt(long)]
    node: Option<u32>,
    #[structopt(long)]
    pr: Option<usize>,
    #[structopt(long)]
    pm: Option<u32>,
    #[structopt(long)]
    pk: Option<String>,
    #[structopt(long)]
    pi: Option<String>,
    #[structopt(long)]
    si: Option<String>,
}

#[derive(Debug, StructOpt)]
struct ArangeArgs {
    #[structopt(long)]
    pid: usize,
    #[structopt(long)]
    ls: bool,
    #[structopt(long = "split-length")]
    split_length: Option<u64>,
    #[structopt(long = "min-length")]
    min_length: Option<u64>,
}

#[derive(Debug, StructOpt)]
struct MoverArgs {
    #[structopt(long)]
    start: bool,
    #[structopt(long)]
    stop: bool,
    #[structopt(long)]
    pause: bool,
    #[structopt(long = "continue")]
    r#continue: bool,
    #[structopt(long = "pages-to")]
    pages_to: Option<u64>,
    #[structopt(long)]
    config: Option<String>,
    #[structopt(long)]
    tasks: bool,
    #[structopt(long = "remove-task")]
    remove_task: Option<usize>,
}

#[derive(Debug, StructOpt)]
struct PolicyArgs {
    #[structopt(long)]
    ls: bool,
    #[structopt(long)]
    create: Option<String>,
    #[structopt(long)]
    config: Option<String>,
    #[structopt(long)]
    start: bool,
    #[structopt(long)]
    stop: bool,
    #[structopt(long)]
    dump: bool,
}

#[derive(Debug, StructOpt)]
struct RoutinesArgs {
    #[structopt(long)]
    ls: bool,
    #[structopt(long)]
    create: Option<String>,
    #[structopt(long)]
    config: Option<String>,
    #[structopt(long)]
    start: bool,
    #[structopt(long)]
    stop: bool,
    #[structopt(long = "use")]
    r#use: Option<usize>,
}

#[derive(Debug, StructOpt)]
struct SwapArgs {
    #[structopt(long)]
    pid: usize,
    #[structopt(long = "in")]
    r#in: bool,
    #[structopt(long)]
    out: bool,
    #[structopt(long)]
    status: bool,
    #[structopt(long)]
    vaddrs: bool,
    #[structopt(long)]
    ranges: Option<String>,
}

#[derive(Debug, StructOpt)]
struct StatsArgs {
    #[structopt(long)]
    lm: Option<usize>,
    #[structopt(long)]
    le: Option<usize>,
    #[structopt(long)]
    dump: bool,
}

fn parse_ranges(value: &str) -> Result<Vec<AddrRange>, Error> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::parse::<AddrRange>).collect()
}

fn parse_pid_list(value: &str) -> Vec<usize> {
    value.split(',').map(str::trim).filter_map(|s| s.parse::<usize>().ok()).collect()
}

fn parse_hex_pfn(value: &str) -> Result<u64, Error> {
    u64::from_str_radix(value.trim_start_matches("0x"), 16).map_err(|_| Error::Parse {
        value:    value.to_string(),
        typename: "PFN",
        reason:   "expected a hex page frame number".to_string(),
    })
}

/// Runs a tracker-less policy tick loop on its own thread, diffing the
/// pidwatcher each round the way a non-interactive run loop would (spec.md
/// §4.6). Started/stopped by `policy -start`/`-stop`.
struct PolicyRunner {
    stop_tx: Sender<()>,
    join:    Option<thread::JoinHandle<()>>,
}

impl PolicyRunner {
    fn spawn(mut built: BuiltPolicy) -> Self {
        let (stop_tx, stop_rx) = crossbeam_channel::unbounded();
        let epoch = Instant::now();

        let join = thread::spawn(move || {
            let mut seen: Vec<usize> = Vec::new();

            loop {
                if stop_rx.try_recv().is_ok() {
                    return;
                }

                match built.pidwatcher.poll() {
                    Ok(current) => {
                        let (added, removed) = pidwatcher::diff(&seen, &current);
                        if !added.is_empty() {
                            if let Err(err) = built.policy.add_pids(&added) {
                                warn!("policy: add_pids failed: {}", err);
                            }
                        }
                        if !removed.is_empty() {
                            if let Err(err) = built.policy.remove_pids(RemovePids::Some(removed)) {
                                warn!("policy: remove_pids failed: {}", err);
                            }
                        }
                        seen = current;
                    }
                    Err(err) => warn!("policy: pidwatcher poll failed: {}", err),
                }

                let elapsed = epoch.elapsed();
                built.policy.tick(elapsed.as_nanos() as u64, elapsed.as_millis() as u64);
                thread::sleep(Duration::from_millis(built.interval_ms.max(1)));
            }
        });

        PolicyRunner { stop_tx, join: Some(join) }
    }

    fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for PolicyRunner {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.stop();
        }
    }
}

/// Ticks a `statactions` routine on its own thread. Unlike [`PolicyRunner`]
/// this doesn't own an `AnyRoutine` across the thread boundary -- it just
/// rebuilds a short-lived `StatActions` borrowing `stats` each tick, which
/// sidesteps `StatActions<'a>`'s borrow without needing a `'static` routine.
struct RoutineRunner {
    stop_tx: Sender<()>,
    join:    Option<thread::JoinHandle<()>>,
}

impl RoutineRunner {
    fn spawn(stats: Arc<StatsStore>, cfg: StatActionsConfig) -> Self {
        let (stop_tx, stop_rx) = crossbeam_channel::unbounded();
        let interval = cfg.interval_ms.max(1);

        let join = thread::spawn(move || loop {
            if stop_rx.try_recv().is_ok() {
                return;
            }
            StatActions::new(&stats, cfg.clone()).tick();
            thread::sleep(Duration::from_millis(interval));
        });

        RoutineRunner { stop_tx, join: Some(join) }
    }

    fn stop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for RoutineRunner {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.stop();
        }
    }
}

enum Dispatch {
    Continue,
    Quit,
}

/// Holds every registry the prompt grammar operates on: trackers and
/// policies and routines the operator has created by name, the ad-hoc
/// mover, and lazily-opened handles onto `/proc/kpageflags` and the
/// page-idle bitmap for `pages -pk`/`-pi`/`-si`.
struct Runtime {
    stats: Arc<StatsStore>,
    epoch: Instant,

    trackers:           HashMap<String, Box<dyn Tracker>>,
    active_tracker:     Option<String>,
    staged_tracker_name: Option<String>,

    policies:           HashMap<String, NamedConfig>,
    staged_policy_name: Option<String>,
    active_policy:      Option<String>,
    policy_runner:      Option<PolicyRunner>,

    routines:           Vec<(String, StatActionsConfig)>,
    active_routine_idx: Option<usize>,
    routine_runner:     Option<RoutineRunner>,

    mover: Option<MoverHandle>,

    idlebitmap: Option<ProcPageIdleBitmap>,
    kpageflags: Option<ProcKpageflags>,
}

impl Runtime {
    fn new(stats: Arc<StatsStore>) -> Self {
        Runtime {
            stats,
            epoch: Instant::now(),
            trackers: HashMap::new(),
            active_tracker: None,
            staged_tracker_name: None,
            policies: HashMap::new(),
            staged_policy_name: None,
            active_policy: None,
            policy_runner: None,
            routines: Vec::new(),
            active_routine_idx: None,
            routine_runner: None,
            mover: None,
            idlebitmap: None,
            kpageflags: None,
        }
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn active_tracker_ref(&self) -> Option<&Box<dyn Tracker>> {
        self.active_tracker.as_ref().and_then(|n| self.trackers.get(n))
    }

    fn active_tracker_mut(&mut self) -> Option<&mut Box<dyn Tracker>> {
        let name = self.active_tracker.clone()?;
        self.trackers.get_mut(&name)
    }

    fn idlebitmap_reader(&mut self) -> Result<&mut ProcPageIdleBitmap, Error> {
        if self.idlebitmap.is_none() {
            self.idlebitmap = Some(ProcPageIdleBitmap::open()?);
        }
        Ok(self.idlebitmap.as_mut().unwrap())
    }

    fn kpageflags_reader(&mut self) -> Result<&mut ProcKpageflags, Error> {
        if self.kpageflags.is_none() {
            self.kpageflags = Some(ProcKpageflags::open()?);
        }
        Ok(self.kpageflags.as_mut().unwrap())
    }

    fn dispatch(&mut self, line: &str) -> Dispatch {
        let tokens: Vec<&str> = line.split_whitespace().collect();

        match Command::from_iter_safe(tokens.iter().copied()) {
            Ok(Command::Help) => {
                println!("{}", HELP_TEXT);
                Dispatch::Continue
            }
            Ok(Command::Q) => Dispatch::Quit,
            Ok(Command::Tracker(args)) => {
                self.handle_tracker(args);
                Dispatch::Continue
            }
            Ok(Command::Pages(args)) => {
                self.handle_pages(args);
                Dispatch::Continue
            }
            Ok(Command::Arange(args)) => {
                self.handle_arange(args);
                Dispatch::Continue
            }
            Ok(Command::Mover(args)) => {
                self.handle_mover(args);
                Dispatch::Continue
            }
            Ok(Command::Policy(args)) => {
                self.handle_policy(args);
                Dispatch::Continue
            }
            Ok(Command::Routines(args)) => {
                self.handle_routines(args);
                Dispatch::Continue
            }
            Ok(Command::Swap(args)) => {
                self.handle_swap(args);
                Dispatch::Continue
            }
            Ok(Command::Stats(args)) => {
                self.handle_stats(args);
                Dispatch::Continue
            }
            Err(_) => {
                match config::exec_line(line) {
                    Ok(spec) => {
                        if let Err(err) = spec.run() {
                            println!("shell: {}", err);
                        }
                    }
                    Err(err) => println!("{}", err),
                }
                Dispatch::Continue
            }
        }
    }

    fn handle_tracker(&mut self, args: TrackerArgs) {
        if args.ls {
            for name in self.trackers.keys() {
                let marker = if self.active_tracker.as_deref() == Some(name.as_str()) { "*" } else { " " };
                println!("{} {}", marker, name);
            }
        }

        if let Some(name) = args.create {
            self.staged_tracker_name = Some(name.clone());
            self.active_tracker = Some(name);
        }

        if let Some(json) = args.config {
            let Some(name) = self.staged_tracker_name.clone().or_else(|| self.active_tracker.clone()) else {
                println!("tracker: no name staged, use -create NAME first");
                return;
            };
            match serde_json::from_str::<NamedConfig>(&json) {
                Ok(named) => match config::build_tracker(&named) {
                    Ok(tracker) => {
                        self.trackers.insert(name.clone(), tracker);
                        self.active_tracker = Some(name);
                    }
                    Err(err) => println!("tracker: {}", err),
                },
                Err(err) => println!("tracker: invalid config json: {}", err),
            }
        }

        if let Some(pids) = args.start {
            let pids = parse_pid_list(&pids);
            match self.active_tracker_mut() {
                Some(tracker) => {
                    if let Err(err) = tracker.start() {
                        println!("tracker: {}", err);
                    } else if let Err(err) = tracker.add_pids(&pids) {
                        println!("tracker: {}", err);
                    }
                }
                None => println!("tracker: no active tracker, use -create NAME -config JSON first"),
            }
        }

        if args.stop {
            if let Some(tracker) = self.active_tracker_mut() {
                if let Err(err) = tracker.stop() {
                    println!("tracker: {}", err);
                }
            }
        }

        if args.counters {
            if let Some(tracker) = self.active_tracker_ref() {
                for tc in tracker.get_counters() {
                    println!("{:?}", tc);
                }
            }
        }

        if args.heat {
            if let Some(tracker) = self.active_tracker_ref() {
                let counters = tracker.get_counters();
                let mut heatmap = Heatmap::new(HeatmapConfig::default());
                heatmap.update_from_counters(&counters, self.now_ns());

                let pids: std::collections::HashSet<usize> = counters.iter().map(|tc| tc.pid()).collect();
                for pid in pids {
                    for hr in heatmap.ranges(pid) {
                        println!(
                            "pid={} addr={:#x} length={} heat={:.4} class={}",
                            pid,
                            hr.addr,
                            hr.length,
                            hr.heat,
                            heat_class(heatmap.config(), hr)
                        );
                    }
                }
            }
        }

        if args.reset {
            if let Some(tracker) = self.active_tracker_mut() {
                tracker.reset_counters();
            }
        }

        if let Some(dump_args) = args.dump {
            if let Some(tracker) = self.active_tracker_ref() {
                match tracker.dump(&dump_args) {
                    Ok(out) => println!("{}", out),
                    Err(err) => println!("tracker: {}", err),
                }
            }
        }
    }

    fn handle_pages(&mut self, args: PagesArgs) {
        let ranges = match self.ranges_for(args.pid, &args.ranges) {
            Ok(r) => r,
            Err(err) => {
                println!("pages: {}", err);
                return;
            }
        };

        let attrs = match &args.attrs {
            Some(s) => match s.parse::<PageAttrs>() {
                Ok(a) => a,
                Err(err) => {
                    println!("pages: {}", err);
                    return;
                }
            },
            None => PageAttrs { present: Some(true), ..Default::default() },
        };

        if let Some(n) = args.pr {
            let reader = ProcPagemap::open(args.pid, Readahead::default());
            let mut shown = 0usize;
            let result = reader.for_each_page(&ranges, |addr, pte| {
                if shown >= n {
                    return -1;
                }
                println!("{:#x}: {:?}", addr, pte);
                shown += 1;
                0
            });
            if let Err(err) = result {
                println!("pages: {}", err);
            }
            return;
        }

        if let Some(node_id) = args.pm {
            match ranges.pages_matching(attrs) {
                Ok(pages) if !pages.is_empty() => {
                    let dest = vec![Node::new(args.node.unwrap_or(node_id)); pages.len()];
                    match movepages::move_pages(args.pid as i32, &pages, Some(&dest), movepages::MPOL_MF_MOVE) {
                        Ok(result) => println!("moved {} pages, status={:?}", pages.len(), result.status),
                        Err(err) => println!("pages: {}", err),
                    }
                }
                Ok(_) => println!("pages: no matching pages"),
                Err(err) => println!("pages: {}", err),
            }
            return;
        }

        if let Some(pfn_hex) = &args.pk {
            let pfn = match parse_hex_pfn(pfn_hex) {
                Ok(pfn) => pfn,
                Err(err) => {
                    println!("pages: {}", err);
                    return;
                }
            };
            match self.kpageflags_reader().and_then(|r| r.read_flags(pfn)) {
                Ok(flags) => println!("{:?}", flags),
                Err(err) => println!("pages: {}", err),
            }
            return;
        }

        if let Some(pfn_hex) = &args.pi {
            let pfn = match parse_hex_pfn(pfn_hex) {
                Ok(pfn) => pfn,
                Err(err) => {
                    println!("pages: {}", err);
                    return;
                }
            };
            match self.idlebitmap_reader().and_then(|r| r.get_idle(pfn)) {
                Ok(idle) => println!("idle={}", idle),
                Err(err) => println!("pages: {}", err),
            }
            return;
        }

        if let Some(pfn_hex) = &args.si {
            let pfn = match parse_hex_pfn(pfn_hex) {
                Ok(pfn) => pfn,
                Err(err) => {
                    println!("pages: {}", err);
                    return;
                }
            };
            match self.idlebitmap_reader().and_then(|r| r.set_idle(pfn)) {
                Ok(()) => println!("marked idle"),
                Err(err) => println!("pages: {}", err),
            }
            return;
        }

        match ranges.pages_matching(attrs) {
            Ok(pages) => println!("{} matching pages over {} ranges", pages.len(), ranges.iter().count()),
            Err(err) => println!("pages: {}", err),
        }
    }

    fn ranges_for(&self, pid: usize, ranges_arg: &Option<String>) -> Result<AddrRanges, Error> {
        match ranges_arg {
            Some(s) => parse_ranges(s).map(|r| AddrRanges::new(pid, r)),
            None => proc_maps_eligible(pid),
        }
    }

    fn handle_arange(&mut self, args: ArangeArgs) {
        let mut ranges = match proc_maps_eligible(args.pid) {
            Ok(r) => r,
            Err(err) => {
                println!("arange: {}", err);
                return;
            }
        };

        if let Some(max) = args.split_length {
            ranges = ranges.split_length(max);
        }

        if let Some(min) = args.min_length {
            ranges = ranges.filter(|r| r.length() >= min);
        }

        if args.ls {
            for r in ranges.iter() {
                println!("{}", r);
            }
        }

        println!("{} ranges, {} pages", ranges.iter().count(), ranges.page_count());
    }

    fn handle_mover(&mut self, args: MoverArgs) {
        if args.stop {
            if let Some(mut handle) = self.mover.take() {
                handle.stop();
                println!("mover stopped");
            }
            return;
        }

        if let Some(json) = &args.config {
            match serde_json::from_str::<MoverConfig>(json) {
                Ok(cfg) => {
                    if let Some(mut old) = self.mover.take() {
                        old.stop();
                    }
                    self.mover = Some(MoverHandle::spawn(cfg));
                    println!("mover reconfigured");
                }
                Err(err) => println!("mover: invalid config json: {}", err),
            }
            return;
        }

        if args.start && self.mover.is_none() {
            self.mover = Some(MoverHandle::spawn(MoverConfig::default()));
            println!("mover started");
        }

        let Some(handle) = self.mover.as_mut() else {
            println!("mover: not running, use -start");
            return;
        };

        if args.pause {
            handle.pause();
        }
        if args.r#continue {
            handle.resume();
        }
        if let Some(pages) = args.pages_to {
            handle.set_pages_override(pages);
        }
        if args.tasks {
            for (idx, task) in handle.tasks().iter().enumerate() {
                println!("[{}] pid={} to={} offset={}/{}", idx, task.pid, task.to, task.offset, task.pages.len());
            }
        }
        if let Some(idx) = args.remove_task {
            match handle.remove_task_at(idx) {
                Some(task) => println!("removed task for pid {}", task.pid),
                None => println!("mover: no task at index {}", idx),
            }
        }
    }

    fn handle_policy(&mut self, args: PolicyArgs) {
        if args.ls {
            for name in self.policies.keys() {
                let marker = if self.active_policy.as_deref() == Some(name.as_str()) { "*" } else { " " };
                println!("{} {}", marker, name);
            }
        }

        if let Some(name) = args.create {
            self.staged_policy_name = Some(name);
        }

        if let Some(json) = &args.config {
            let Some(name) = self.staged_policy_name.clone() else {
                println!("policy: no name staged, use -create NAME first");
                return;
            };
            match serde_json::from_str::<NamedConfig>(json) {
                Ok(named) => {
                    self.policies.insert(name.clone(), named);
                    self.active_policy = Some(name);
                }
                Err(err) => println!("policy: invalid config json: {}", err),
            }
        }

        if args.start {
            if self.policy_runner.is_some() {
                println!("policy: already running, -stop first");
                return;
            }
            let Some(name) = self.active_policy.clone() else {
                println!("policy: no active policy, use -create/-config first");
                return;
            };
            let Some(named) = self.policies.get(&name).cloned() else {
                println!("policy: unknown policy {:?}", name);
                return;
            };
            match config::build_policy(&named) {
                Ok(built) => {
                    self.policy_runner = Some(PolicyRunner::spawn(built));
                    println!("policy started");
                }
                Err(err) => println!("policy: {}", err),
            }
        }

        if args.stop {
            if let Some(mut runner) = self.policy_runner.take() {
                runner.stop();
                println!("policy stopped");
            }
        }

        if args.dump {
            if let Some(name) = &self.active_policy {
                if let Some(named) = self.policies.get(name) {
                    println!("{}", serde_json::to_string_pretty(named).unwrap_or_default());
                }
            }
        }
    }

    fn handle_routines(&mut self, args: RoutinesArgs) {
        if args.ls {
            for (idx, (name, _)) in self.routines.iter().enumerate() {
                let marker = if self.active_routine_idx == Some(idx) { "*" } else { " " };
                println!("{} [{}] {}", marker, idx, name);
            }
        }

        if let Some(name) = args.create {
            self.routines.push((name, StatActionsConfig::default()));
            self.active_routine_idx = Some(self.routines.len() - 1);
        }

        if let Some(json) = &args.config {
            let Some(idx) = self.active_routine_idx else {
                println!("routines: no active routine, use -create NAME first");
                return;
            };
            match serde_json::from_str::<StatActionsConfig>(json) {
                Ok(cfg) => self.routines[idx].1 = cfg,
                Err(err) => println!("routines: invalid config json: {}", err),
            }
        }

        if let Some(idx) = args.r#use {
            if idx < self.routines.len() {
                self.active_routine_idx = Some(idx);
            } else {
                println!("routines: no routine at index {}", idx);
            }
        }

        if args.start {
            if self.routine_runner.is_some() {
                println!("routines: already running, -stop first");
                return;
            }
            let Some(idx) = self.active_routine_idx else {
                println!("routines: no active routine");
                return;
            };
            let cfg = self.routines[idx].1.clone();
            self.routine_runner = Some(RoutineRunner::spawn(Arc::clone(&self.stats), cfg));
            println!("routine started");
        }

        if args.stop {
            if let Some(mut runner) = self.routine_runner.take() {
                runner.stop();
                println!("routine stopped");
            }
        }
    }

    fn handle_swap(&mut self, args: SwapArgs) {
        let ranges = match self.ranges_for(args.pid, &args.ranges) {
            Ok(r) => r,
            Err(err) => {
                println!("swap: {}", err);
                return;
            }
        };

        if args.out {
            match ranges.swap_out() {
                Ok(n) => println!("madvised {} ranges MADV_PAGEOUT", n),
                Err(err) => println!("swap: {}", err),
            }
            return;
        }

        if args.r#in {
            match madvise::Pidfd::open(args.pid as i32) {
                Ok(pidfd) => match madvise::process_madvise(&pidfd, &ranges, madvise::MADV_WILLNEED) {
                    Ok(n) => println!("madvised {} ranges MADV_WILLNEED", n),
                    Err(err) => println!("swap: {}", err),
                },
                Err(err) => println!("swap: {}", err),
            }
            return;
        }

        if !args.status && !args.vaddrs {
            return;
        }

        let present = ranges.pages_matching(PageAttrs { present: Some(true), ..Default::default() }).unwrap_or_default();
        let swapped = ranges.pages_matching(PageAttrs { present: Some(false), ..Default::default() }).unwrap_or_default();

        if args.status {
            println!("{} pages present, {} pages swapped", present.len(), swapped.len());
        }
        if args.vaddrs {
            for addr in &swapped {
                println!("{:#x}", addr);
            }
        }
    }

    fn handle_stats(&mut self, args: StatsArgs) {
        let mut handled = false;

        if let Some(pid) = args.lm {
            handled = true;
            match self.stats.last_move(pid) {
                Some(event) => println!("{:?}", event),
                None => println!("stats: no move recorded for pid {}", pid),
            }
        }

        if let Some(pid) = args.le {
            handled = true;
            match self.stats.last_move_with_error(pid) {
                Some(event) => println!("{:?}", event),
                None => println!("stats: no failed move recorded for pid {}", pid),
            }
        }

        if args.dump {
            handled = true;
            for event in self.stats.dump(|_| true) {
                println!("{:?}", event);
            }
        }

        if !handled {
            println!("{:?}", self.stats.summarize());
        }
    }
}

/// Owns a [`Runtime`] and drives its read-eval-print loop over any
/// `BufRead` (spec.md §6's `-prompt`: "interactive prompt on stdio").
pub struct Prompt {
    runtime: Runtime,
}

impl Prompt {
    pub fn new(stats: Arc<StatsStore>) -> Self {
        Prompt { runtime: Runtime::new(stats) }
    }

    /// Reads lines until `q` or EOF, dispatching each through the grammar.
    /// Returns the process exit code: `0` on a clean `q` or EOF.
    pub fn run<R: BufRead>(&mut self, mut input: R) -> i32 {
        loop {
            print!("tierd> ");
            if io::stdout().flush().is_err() {
                return 0;
            }

            let mut line = String::new();
            match input.read_line(&mut line) {
                Ok(0) | Err(_) => return 0,
                Ok(_) => {}
            }

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match self.runtime.dispatch(line) {
                Dispatch::Quit => return 0,
                Dispatch::Continue => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ranges_splits_on_comma() {
        let ranges = parse_ranges("1000,2000-3000").unwrap();
        assert_eq!(ranges.len(), 2);
    }

    #[test]
    fn parse_pid_list_ignores_unparseable_entries() {
        assert_eq!(parse_pid_list("1, 2,x,3"), vec![1, 2, 3]);
    }

    #[test]
    fn parse_hex_pfn_accepts_0x_prefix() {
        assert_eq!(parse_hex_pfn("0x1f").unwrap(), 0x1f);
        assert_eq!(parse_hex_pfn("1f").unwrap(), 0x1f);
    }

    #[test]
    fn help_and_quit_are_recognized() {
        let mut rt = Runtime::new(Arc::new(StatsStore::new(16)));
        assert!(matches!(rt.dispatch("help"), Dispatch::Continue));
        assert!(matches!(rt.dispatch("q"), Dispatch::Quit));
    }

    #[test]
    fn unparseable_line_falls_back_to_shell() {
        let mut rt = Runtime::new(Arc::new(StatsStore::new(16)));
        assert!(matches!(rt.dispatch("true"), Dispatch::Continue));
    }

    #[test]
    fn mover_tasks_without_start_reports_not_running() {
        let mut rt = Runtime::new(Arc::new(StatsStore::new(16)));
        assert!(matches!(rt.dispatch("mover --tasks"), Dispatch::Continue));
    }

    #[test]
    fn tracker_ls_on_empty_registry_does_not_panic() {
        let mut rt = Runtime::new(Arc::new(StatsStore::new(16)));
        assert!(matches!(rt.dispatch("tracker --ls"), Dispatch::Continue));
    }

    #[test]
    fn stats_dump_on_empty_store_does_not_panic() {
        let mut rt = Runtime::new(Arc::new(StatsStore::new(16)));
        assert!(matches!(rt.dispatch("stats --dump"), Dispatch::Continue));
    }
}
