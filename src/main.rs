use std::future::pending;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use load_governor::sampler::{Sampler, SystemProbe};
use load_governor::{
    launch, start_coordinated, start_session, ControlState, Coordinator, Profile, ResourceKind, ScheduleAction,
    Scheduler, SessionHandle, SessionSpec, SimulatedPlant, StateSnapshot, Target,
};
use tokio::runtime::Handle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SCHEDULE_POLL: Duration = Duration::from_secs(30);
const SIMULATED_MEMORY: u64 = 16 * 1024 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "load-governor", version, about = "Hold CPU or memory utilization at a target")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one session until stopped.
    Run(RunArgs),
    /// Print utilization readings.
    Sample {
        #[arg(default_value = "cpu")]
        kind: ResourceKind,
        #[arg(long, default_value_t = 5)]
        count: u32,
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// Start and stop the profile's sessions on its daily schedule.
    Schedule {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Keep the cpu and memory sessions from pushing while the other overshoots.
        #[arg(long)]
        coordinate: bool,
    },
    /// Manage the stored profile.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
struct RunArgs {
    kind: ResourceKind,
    /// Utilization to hold, in percent. Defaults to the profile's target.
    #[arg(long)]
    target: Option<f64>,
    #[arg(long)]
    period_ms: Option<u64>,
    /// Stop after this many seconds.
    #[arg(long)]
    duration_secs: Option<u64>,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Drive a simulated machine instead of this one.
    #[arg(long)]
    simulate: bool,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write the default profile.
    Init {
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        force: bool,
    },
    /// Print the effective profile.
    Show {
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        fmt.json().init();
    } else {
        fmt.init();
    }
}

fn load_profile(path: Option<PathBuf>) -> anyhow::Result<Profile> {
    let path = path.unwrap_or_else(Profile::default_path);
    Profile::load_or_default(&path).with_context(|| format!("loading profile {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Sample {
            kind,
            count,
            interval_ms,
        } => sample(kind, count, Duration::from_millis(interval_ms)).await,
        Command::Schedule { config, coordinate } => {
            let mut profile = load_profile(config)?;
            profile.coordinate |= coordinate;
            schedule(profile).await
        }
        Command::Config { action } => manage_config(action),
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let profile = load_profile(args.config)?;
    let mut control = profile.control.clone();
    if let Some(period_ms) = args.period_ms {
        control.period_ms = period_ms;
    }
    let percent = args.target.or(profile.target(args.kind)).unwrap_or(50.0);
    let spec = SessionSpec::new(args.kind, Target::new(percent)?, control.period());

    let session = if args.simulate {
        let plant = SimulatedPlant::new(10.0, num_cpus::get(), SIMULATED_MEMORY);
        info!(baseline = 10.0, "driving a simulated machine");
        launch(&Handle::current(), spec, &control, plant.session_parts(args.kind))?
    } else {
        start_session(spec, &control)?
    };
    info!(session = session.id(), "press Ctrl-C to stop, twice to force");

    let snapshot = watch_until_done(&session, args.duration_secs.map(Duration::from_secs)).await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    match (snapshot.state, &snapshot.failure) {
        (ControlState::Failed, Some(reason)) => bail!("session {} failed: {reason}", snapshot.session_id),
        _ => Ok(()),
    }
}

async fn watch_until_done(session: &SessionHandle, duration: Option<Duration>) -> StateSnapshot {
    let mut updates = session.subscribe();
    let mut deadline = duration.map(|d| Instant::now() + d);
    let mut interrupts = 0u32;
    let mut last_tick = 0;

    loop {
        let timer = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => pending().await,
            }
        };
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    return session.state();
                }
                let snapshot = updates.borrow_and_update().clone();
                if snapshot.ticks != last_tick {
                    last_tick = snapshot.ticks;
                    report(&snapshot);
                }
                if snapshot.state.is_terminal() {
                    return snapshot;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                interrupts += 1;
                if interrupts == 1 {
                    info!("stopping");
                    session.stop();
                } else {
                    warn!("forcing emergency stop");
                    session.emergency_stop();
                }
            }
            _ = timer => {
                info!("duration elapsed, stopping");
                deadline = None;
                session.stop();
            }
        }
    }
}

fn report(snapshot: &StateSnapshot) {
    let reading = snapshot.reading.as_ref().map_or(0.0, |r| r.percent);
    let stale = snapshot.reading.as_ref().is_some_and(|r| r.stale);
    println!(
        "{:>10} tick {:>5}  {:>5.1}% -> {}  workers {:>3}  duty {:.2}  bytes {:>12}{}",
        snapshot.session_id,
        snapshot.ticks,
        reading,
        snapshot.target,
        snapshot.active_workers,
        snapshot.duty,
        snapshot.resident_bytes,
        if stale { "  (stale)" } else { "" },
    );
}

async fn sample(kind: ResourceKind, count: u32, interval: Duration) -> anyhow::Result<()> {
    let mut sampler = Sampler::new(kind, Box::new(SystemProbe::new(kind)), 1.0);
    for _ in 0..count {
        sleep(interval).await;
        println!("{}", serde_json::to_string(&sampler.sample())?);
    }
    Ok(())
}

async fn schedule(profile: Profile) -> anyhow::Result<()> {
    let mut scheduler = Scheduler::new(profile.schedules.clone())?;
    if scheduler.entries().is_empty() {
        bail!("the profile has no schedule entries");
    }
    for entry in scheduler.entries() {
        info!(at = %entry.at.format("%H:%M"), action = ?entry.action, "scheduled");
    }

    let mut sessions: Vec<SessionHandle> = Vec::new();
    let mut poll = tokio::time::interval(SCHEDULE_POLL);
    loop {
        tokio::select! {
            _ = poll.tick() => {
                for action in scheduler.due(Local::now().naive_local()) {
                    match action {
                        ScheduleAction::Start if sessions.iter().any(|s| !s.state().state.is_terminal()) => {
                            info!("sessions already running");
                        }
                        ScheduleAction::Start => sessions = start_profile_sessions(&profile)?,
                        ScheduleAction::Stop => stop_sessions(&mut sessions).await,
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                stop_sessions(&mut sessions).await;
                return Ok(());
            }
        }
    }
}

fn start_profile_sessions(profile: &Profile) -> anyhow::Result<Vec<SessionHandle>> {
    let coordinator = profile
        .coordinate
        .then(|| Coordinator::new(profile.control.coordination_tolerance_percent));
    let mut sessions = Vec::new();
    for kind in [ResourceKind::Cpu, ResourceKind::Memory] {
        let Some(percent) = profile.target(kind) else {
            continue;
        };
        let spec = SessionSpec::new(kind, Target::new(percent)?, profile.control.period());
        let started = match &coordinator {
            Some(coordinator) => start_coordinated(&Handle::current(), spec, &profile.control, coordinator),
            None => start_session(spec, &profile.control),
        };
        let session = started.with_context(|| format!("starting {kind} session"))?;
        info!(session = session.id(), target = percent, "scheduled session started");
        sessions.push(session);
    }
    Ok(sessions)
}

async fn stop_sessions(sessions: &mut Vec<SessionHandle>) {
    for session in sessions.drain(..) {
        let last = session.stop_and_wait().await;
        info!(session = session.id(), state = ?last.state, "scheduled session ended");
    }
}

fn manage_config(action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init { path, force } => {
            let path = path.unwrap_or_else(Profile::default_path);
            if path.exists() && !force {
                bail!("{} already exists, pass --force to overwrite", path.display());
            }
            Profile::default()
                .save(&path)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("wrote {}", path.display());
        }
        ConfigAction::Show { path } => {
            let profile = load_profile(path)?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
        }
    }
    Ok(())
}
