use anyhow::{Context, Result};
use automountd::{
    run_timer, CommandHelper, Config, Controller, Daemon, HostInfo, JsonMapLoader, Session,
    SessionHandle,
};
use clap::{ArgAction, Parser};
use log::{error, info, warn, LevelFilter};
use signal_hook::consts::signal::{SIGHUP, SIGTERM, SIGUSR1};
use signal_hook::iterator::Signals;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tokio::signal;
use tokio::sync::Notify;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Root of the automounted namespace
    #[arg(short = 'd', long = "directory")]
    directory: Option<PathBuf>,

    /// Directory holding map files
    #[arg(long = "map-dir")]
    map_dir: Option<PathBuf>,

    /// Seconds a mount may stay idle before it is unmounted
    #[arg(short = 't', long = "timeout")]
    timeout: Option<u64>,

    /// Mount MAP at DIRECTORY; may be given more than once
    #[arg(
        short = 'm',
        long = "map",
        num_args = 2,
        value_names = ["DIRECTORY", "MAP"],
        action = ArgAction::Append
    )]
    maps: Vec<String>,

    /// Do not detach from the terminal
    #[arg(short, long)]
    foreground: bool,

    /// Pid file written when running as a daemon
    #[arg(long = "pid-file")]
    pid_file: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger based on verbose flag
    let log_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new().filter_level(log_level).init();

    let config = load_config(&cli)?;
    info!("Starting automountd...");

    // Forking has to happen before the runtime starts any threads.
    let daemon = (!cli.foreground).then(|| Daemon::new(&config.pid_file, "/"));
    if let Some(daemon) = &daemon {
        daemon.start()?;
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start the tokio runtime")?;
    let result = runtime.block_on(serve(config));
    if let Some(daemon) = &daemon {
        daemon.remove_pid_file();
    }
    result
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(directory) = &cli.directory {
        config.mount_directory = directory.clone();
    }
    if let Some(map_dir) = &cli.map_dir {
        config.map_directory = map_dir.clone();
    }
    if let Some(timeout) = cli.timeout {
        config.idle_timeout_secs = timeout;
    }
    if let Some(pid_file) = &cli.pid_file {
        config.pid_file = pid_file.clone();
    }
    for pair in cli.maps.chunks(2) {
        if let [directory, map] = pair {
            config.add_map(directory, map);
        }
    }
    Ok(config)
}

async fn serve(config: Config) -> Result<()> {
    let host = HostInfo::from_system()?;
    info!(
        "Host {} ({} {}, {})",
        host.host_name(),
        host.host_os(),
        host.host_os_version(),
        host.host_architecture()
    );

    let sweep_interval = config.sweep_interval();
    let session = Session::start(|notifier| {
        let helper = CommandHelper::new(&config, notifier);
        let loader = JsonMapLoader::new(&config.map_directory);
        Controller::new(config.clone(), host, Box::new(loader), Box::new(helper))
    })?;
    let handle = session.handle();

    let timer = tokio::spawn(run_timer(handle.clone(), sweep_interval));
    let terminate = Arc::new(Notify::new());
    spawn_signal_thread(handle.clone(), Arc::clone(&terminate))?;

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for interrupts: {}", e);
            }
            info!("Received interrupt");
        }
        _ = terminate.notified() => info!("Received terminate signal"),
    }

    timer.abort();
    match handle.unmount_all(true) {
        Ok(count) => info!("Unmounted {} filesystem(s)", count),
        Err(e) => warn!("Could not unmount on shutdown: {:#}", e),
    }
    session.shutdown()?;
    info!("automountd stopped");
    Ok(())
}

fn spawn_signal_thread(handle: SessionHandle, terminate: Arc<Notify>) -> Result<()> {
    let mut signals = Signals::new([SIGHUP, SIGUSR1, SIGTERM])?;
    thread::Builder::new()
        .name("automount-signals".to_string())
        .spawn(move || {
            for sig in signals.forever() {
                let sent = match sig {
                    SIGHUP => {
                        info!("Received SIGHUP, reloading maps");
                        handle.re_init()
                    }
                    SIGUSR1 => handle.print_tree().map(|_| ()),
                    SIGTERM => {
                        terminate.notify_one();
                        break;
                    }
                    _ => Ok(()),
                };
                if let Err(e) = sent {
                    error!("Signal {} not delivered: {:#}", sig, e);
                    break;
                }
            }
        })
        .context("failed to start the signal thread")?;
    Ok(())
}
