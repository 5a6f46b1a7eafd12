mod candidate_store;
mod error;
mod handlers;
mod probe;
mod publisher;
mod scheduler;
mod selection;
mod server;
mod types;

use candidate_store::CandidateStore;
use clap::{Parser, Subcommand};
use probe::{HttpProbe, DEFAULT_TARGET_URL};
use publisher::StatusPublisher;
use scheduler::{ScheduleSettings, Scheduler};
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::{signal, sync::Notify};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use types::Candidate;

/// Conventional status for a process ended by SIGINT.
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "proxies.json", help = "JSON array of candidate proxy addresses")]
    proxies_file: PathBuf,
    #[arg(long, default_value = "proxy_status.json", help = "Where the status record is published")]
    status_file: PathBuf,
    #[arg(long, default_value = DEFAULT_TARGET_URL, help = "Endpoint fetched through each proxy; must answer 204 with no body")]
    target_url: String,
    #[arg(
        long,
        default_value = "10",
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Per-probe timeout, in seconds"
    )]
    timeout_secs: u64,
    #[arg(long, default_value = "10000", help = "Highest delay, in milliseconds, a proxy may have and still be selected")]
    max_delay_ms: u64,
    #[arg(
        long,
        default_value = "300",
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Wait between probe cycles, in seconds"
    )]
    interval_secs: u64,
    /// Upper bound on simultaneous probes. 1 probes one proxy at a time.
    #[arg(long, default_value = "1", value_parser = clap::value_parser!(u16).range(1..))]
    max_parallel_probes: u16,
    /// Re-read the proxies file before every cycle
    #[arg(long)]
    reload_candidates: bool,
    /// Also serve the status pages on this address, e.g. 0.0.0.0:5000
    #[arg(long)]
    listen: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Probe every proxy once, publish the result and exit
    Once,

    /// Serve the status pages for an existing status file without probing
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long, default_value = "5000")]
        port: u16,
    },
}

impl Args {
    fn schedule_settings(&self) -> ScheduleSettings {
        ScheduleSettings {
            interval: Duration::from_secs(self.interval_secs),
            max_delay_ms: self.max_delay_ms,
            max_parallel_probes: usize::from(self.max_parallel_probes),
            reload_candidates: self.reload_candidates,
        }
    }

    fn prober(&self) -> HttpProbe {
        HttpProbe::new(
            self.target_url.clone(),
            Duration::from_secs(self.timeout_secs),
            self.max_delay_ms,
        )
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let shutdown_notify = Arc::new(Notify::new());
    tokio::spawn({
        let interrupt_handle = shutdown_notify.clone();
        async move {
            match watch_interrupts(interrupt_handle, signal::ctrl_c).await {
                Ok(()) => {
                    warn!("Second interrupt received, exiting without waiting");
                    std::process::exit(INTERRUPTED_EXIT_CODE);
                }
                Err(e) => error!("Failed to listen for shutdown signal: {}", e),
            }
        }
    });

    if let Some(Command::Serve { host, port }) = &args.command {
        let addr = format!("{}:{}", host, port);
        server::run_status_server(addr, args.status_file.clone(), shutdown_notify).await?;
        return Ok(());
    }

    let store = CandidateStore::new(&args.proxies_file);
    let candidates = load_or_exit(&store);
    let scheduler = Scheduler::new(
        store,
        candidates,
        Arc::new(args.prober()),
        StatusPublisher::new(&args.status_file),
        args.schedule_settings(),
    );

    if let Some(Command::Once) = &args.command {
        let mut scheduler = scheduler;
        let interrupt = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for interrupt: {}", e);
                std::future::pending::<()>().await;
            }
        };
        match scheduler.run_once(interrupt).await {
            Some(snapshot) => {
                if let Some(best) = snapshot.best {
                    println!("{}", best.candidate);
                }
                return Ok(());
            }
            None => std::process::exit(INTERRUPTED_EXIT_CODE),
        }
    }

    let server_handle = tokio::spawn({
        let listen = args.listen.clone();
        let status_path = args.status_file.clone();
        let server_shutdown = shutdown_notify.clone();
        async move {
            if let Some(addr) = listen {
                if let Err(e) = server::run_status_server(addr, status_path, server_shutdown).await {
                    error!("Server error: {}", e);
                }
            }
        }
    });

    let scheduler_handle = tokio::spawn(async move {
        scheduler.run(shutdown_notify).await;
    });

    // Wait for both the front-end and the scheduler to exit
    let _ = tokio::try_join!(server_handle, scheduler_handle);
    info!("Shut down");

    Ok(())
}

/// Wait for the first interrupt and broadcast it on `shutdown`, then wait for
/// a second one. Returns once the second interrupt arrives.
async fn watch_interrupts<F, Fut>(shutdown: Arc<Notify>, mut interrupt: F) -> io::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    interrupt().await?;
    info!("Interrupt received, shutting down after the current cycle");
    shutdown.notify_waiters();
    interrupt().await
}

fn load_or_exit(store: &CandidateStore) -> Vec<Candidate> {
    match store.load() {
        Ok(candidates) => candidates,
        Err(e) => {
            error!("Cannot load candidates, exiting: {}", e);
            std::process::exit(1);
        }
    }
}
