//! A node hosting a bank of accounts. It serves its failure monitor to remote
//! heartbeat senders and drives a transfer workload against the accounts, so
//! the monitor tracks every transaction holding a ticket here.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use optsva::{
    serve_monitor_on, snapshot_wait_stats, OptsvaConfig, OptsvaError, Runtime, SharedObject,
    SharedObjectHost, SnapshotImage,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
optsva-node: host accounts and run transfer transactions against them

  --listen=ADDR      monitor endpoint address (default 127.0.0.1:7410)
  --accounts=N       number of hosted accounts (default 8)
  --workers=N        concurrent transfer threads (default 4)
  --transfers=N      transfers per worker (default 100)
  --config=PATH      JSON configuration; OPTSVA_* variables override it
  --images=DIR       write a framed snapshot image of every account on exit
  --help             print this text";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Account {
    balance: i64,
}

impl SharedObject for Account {
    type Write = i64;

    fn apply(&mut self, delta: &i64) {
        self.balance += delta;
    }
}

#[derive(Debug, Clone, PartialEq)]
struct NodeOptions {
    listen: SocketAddr,
    accounts: usize,
    workers: usize,
    transfers: usize,
    config: Option<PathBuf>,
    images: Option<PathBuf>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 7410)),
            accounts: 8,
            workers: 4,
            transfers: 100,
            config: None,
            images: None,
        }
    }
}

/// `None` means help was asked for. Both `--flag=value` and `--flag value`
/// are accepted.
fn parse_options(args: impl IntoIterator<Item = String>) -> Result<Option<NodeOptions>, String> {
    let mut options = NodeOptions::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--help" || arg == "-h" {
            return Ok(None);
        }
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg, None),
        };
        let value = match inline.or_else(|| args.next()) {
            Some(value) => value,
            None => return Err(format!("{flag} needs a value")),
        };
        match flag.as_str() {
            "--listen" => options.listen = parse_value(&flag, &value)?,
            "--accounts" => options.accounts = parse_value(&flag, &value)?,
            "--workers" => options.workers = parse_value(&flag, &value)?,
            "--transfers" => options.transfers = parse_value(&flag, &value)?,
            "--config" => options.config = Some(PathBuf::from(value)),
            "--images" => options.images = Some(PathBuf::from(value)),
            other => return Err(format!("unknown option {other}")),
        }
    }
    if options.accounts < 2 {
        return Err("--accounts must be at least 2".into());
    }
    Ok(Some(options))
}

fn parse_value<V: std::str::FromStr>(flag: &str, value: &str) -> Result<V, String> {
    value
        .parse()
        .map_err(|_| format!("{flag}: cannot parse '{value}'"))
}

fn load_config(options: &NodeOptions) -> Result<OptsvaConfig, OptsvaError> {
    let base = match &options.config {
        Some(path) => OptsvaConfig::from_file(path)?,
        None => OptsvaConfig::default(),
    };
    base.with_overrides(|key| std::env::var(key).ok())
}

/// Deterministic pair walk: worker `w` moves `1..=5` units per step between
/// two distinct accounts.
fn transfer_plan(worker: usize, step: usize, accounts: usize) -> (usize, usize, i64) {
    let from = (worker + step) % accounts;
    let to = (from + 1 + (worker * 7 + step * 3) % (accounts - 1)) % accounts;
    (from, to, (step % 5) as i64 + 1)
}

fn run_transfers(
    rt: &Runtime,
    accounts: &[Arc<SharedObjectHost<Account>>],
    workers: usize,
    transfers: usize,
) -> Result<usize, OptsvaError> {
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                scope.spawn(move || -> Result<usize, OptsvaError> {
                    let mut done = 0;
                    for step in 0..transfers {
                        let (from, to, amount) = transfer_plan(worker, step, accounts.len());
                        let moved = rt.atomic(|tx| {
                            let source = tx.accesses(&accounts[from], 1, 1)?;
                            let target = tx.writes(&accounts[to], 1)?;
                            tx.start()?;
                            if source.read(|acc| acc.balance)? < amount {
                                return Ok(false);
                            }
                            source.write(-amount)?;
                            target.write(amount)?;
                            Ok(true)
                        });
                        match moved {
                            Ok(true) => done += 1,
                            Ok(false) => {}
                            Err(err) if err.is_forced_rollback() => {
                                warn!(worker, step, error = %err, "transfer rolled back");
                            }
                            Err(err) => return Err(err),
                        }
                    }
                    Ok(done)
                })
            })
            .collect();

        let mut total = 0;
        for handle in handles {
            match handle.join() {
                Ok(done) => total += done?,
                Err(_) => {
                    return Err(OptsvaError::InvalidTransactionState(
                        "transfer worker panicked".into(),
                    ))
                }
            }
        }
        Ok(total)
    })
}

/// Writes `<dir>/<name>.osvi` per account, read back by `SnapshotImage::decode`.
fn write_images(
    dir: &Path,
    accounts: &[Arc<SharedObjectHost<Account>>],
) -> Result<Vec<PathBuf>, OptsvaError> {
    std::fs::create_dir_all(dir)?;
    let mut written = Vec::with_capacity(accounts.len());
    for account in accounts {
        let image = account.take_snapshot()?;
        let path = dir.join(format!("{}.osvi", account.key().name()));
        std::fs::write(&path, image.encode()?)?;
        written.push(path);
    }
    Ok(written)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = match parse_options(std::env::args().skip(1)) {
        Ok(Some(options)) => options,
        Ok(None) => {
            println!("{USAGE}");
            return Ok(());
        }
        Err(message) => {
            eprintln!("error: {message}\n\n{USAGE}");
            std::process::exit(2);
        }
    };

    let rt = Arc::new(Runtime::new(load_config(&options)?)?);
    let accounts: Vec<_> = (0..options.accounts)
        .map(|i| rt.host(format!("account-{i}"), Account { balance: 1_000 }))
        .collect();

    let listener = TcpListener::bind(options.listen).await?;
    info!(addr = %listener.local_addr()?, accounts = accounts.len(), "node serving its monitor");
    let endpoint = tokio::spawn(serve_monitor_on(listener, Arc::clone(rt.monitor())));

    let workload_rt = Arc::clone(&rt);
    let workload_accounts = accounts.clone();
    let (workers, transfers) = (options.workers, options.transfers);
    let done = tokio::task::spawn_blocking(move || {
        run_transfers(&workload_rt, &workload_accounts, workers, transfers)
    })
    .await??;

    let total: i64 = accounts.iter().map(|a| a.clone_object().balance).sum();
    info!(
        transfers = done,
        total,
        tracked = rt.monitor().tracked(),
        heartbeats = rt.monitor().heartbeats_received(),
        "workload finished"
    );
    if rt.config().wait_stats_enabled {
        println!("{}", serde_json::to_string_pretty(&snapshot_wait_stats())?);
    }

    if let Some(dir) = &options.images {
        let written = write_images(dir, &accounts)?;
        info!(dir = %dir.display(), images = written.len(), "wrote account images");
    }

    endpoint.abort();
    let _ = tokio::task::spawn_blocking(move || rt.shutdown()).await;
    Ok(())
}
