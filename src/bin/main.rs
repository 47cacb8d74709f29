//! mailcache binary: list the newest messages of one account folder

use clap::Parser;
use futures::prelude::*;
use mailcache::{Account, Config, MessageInfo, Uid};
use signal_hook::consts::signal::*;
use signal_hook_tokio::Signals;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::unbounded_channel;

#[derive(Parser, Debug)]
#[command(name = "mailcache", version, about = "List the newest messages of a mail account")]
struct Args {
    /// Accounts file (defaults to <config dir>/mailcache/accounts.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Account to open (defaults to the first configured one)
    #[arg(short, long)]
    account: Option<String>,

    /// Folder to list instead of the account's default
    #[arg(short, long)]
    folder: Option<String>,

    /// Number of messages to fetch
    #[arg(short = 'n', long, default_value_t = 20)]
    limit: usize,

    /// Print the fetched headers as JSON
    #[arg(long)]
    json: bool,
}

fn print_summary(messages: &[MessageInfo]) {
    for info in messages {
        let envelope = info.envelope.clone().unwrap_or_default();
        let date = envelope
            .date
            .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        let seen = if info.has_flag(mailcache::Flag::Seen) { ' ' } else { 'N' };
        println!(
            "{:>6} {} {}  {:<30}  {}",
            info.uid,
            seen,
            date,
            mailcache::format_addresses(&envelope.from),
            envelope.subject
        );
    }
}

/// Print newest first
fn report(messages: &mut [MessageInfo], json: bool) -> serde_json::Result<()> {
    messages.sort_by(|a, b| b.uid.cmp(&a.uid));
    if json {
        println!("{}", serde_json::to_string_pretty(&messages)?);
    } else {
        print_summary(messages);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    let mut account_config = match &args.account {
        Some(name) => config
            .account(name)
            .cloned()
            .ok_or_else(|| format!("no account named {}", name))?,
        None => config.accounts[0].clone(),
    };
    if let Some(folder) = &args.folder {
        account_config.default = folder.clone();
    }
    let folder = account_config.default.clone();

    log::info!("Opening {} of account {}", folder, account_config.name);
    let (mut account, backend_task) = Account::spawn(account_config)?;

    let (update_tx, mut update_rx) = unbounded_channel::<()>();
    let watched = folder.clone();
    account.on_new_store(move |name, store| {
        if *name == watched {
            let tx = update_tx.clone();
            store.on_update(move || {
                let _ = tx.send(());
            });
        }
    });

    let collected: Arc<Mutex<Vec<MessageInfo>>> = Arc::new(Mutex::new(Vec::new()));
    // uids whose headers were asked for, once the listing arrived
    let mut requested: Option<Vec<Uid>> = None;

    let signals = Signals::new([SIGTERM, SIGINT])?;
    let handle = signals.handle();
    let mut signals = signals.fuse();

    loop {
        tokio::select! {
            Some(signal) = signals.next() => {
                let signal_name = match signal {
                    SIGTERM => "SIGTERM",
                    SIGINT => "SIGINT",
                    _ => "unknown signal",
                };
                log::info!("Received {}, shutting down", signal_name);
                break;
            }
            alive = account.process_next() => {
                if !alive {
                    log::warn!("Backend stopped");
                    break;
                }
            }
            Some(()) = update_rx.recv() => {
                let Some(store) = account.store(&folder) else {
                    continue;
                };

                if let Some(newest) = &requested {
                    // headers that failed to load are given up on, not retried
                    let pending = store.pending_headers();
                    if newest.iter().any(|uid| pending.contains(uid)) {
                        continue;
                    }
                    let mut messages = collected.lock().unwrap_or_else(|e| e.into_inner()).clone();
                    if messages.len() < newest.len() {
                        log::warn!(
                            "{} of {} header(s) could not be loaded",
                            newest.len() - messages.len(),
                            newest.len()
                        );
                    }
                    report(&mut messages, args.json)?;
                    break;
                }

                let uids = store.uids();
                if uids.is_empty() {
                    if store.directory_info().exists == 0 {
                        report(&mut Vec::new(), args.json)?;
                        break;
                    }
                    continue;
                }

                let newest: Vec<Uid> = uids.iter().rev().take(args.limit).copied().collect();
                let collected = collected.clone();
                requested = Some(newest.clone());
                store.fetch_headers(
                    &newest,
                    Some(Arc::new(move |info: &MessageInfo| {
                        collected
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push(info.clone());
                    })),
                );
            }
        }
    }

    if !account.worker().is_closed() {
        account.disconnect();
    }
    drop(account);
    handle.close();

    match tokio::time::timeout(Duration::from_secs(5), backend_task).await {
        Ok(Err(e)) => log::error!("Backend task failed: {}", e),
        Err(_) => log::warn!("Backend did not stop in time"),
        Ok(Ok(())) => {}
    }
    log::info!("Shutdown complete");
    Ok(())
}
