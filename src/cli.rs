//! Command-line front end over the service core.
//!
//! `serve` runs a long-lived instance; `discover` and `send` spin up a
//! transient instance for one operation and tear it down afterwards.

use crate::config::Config;
use crate::error::LinkError;
use crate::events::CoreEvent;
use crate::service::{AcceptAnyLink, Command, Outcome, Service};
use crate::store::PeerFilter;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tracing::warn;

#[derive(Parser)]
#[command(name = "lanlink", version, about = "LAN device pairing and file exchange")]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the directory incoming files land in.
    #[arg(long, global = true)]
    pub receive_dir: Option<PathBuf>,

    /// Override the state directory (identity, peer records).
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the service until interrupted, printing core events.
    Serve {
        /// Accept incoming pairing and transfer requests automatically.
        #[arg(long)]
        yes: bool,
    },
    /// Discover peers on the local network and print the roster.
    Discover {
        /// How long to listen for announcements.
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// List known peers from the stored roster.
    Peers,
    /// Connect to a device by IP and pair with it.
    Pair {
        /// Target device IP address.
        ip: IpAddr,
        /// Mark the peer trusted.
        #[arg(long)]
        trust: bool,
        /// Persist the peer record across restarts.
        #[arg(long)]
        save: bool,
    },
    /// Mark a known peer trusted or untrusted.
    Trust {
        peer_id: String,
        /// Remove trust instead of granting it.
        #[arg(long)]
        revoke: bool,
    },
    /// Block or unblock a peer.
    Block {
        peer_id: String,
        /// Lift the block instead of imposing it.
        #[arg(long)]
        unblock: bool,
    },
    /// Forget the pairing with a peer.
    Unpair { peer_id: String },
    /// Connect to a device by IP, pair if needed, and send files.
    Send {
        /// Target device IP address.
        ip: IpAddr,
        /// Files or directories to send.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Mark the peer trusted while pairing.
        #[arg(long)]
        trust: bool,
        /// Persist the peer record across restarts.
        #[arg(long)]
        save: bool,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(dir) = cli.receive_dir {
        config.receive_dir = dir;
    }
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    let service = Service::open(config, Box::new(AcceptAnyLink))?;
    match cli.command {
        Commands::Serve { yes } => serve(service, yes).await,
        Commands::Discover { seconds } => discover(service, seconds).await,
        Commands::Peers => peers(service).await,
        Commands::Pair { ip, trust, save } => pair(service, ip, trust, save).await,
        Commands::Trust { peer_id, revoke } => {
            one_shot(service, Command::SetTrusted { peer_id, trusted: !revoke }).await
        }
        Commands::Block { peer_id, unblock } => {
            one_shot(service, Command::SetBlocked { peer_id, blocked: !unblock }).await
        }
        Commands::Unpair { peer_id } => one_shot(service, Command::Unpair { peer_id }).await,
        Commands::Send { ip, paths, trust, save } => send(service, ip, paths, trust, save).await,
    }
}

/// Start, run one roster mutation, stop.
async fn one_shot(service: Service, command: Command) -> Result<()> {
    service.start().await?;
    let result = service.dispatch(command).await;
    service.stop().await;
    result?;
    println!("ok");
    Ok(())
}

async fn serve(service: Service, auto_accept: bool) -> Result<()> {
    let mut events = service.events().subscribe();
    service.start().await?;
    println!("device id: {}", service.device_id());

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("could not install interrupt handler")?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            ev = events.recv() => {
                let Ok(ev) = ev else { continue };
                print_event(&ev);
                if auto_accept {
                    if let Err(e) = auto_respond(&service, &ev).await {
                        warn!(error = %e, "auto-accept failed");
                    }
                }
            }
        }
    }
    println!("shutting down");
    service.stop().await;
    Ok(())
}

async fn auto_respond(service: &Service, ev: &CoreEvent) -> Result<(), LinkError> {
    match ev {
        CoreEvent::PairingRequested { request_id, .. } => {
            service
                .dispatch(Command::RespondPairing {
                    request_id: request_id.clone(),
                    accept: true,
                    trust: false,
                    save: true,
                })
                .await?;
        }
        CoreEvent::TransferRequested { request_id, .. } => {
            service
                .dispatch(Command::RespondTransfer {
                    request_id: request_id.clone(),
                    accept: true,
                    message: None,
                })
                .await?;
        }
        _ => {}
    }
    Ok(())
}

fn print_event(ev: &CoreEvent) {
    match ev {
        CoreEvent::PeerDiscovered { peer } => {
            println!("discovered {} ({}) at {}:{}", peer.display_name, peer.id, peer.ip, peer.port)
        }
        CoreEvent::PeerConnected { peer_id } => println!("connected {peer_id}"),
        CoreEvent::PeerDisconnected { peer_id } => println!("disconnected {peer_id}"),
        CoreEvent::PairingRequested { peer_id, display_name, .. } => {
            println!("pairing request from {display_name} ({peer_id})")
        }
        CoreEvent::Paired { peer_id } => println!("paired with {peer_id}"),
        CoreEvent::TransferRequested { peer_id, file_count, total_bytes, .. } => {
            println!("transfer offer from {peer_id}: {file_count} file(s), {total_bytes} bytes")
        }
        CoreEvent::TransferFinished { task } => {
            println!("transfer {} {}: {}", task.file_name, task.status.name(),
                task.error.as_deref().unwrap_or("ok"))
        }
        _ => {}
    }
}

async fn peers(service: Service) -> Result<()> {
    service.start().await?;
    let outcome = service
        .dispatch(Command::ListPeers { filter: PeerFilter::All })
        .await?;
    service.stop().await;
    let Outcome::Peers(peers) = outcome else {
        bail!("unexpected outcome");
    };
    if peers.is_empty() {
        println!("no known peers");
    }
    for p in peers {
        println!(
            "{}  {}  {}:{}  [{}]  {:?}",
            p.id,
            p.display_name,
            p.ip,
            p.port,
            p.platform,
            p.status(false),
        );
    }
    Ok(())
}

async fn pair(service: Service, ip: IpAddr, trust: bool, save: bool) -> Result<()> {
    let mut events = service.events().subscribe();
    service.start().await?;

    let Outcome::PeerId(peer_id) = service.dispatch(Command::Connect { ip }).await? else {
        bail!("unexpected outcome");
    };
    println!("connected to {peer_id}");
    let accepted = ensure_paired(&service, &mut events, &peer_id, trust, save).await?;
    service.stop().await;
    if accepted {
        println!("paired with {peer_id}");
        Ok(())
    } else {
        bail!("peer declined the pairing request");
    }
}

/// Pair with `peer_id` unless already paired; waits for the remote
/// decision. Returns whether the peers ended up paired.
async fn ensure_paired(
    service: &Service,
    events: &mut tokio::sync::broadcast::Receiver<CoreEvent>,
    peer_id: &str,
    trust: bool,
    save: bool,
) -> Result<bool> {
    let paired = matches!(
        service.dispatch(Command::ListPeers { filter: PeerFilter::Paired }).await?,
        Outcome::Peers(peers) if peers.iter().any(|p| p.id == peer_id)
    );
    if paired {
        return Ok(true);
    }
    println!("pairing with {peer_id}...");
    service
        .dispatch(Command::Pair {
            peer_id: peer_id.to_string(),
            trust,
            save,
        })
        .await?;
    let accepted = timeout(Duration::from_secs(120), async {
        loop {
            match events.recv().await {
                Ok(CoreEvent::PairingDecided { peer_id: p, accepted }) if p == peer_id => {
                    return accepted
                }
                Ok(_) => {}
                Err(_) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);
    Ok(accepted)
}

async fn discover(service: Service, seconds: u64) -> Result<()> {
    service.start().await?;
    sleep(Duration::from_secs(seconds)).await;
    let outcome = service
        .dispatch(Command::ListPeers { filter: PeerFilter::All })
        .await?;
    let Outcome::Peers(peers) = outcome else {
        bail!("unexpected outcome");
    };
    if peers.is_empty() {
        println!("no peers found");
    } else {
        for p in peers {
            println!("{}  {}  {}:{}  [{}]", p.id, p.display_name, p.ip, p.port, p.platform);
        }
    }
    service.stop().await;
    Ok(())
}

async fn send(
    service: Service,
    ip: IpAddr,
    paths: Vec<PathBuf>,
    trust: bool,
    save: bool,
) -> Result<()> {
    let mut events = service.events().subscribe();
    service.start().await?;

    let Outcome::PeerId(peer_id) = service.dispatch(Command::Connect { ip }).await? else {
        bail!("unexpected outcome");
    };
    println!("connected to {peer_id}");

    if !ensure_paired(&service, &mut events, &peer_id, trust, save).await? {
        service.stop().await;
        bail!("peer declined the pairing request");
    }

    let Outcome::BatchId(batch_id) = service
        .dispatch(Command::SendFiles { peer_id: peer_id.clone(), paths })
        .await?
    else {
        bail!("unexpected outcome");
    };

    let bar = ProgressBar::new(0).with_style(
        ProgressStyle::with_template(
            "{bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, eta {eta})",
        )
        .expect("static template"),
    );

    // follow the batch until every task is terminal
    let mut failed = Vec::new();
    loop {
        let Outcome::Transfers(tasks) = service.dispatch(Command::ListTransfers).await? else {
            bail!("unexpected outcome");
        };
        let batch: Vec<_> = tasks.iter().filter(|t| t.batch_id == batch_id).collect();
        if batch.is_empty() {
            break;
        }
        bar.set_length(batch.iter().map(|t| t.size).sum());
        bar.set_position(batch.iter().map(|t| t.transferred).sum());
        if batch.iter().all(|t| t.status.is_terminal()) {
            failed = batch
                .iter()
                .filter(|t| t.error.is_some())
                .map(|t| format!("{}: {}", t.file_name, t.error.as_deref().unwrap_or("")))
                .collect();
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    bar.finish();

    service.stop().await;
    if failed.is_empty() {
        println!("done");
        Ok(())
    } else {
        bail!("some transfers failed:\n  {}", failed.join("\n  "));
    }
}
