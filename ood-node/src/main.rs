// OpenOverdrive node: LAN race coordination with a line-based console.

use std::sync::Arc;

use anyhow::Context;
use ood_core::protocol::{Peer, Role};
use ood_core::race::Outcome;
use ood_core::{RaceNotice, SystemClock};
use ood_node::{config, LanTransport, PeerTransport, RaceService};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut cfg = config::load();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("ood-node {}", VERSION);
                return Ok(());
            }
            "--host" => cfg.role = Role::Host,
            "--client" => cfg.role = Role::Client,
            "--name" => cfg.name = Some(args.next().context("--name needs a value")?),
            other => anyhow::bail!("unknown argument {other:?}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let local = Peer::new(uuid::Uuid::new_v4().to_string(), cfg.name.clone());
    let transport: Arc<dyn PeerTransport> = Arc::new(LanTransport::new(cfg.role, local, cfg.lan()));
    let service = RaceService::create(transport.clone(), Arc::new(SystemClock), cfg.service_options());
    if !transport.start().await {
        anyhow::bail!("transport failed to start: {}", transport.status());
    }
    if cfg.role == Role::Host {
        service.start_time_sync().await?;
    }

    let printer = tokio::spawn(print_notices(service.clone()));
    tokio::select! {
        r = console(service.clone(), cfg.clone()) => r?,
        r = shutdown_signal() => r?,
    }
    printer.abort();
    service.teardown().await;
    Ok(())
}

async fn console(service: RaceService, cfg: config::Config) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        let Some(cmd) = words.next() else { continue };
        match cmd {
            "start" => {
                let countdown = words.next().and_then(|s| s.parse().ok()).unwrap_or(cfg.countdown_seconds);
                let laps = words.next().and_then(|s| s.parse().ok()).unwrap_or(cfg.target_laps);
                match service.start_match(countdown, laps).await {
                    Ok(go_at) => println!("go at {go_at}"),
                    Err(e) => println!("cannot start: {e}"),
                }
            }
            "cancel" => {
                if let Err(e) = service.cancel_match().await {
                    println!("cannot cancel: {e}");
                }
            }
            "marker" => match words.next().and_then(|s| s.parse().ok()) {
                Some(piece) => service.set_start_marker(piece).await,
                None => println!("usage: marker <road piece id>"),
            },
            "ping" => service.ping().await,
            "phase" => println!("{:?}", service.phase().await),
            "status" => {
                let transport = service.transport();
                let peers = transport.peers().borrow().clone();
                println!("{} [{}]", transport.status(), peers.iter().map(Peer::label).collect::<Vec<_>>().join(", "));
                for p in &peers {
                    if let Some(offset) = service.offset_for(&p.id).await {
                        println!("  {} offset {offset} ms", p.label());
                    }
                }
            }
            "results" => {
                for (i, r) in service.results().await.iter().enumerate() {
                    let who = r.name.as_deref().unwrap_or(&r.racer_id);
                    let best = r.best_lap_ms.map_or("-".to_string(), |ms| format!("{ms} ms"));
                    match &r.outcome {
                        Outcome::Finished { total_ms: Some(total), .. } => {
                            println!("{}. {who}  {total} ms  best {best}", i + 1)
                        }
                        Outcome::Finished { .. } => println!("{}. {who}  finished  best {best}", i + 1),
                        Outcome::Dnf { laps } => println!("{}. {who}  DNF ({laps} laps)  best {best}", i + 1),
                    }
                }
            }
            "quit" | "exit" => return Ok(()),
            _ => println!("commands: start [countdown] [laps], cancel, marker <piece>, ping, phase, status, results, quit"),
        }
    }
    // Stdin closed (running as a service): keep serving until signalled.
    std::future::pending::<()>().await;
    Ok(())
}

async fn print_notices(service: RaceService) {
    let mut notices = service.notices();
    while let Ok(notice) = notices.recv().await {
        match notice {
            RaceNotice::MatchScheduled { go_at_local_ms, countdown_seconds, target_laps } => {
                println!("match: {target_laps} laps, go at {go_at_local_ms} ({countdown_seconds}s countdown)")
            }
            RaceNotice::MatchCancelled => println!("match cancelled"),
            RaceNotice::LapCompleted { racer_id, laps, lap_ms } => {
                println!("{racer_id}: lap {laps} {}", lap_ms.map_or(String::new(), |ms| format!("({ms} ms)")))
            }
            RaceNotice::Finished { racer_id, laps, .. } => println!("{racer_id} finished after {laps} laps"),
            RaceNotice::PeerJoined { peer } => println!("{} joined", peer.label()),
            RaceNotice::PingReply { peer_id, rtt_ms } => println!("pong from {peer_id}: {rtt_ms} ms"),
            RaceNotice::OffsetEstimated { .. } => {}
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
