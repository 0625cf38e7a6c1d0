mod config;
mod delegate;
mod logging;

use anyhow::Result;
use beacon::{BeaconBroadcaster, BeaconConfig, BtleRadio};
use config::AppConfig;
use delegate::TerminalDelegate;
use mesh::{
    CoordinatorConfig, DiscoveryInfo, IdentityStore, LanTransport, SessionCoordinator,
    SessionDelegate,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging();
    info!("Starting SnapMesh");

    let config = AppConfig::from_env()?;

    // Without a stable identity, session behavior is undefined; a store
    // failure aborts startup.
    let store = IdentityStore::open(&config.data_dir);
    let identity = store.get_or_create(&config.display_name)?;
    info!("Local peer: {}", identity);

    let (transport, events) = LanTransport::bind(identity.clone()).await?;
    let discovery_info =
        DiscoveryInfo::from([("subject".to_string(), config.subject.clone())]);

    let delegate = Arc::new(TerminalDelegate::new(config.received_dir.clone()));
    let coordinator = SessionCoordinator::new(
        identity,
        CoordinatorConfig::new(discovery_info),
        Arc::new(transport),
        events,
        delegate.clone(),
    )
    .await;

    // Host and browse from the start, like the main screen does.
    if let Err(e) = coordinator.start_hosting().await {
        warn!("Hosting unavailable: {}", e);
    }
    if let Err(e) = coordinator.start_browsing().await {
        warn!("Browsing unavailable: {}", e);
    }

    let mut broadcaster: Option<BeaconBroadcaster> = None;

    print_help();
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("peers") => {
                println!("Roster ({} connected):", coordinator.connected_peer_count().await);
                for identity in coordinator.roster().await {
                    println!("  {}", identity);
                }
                let overview = coordinator.peer_overview().await;
                if !overview.is_empty() {
                    println!("Known peers:");
                    for (identity, phase) in overview {
                        println!("  {} [{}]", identity.display_name, phase);
                    }
                }
            }
            Some("send") => match parts.next() {
                Some(path) => match image::open(path) {
                    Ok(img) => coordinator.send_image(&img).await,
                    Err(e) => delegate.display_error("Load Error", &e.to_string()),
                },
                None => println!("Usage: send <image-path>"),
            },
            Some("join") => coordinator.join_session().await,
            Some("pick") => {
                let index: Option<usize> = parts.next().and_then(|n| n.parse().ok());
                let candidate = index.and_then(|i| {
                    delegate
                        .picker()
                        .and_then(|p| p.candidates.get(i).cloned())
                });
                match candidate {
                    Some(peer) => {
                        if let Err(e) = coordinator.invite_peer(&peer.identity.peer_id).await {
                            delegate.display_error("Invite Error", &e.to_string());
                        }
                    }
                    None => println!("Usage: pick <n> (after 'join')"),
                }
            }
            Some("done") => coordinator.finish_picker(true).await,
            Some("cancel") => coordinator.finish_picker(false).await,
            Some("beacon") => match parts.next() {
                Some("on") => {
                    if broadcaster.is_none() {
                        match BtleRadio::new().await {
                            Ok(radio) => {
                                broadcaster = Some(BeaconBroadcaster::new(Arc::new(radio)))
                            }
                            Err(e) => {
                                delegate.display_error("Beacon Error", &e.to_string());
                                continue;
                            }
                        }
                    }
                    if let Some(b) = &broadcaster {
                        let beacon_config = BeaconConfig::new(
                            config.beacon.uuid,
                            config.beacon.major,
                            config.beacon.minor,
                        );
                        match b.start(beacon_config).await {
                            Ok(handle) => println!("iBeacon is ON ({})", handle.config.uuid),
                            Err(e) => delegate.display_error("Beacon Error", &e.to_string()),
                        }
                    }
                }
                Some("off") => {
                    if let Some(b) = &broadcaster {
                        b.stop().await;
                    }
                    println!("iBeacon is OFF");
                }
                _ => println!("Usage: beacon on|off"),
            },
            Some("help") => print_help(),
            Some("quit") | Some("exit") => break,
            Some(other) => println!("Unknown command '{}', try 'help'", other),
            None => {}
        }
    }

    coordinator.shutdown().await;
    if let Some(b) = &broadcaster {
        b.stop().await;
    }
    info!("SnapMesh stopped");
    Ok(())
}

fn print_help() {
    println!("Commands:");
    println!("  peers            list the roster and every known peer");
    println!("  send <path>      send an image to all connected peers");
    println!("  join             open the manual peer picker");
    println!("  pick <n>         invite picker candidate n");
    println!("  done | cancel    close the peer picker");
    println!("  beacon on|off    toggle the standalone beacon");
    println!("  quit             shut down and exit");
}
