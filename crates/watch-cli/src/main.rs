use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use contracts::{OrganizationPatch, PatrolSeed, RetryPolicy, StatBlock, SyncConfig};
use tracing_subscriber::EnvFilter;
use watch_api::{serve, SqliteStores, WatchApi};
use watch_core::authority::FixedAuthority;
use watch_core::channel::LocalBus;

fn print_usage() {
    println!("watch-cli <command>");
    println!("commands:");
    println!("  serve [addr]");
    println!("    default addr: 127.0.0.1:8080");
    println!("    sqlite path from WATCH_SQLITE_PATH (default: watch_sync.sqlite)");
    println!("  demo");
    println!("    runs a host and a player client on an in-process bus and");
    println!("    prints the convergence transcript");
}

fn parse_socket_addr(value: Option<&String>) -> Result<SocketAddr, String> {
    let raw = value.map(String::as_str).unwrap_or("127.0.0.1:8080");
    raw.parse::<SocketAddr>()
        .map_err(|_| format!("invalid addr: {raw}"))
}

fn demo_config(client_id: &str) -> SyncConfig {
    SyncConfig {
        client_id: client_id.to_string(),
        debounce_ms: 50,
        request_timeout_ms: 400,
        retry: RetryPolicy {
            base_delay_ms: 5,
            max_attempts: 3,
        },
        ..SyncConfig::default()
    }
}

async fn run_demo() -> Result<(), String> {
    let bus = Arc::new(LocalBus::new());

    let gm_stores = SqliteStores::open_in_memory().map_err(|err| err.to_string())?;
    let gm = WatchApi::start(
        demo_config("client_gm"),
        Arc::new(FixedAuthority::privileged()),
        Arc::clone(&bus) as Arc<dyn watch_core::channel::BroadcastChannel>,
        gm_stores.locator(),
        gm_stores.fallback(),
    )
    .await;

    let player_stores = SqliteStores::open_in_memory().map_err(|err| err.to_string())?;
    let player = WatchApi::start(
        demo_config("client_player"),
        Arc::new(FixedAuthority::player()),
        Arc::clone(&bus) as Arc<dyn watch_core::channel::BroadcastChannel>,
        player_stores.locator(),
        player_stores.fallback(),
    )
    .await;

    let seeded = gm
        .organization()
        .await
        .ok_or_else(|| "host failed to seed an aggregate".to_string())?;
    println!("host seeded {seeded}");

    gm.update_organization(OrganizationPatch {
        subtitle: Some("the fifth bell rings".to_string()),
        stats: Some(StatBlock {
            robustismo: 4,
            analitica: 2,
            ..StatBlock::default()
        }),
        ..OrganizationPatch::default()
    })
    .await
    .map_err(|err| err.to_string())?;

    let patrol = gm
        .create_patrol(
            PatrolSeed {
                name: Some("Night Shift".to_string()),
                base_stats: Some(StatBlock {
                    subterfugio: 6,
                    ..StatBlock::default()
                }),
                ..PatrolSeed::default()
            },
            &[],
        )
        .await
        .map_err(|err| err.to_string())?
        .ok_or_else(|| "host lost its aggregate".to_string())?;
    println!("host created patrol {} \"{}\"", patrol.id, patrol.name);

    let sent = gm.flush_now().await;
    println!("host flushed {sent} queued change(s)");

    // Give the player's background pump a moment to apply the broadcast.
    let mut adopted = None;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        if let Some(organization) = player.organization().await {
            if organization.subtitle == "the fifth bell rings" {
                adopted = Some(organization);
                break;
            }
        }
    }

    match adopted {
        Some(organization) => {
            println!("player adopted {organization}");
            for patrol in player.patrols().await {
                println!("player sees patrol {} \"{}\"", patrol.id, patrol.name);
            }
            println!("converged=true");
        }
        None => println!("converged=false"),
    }

    gm.dispose().await;
    player.dispose().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str);

    match command {
        Some("serve") => match parse_socket_addr(args.get(2)) {
            Ok(addr) => {
                println!("serving api on http://{addr}");
                if let Err(err) = serve(addr).await {
                    eprintln!("server error: {err}");
                    std::process::exit(1);
                }
            }
            Err(err) => {
                eprintln!("error: {err}");
                print_usage();
                std::process::exit(2);
            }
        },
        Some("demo") => {
            if let Err(err) = run_demo().await {
                eprintln!("error: {err}");
                std::process::exit(1);
            }
        }
        _ => {
            print_usage();
        }
    }
}
