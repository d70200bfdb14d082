//! Command-line interface for the Bitcoin SPV client.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Arg, ArgMatches, Command};
use tokio::signal;

use bitcoin_spv::logging::parse_level;
use bitcoin_spv::network::TcpConnector;
use bitcoin_spv::storage::MemoryBlockStore;
use bitcoin_spv::{ClientConfig, LogFileConfig, LoggingConfig, Network, SpvEvent, SyncOrchestrator};

fn cli() -> Command {
    Command::new("bitcoin-spv")
        .version(bitcoin_spv::VERSION)
        .about("Bitcoin SPV (Simplified Payment Verification) client")
        .arg(
            Arg::new("network")
                .short('n')
                .long("network")
                .value_name("NETWORK")
                .help("Network to connect to")
                .value_parser(["mainnet", "testnet", "regtest"])
                .default_value("mainnet"),
        )
        .arg(
            Arg::new("peer")
                .short('p')
                .long("peer")
                .value_name("ADDRESS")
                .help("Peer address to connect to (can be used multiple times)")
                .action(clap::ArgAction::Append),
        )
        .arg(
            Arg::new("headers-only")
                .long("headers-only")
                .help("Download headers only, without loading a bloom filter")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("max-peers")
                .long("max-peers")
                .value_name("COUNT")
                .help("Maximum number of simultaneous peer connections")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("info"),
        )
        .arg(
            Arg::new("log-dir")
                .long("log-dir")
                .value_name("DIR")
                .help("Also write logs to DIR/spv.log, archiving the previous session"),
        )
        .arg(
            Arg::new("watch")
                .short('w')
                .long("watch")
                .value_name("HEX")
                .help("Hex element to add to the bloom filter (can be used multiple times)")
                .action(clap::ArgAction::Append),
        )
}

fn build_config(matches: &ArgMatches) -> Result<ClientConfig, String> {
    let network = match matches.get_one::<String>("network").map(String::as_str) {
        Some("testnet") => Network::Testnet,
        Some("regtest") => Network::Regtest,
        _ => Network::Bitcoin,
    };
    let mut config = ClientConfig::new(network);

    if let Some(peers) = matches.get_many::<String>("peer") {
        for peer in peers {
            let address = peer.parse().map_err(|e| format!("Invalid peer address '{}': {}", peer, e))?;
            config.add_peer(address);
        }
        // Peers given on the command line replace discovery on regtest only.
        config.restrict_to_configured_peers = network == Network::Regtest;
    }
    if matches.get_flag("headers-only") {
        config = config.headers_only();
    }
    if let Some(max) = matches.get_one::<usize>("max-peers") {
        config = config.with_max_connections(*max);
    }

    let level = matches.get_one::<String>("log-level").map(String::as_str).unwrap_or("info");
    let level = parse_level(level).map_err(|e| e.to_string())?;
    config.logging = LoggingConfig {
        level: Some(level),
        console: true,
        file: matches.get_one::<String>("log-dir").map(|dir| LogFileConfig {
            log_dir: PathBuf::from(dir),
            max_archives: 10,
        }),
    };

    config.validate()?;
    Ok(config)
}

fn watched_elements(matches: &ArgMatches) -> Result<Vec<Vec<u8>>, String> {
    matches
        .get_many::<String>("watch")
        .into_iter()
        .flatten()
        .map(|element| hex::decode(element).map_err(|e| format!("Invalid watch element '{}': {}", element, e)))
        .collect()
}

fn print_event(event: &SpvEvent) {
    match event {
        SpvEvent::TransactionReceived {
            tx,
            block,
        } => match block {
            Some((hash, height)) => println!("tx {} confirmed in {} at height {}", tx.compute_txid(), hash, height),
            None => println!("tx {} unconfirmed", tx.compute_txid()),
        },
        SpvEvent::DownloadProgress {
            current_height,
            target_height,
        } => println!("progress {}/{}", current_height, target_height),
        other => println!("{}", other.description()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = cli().get_matches();

    let config = match build_config(&matches) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            process::exit(1);
        }
    };
    let watched = match watched_elements(&matches) {
        Ok(watched) => watched,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    let _logging_guard = bitcoin_spv::init_logging(config.logging.clone())?;
    tracing::info!("Starting Bitcoin SPV client");
    tracing::info!("Network: {:?}", config.network);
    tracing::info!("Download mode: {:?}", config.download_mode);

    let connector = Arc::new(TcpConnector::new(config.params().magic).with_timeout(config.connect_timeout));
    let (handle, mut events, task) =
        match SyncOrchestrator::spawn(config, Box::new(MemoryBlockStore::new()), connector) {
            Ok(started) => started,
            Err(e) => {
                eprintln!("Failed to create SPV client: {}", e);
                process::exit(1);
            }
        };

    for element in watched {
        tracing::info!("Watching {}", hex::encode(&element));
        handle.watch(element)?;
    }
    handle.start([])?;
    handle.request_download()?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SpvEvent::Stopped) | None => break,
                Some(event) => print_event(&event),
            },
            _ = signal::ctrl_c() => {
                tracing::info!("Received shutdown signal (Ctrl-C)");
                if let Err(e) = handle.stop().await {
                    tracing::error!("Error stopping client: {}", e);
                }
                break;
            }
        }
    }

    let _ = task.await;
    tracing::info!("SPV client stopped");
    Ok(())
}
