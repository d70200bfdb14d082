//! Integration tests for download peer election and failure handling.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use bitcoin::CompactTarget;
use bitcoin_spv::chain::ChainLocation;
use bitcoin_spv::test_utils::{MockNetwork, MockPeer, build_blocks, test_config, test_params, test_socket_address};
use bitcoin_spv::{PeerId, SpvEvent};
use common::{EVENT_TIMEOUT, Harness, plain_chain};

async fn wait_for_connections(harness: &mut Harness, count: usize) -> Vec<(PeerId, SocketAddr)> {
    let mut connected = Vec::new();
    while connected.len() < count {
        let events = harness.wait_for(|event| matches!(event, SpvEvent::PeerConnected { .. })).await;
        if let Some(SpvEvent::PeerConnected {
            peer,
            address,
            ..
        }) = events.last()
        {
            connected.push((*peer, *address));
        }
    }
    connected
}

/// The disconnect may race the replacement download, so keep reading if it is not in `seen` yet.
async fn wait_for_disconnect(harness: &mut Harness, seen: &[SpvEvent], peer_address: SocketAddr) {
    let dropped =
        |event: &SpvEvent| matches!(event, SpvEvent::PeerDisconnected { address, .. } if *address == peer_address);
    if !seen.iter().any(dropped) {
        harness.wait_for(dropped).await;
    }
}

fn started_from(events: &[SpvEvent]) -> Option<SocketAddr> {
    events.iter().find_map(|event| match event {
        SpvEvent::DownloadStarted {
            address,
            ..
        } => Some(*address),
        _ => None,
    })
}

#[tokio::test]
async fn test_election_prefers_highest_peer() {
    let (short, long) = (test_socket_address(1), test_socket_address(2));
    let blocks = plain_chain(30, 0);
    let network = MockNetwork::new();
    network.add_peer(short, MockPeer::new(blocks[..10].to_vec()));
    network.add_peer(long, MockPeer::new(blocks));

    let mut harness = Harness::spawn(test_config([short, long]).headers_only(), &network);
    harness.handle.start([]).unwrap();
    wait_for_connections(&mut harness, 2).await;
    harness.handle.request_download().unwrap();

    let events = harness.wait_for_finished(30).await;
    assert_eq!(started_from(&events), Some(long));
    assert_eq!(network.count_received(short, "getheaders"), 0);

    let status = harness.handle.status().await.unwrap();
    let download_peer = status.download_peer.expect("no download peer");
    let info = status.peers.iter().find(|info| info.id == download_peer).expect("download peer not in pool");
    assert_eq!(info.address, long);
    assert!(info.synced);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_announcement_from_other_peer_extends_chain() {
    let (download, other) = (test_socket_address(1), test_socket_address(2));
    let params = test_params();
    let blocks = plain_chain(10, 0);
    let next = build_blocks(&params, &blocks[9].header, 1, 1, |_| Vec::new());
    let network = MockNetwork::new();
    network.add_peer(download, MockPeer::new(blocks.clone()));
    network.add_peer(other, MockPeer::new(blocks[..9].to_vec()));

    let mut harness = Harness::spawn(test_config([download, other]).headers_only(), &network);
    harness.handle.start([]).unwrap();
    wait_for_connections(&mut harness, 2).await;
    harness.handle.request_download().unwrap();
    let events = harness.wait_for_finished(10).await;
    assert_eq!(started_from(&events), Some(download));

    network.announce_blocks(other, vec![blocks[9].clone(), next[0].clone()]);
    let extended = next[0].block_hash();
    harness
        .wait_for(|event| {
            matches!(event, SpvEvent::BlockAdded { hash, height: 11, location: ChainLocation::Main } if *hash == extended)
        })
        .await;

    assert_eq!(network.count_received(other, "getdata"), 0);
    assert_eq!(network.count_received(other, "getheaders"), 1);
    let status = harness.handle.status().await.unwrap();
    assert!(status.is_synced());
    assert_eq!(status.progress.current_height, 11);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_every_peer_holds_the_current_filter() {
    let (first, second) = (test_socket_address(1), test_socket_address(2));
    let blocks = plain_chain(10, 0);
    let network = MockNetwork::new();
    network.add_peer(first, MockPeer::new(blocks.clone()));
    network.add_peer(second, MockPeer::new(blocks));

    let mut harness = Harness::spawn(test_config([first, second]), &network);
    harness.handle.watch([0x5a; 20]).unwrap();
    harness.handle.start([]).unwrap();
    wait_for_connections(&mut harness, 2).await;
    harness.handle.request_download().unwrap();
    harness.wait_for_finished(10).await;

    // The download target moved the rate, so the first filter was replaced on both peers.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let loads = network.count_received(first, "filterload");
    assert!(loads >= 2, "only {} filter loads", loads);
    assert_eq!(network.count_received(second, "filterload"), loads);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_election_tie_goes_to_earliest_connection() {
    let (first, second) = (test_socket_address(1), test_socket_address(2));
    let blocks = plain_chain(12, 0);
    let network = MockNetwork::new();
    network.add_peer(first, MockPeer::new(blocks.clone()));
    network.add_peer(second, MockPeer::new(blocks));

    let mut harness = Harness::spawn(test_config([first, second]).headers_only(), &network);
    harness.handle.start([]).unwrap();
    let connected = wait_for_connections(&mut harness, 2).await;
    harness.handle.request_download().unwrap();

    let events = harness.wait_for_finished(12).await;
    assert_eq!(started_from(&events), Some(connected[0].1));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_silent_download_peer_is_replaced() {
    let (silent, honest) = (test_socket_address(1), test_socket_address(2));
    let blocks = plain_chain(40, 0);
    let network = MockNetwork::new();
    network.add_peer(silent, MockPeer::silent(Vec::new()).with_advertised_height(50));
    network.add_peer(honest, MockPeer::new(blocks));

    let mut harness = Harness::spawn(test_config([silent, honest]).headers_only(), &network);
    harness.handle.start([]).unwrap();
    wait_for_connections(&mut harness, 2).await;
    harness.handle.request_download().unwrap();

    let events = harness.wait_for_finished(40).await;
    let started: Vec<SocketAddr> = events
        .iter()
        .filter_map(|event| match event {
            SpvEvent::DownloadStarted {
                address,
                ..
            } => Some(*address),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![silent, honest]);

    assert!(network.count_received(silent, "getheaders") >= 1);
    wait_for_disconnect(&mut harness, &events, silent).await;

    harness.shutdown().await;
}

#[tokio::test]
async fn test_failing_host_is_blacklisted() {
    let refusing = test_socket_address(1);
    let network = MockNetwork::new();
    network.add_peer(refusing, MockPeer::refusing());

    let config = test_config([refusing]).with_max_connection_failures(2);
    let harness = Harness::spawn(config, &network);
    harness.handle.start([]).unwrap();

    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    loop {
        let status = harness.handle.status().await.unwrap();
        if status.blacklisted_hosts == 1 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "host was never blacklisted");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Blacklisted after exceeding the limit, and never dialed again once in-flight attempts settle.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let attempts = network.connection_attempts(refusing);
    assert!(attempts >= 3, "only {} attempts", attempts);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(network.connection_attempts(refusing), attempts);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_invalid_header_bans_peer() {
    let (cheater, honest) = (test_socket_address(1), test_socket_address(2));
    let blocks = plain_chain(10, 0);
    let mut bad = blocks.clone();
    bad[5].header.bits = CompactTarget::from_consensus(0x1d00_ffff);

    let network = MockNetwork::new();
    network.add_peer(cheater, MockPeer::new(bad).with_advertised_height(11));
    network.add_peer(honest, MockPeer::new(blocks));

    let mut harness = Harness::spawn(test_config([cheater, honest]).headers_only(), &network);
    harness.handle.start([]).unwrap();
    wait_for_connections(&mut harness, 2).await;
    harness.handle.request_download().unwrap();

    let events = harness.wait_for_finished(10).await;
    assert_eq!(started_from(&events), Some(cheater));
    // Blocks below the invalid one were kept.
    assert!(events.iter().any(|event| matches!(event, SpvEvent::BlockAdded { height: 5, .. })));

    wait_for_disconnect(&mut harness, &events, cheater).await;

    let status = harness.handle.status().await.unwrap();
    assert_eq!(status.blacklisted_hosts, 1);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(network.connection_attempts(cheater), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_rescan_restarts_from_checkpoint() {
    let peer = test_socket_address(1);
    let network = MockNetwork::new();
    network.add_peer(peer, MockPeer::new(plain_chain(20, 0)));

    let mut harness = Harness::spawn(test_config([peer]).headers_only(), &network);
    harness.handle.start([]).unwrap();
    harness.handle.request_download().unwrap();
    harness.wait_for_finished(20).await;

    harness.handle.rescan(12).unwrap();
    let events = harness.wait_for_finished(20).await;

    // Regtest only checkpoints genesis.
    assert!(matches!(
        events.first(),
        Some(SpvEvent::RescanStarted {
            from_height: 12,
            checkpoint_height: 0
        })
    ));
    let first_added = events.iter().find_map(|event| match event {
        SpvEvent::BlockAdded {
            height,
            ..
        } => Some(*height),
        _ => None,
    });
    assert_eq!(first_added, Some(1));
    assert_eq!(network.count_received(peer, "getheaders"), 2);

    harness.shutdown().await;
}
