//! Shared harness for tests that run the sync actor against mock peers.

#![allow(dead_code)]

use std::time::Duration;

use bitcoin::Block;
use bitcoin_spv::storage::MemoryBlockStore;
use bitcoin_spv::sync::{EventReceiver, SpvEvent, SyncHandle, SyncOrchestrator};
use bitcoin_spv::test_utils::{MockNetwork, build_blocks, test_params};
use bitcoin_spv::ClientConfig;
use tokio::task::JoinHandle;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Harness {
    pub handle: SyncHandle,
    pub events: EventReceiver,
    pub task: JoinHandle<()>,
}

impl Harness {
    pub fn spawn(config: ClientConfig, network: &MockNetwork) -> Self {
        let connector = network.connector(config.params().magic);
        let (handle, events, task) = SyncOrchestrator::spawn(config, Box::new(MemoryBlockStore::new()), connector)
            .expect("failed to spawn orchestrator");
        Self {
            handle,
            events,
            task,
        }
    }

    /// Events up to and including the first one matching `predicate`.
    pub async fn wait_for(&mut self, mut predicate: impl FnMut(&SpvEvent) -> bool) -> Vec<SpvEvent> {
        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
        loop {
            let event = match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => panic!("event stream closed; saw {:?}", descriptions(&seen)),
                Err(_) => panic!("timed out waiting for event; saw {:?}", descriptions(&seen)),
            };
            let matched = predicate(&event);
            seen.push(event);
            if matched {
                return seen;
            }
        }
    }

    pub async fn wait_for_finished(&mut self, expected_height: u32) -> Vec<SpvEvent> {
        self.wait_for(|event| {
            matches!(event, SpvEvent::DownloadFinished { height, .. } if *height == expected_height)
        })
        .await
    }

    /// Stop the actor and wait for its task to exit.
    pub async fn shutdown(mut self) {
        self.handle.stop().await.expect("stop failed");
        self.wait_for(|event| matches!(event, SpvEvent::Stopped)).await;
        tokio::time::timeout(EVENT_TIMEOUT, self.task).await.expect("actor did not exit").expect("actor panicked");
    }
}

pub fn descriptions(events: &[SpvEvent]) -> Vec<String> {
    events.iter().map(SpvEvent::description).collect()
}

/// `count` regtest blocks on top of genesis with no watched transactions.
pub fn plain_chain(count: usize, salt: u32) -> Vec<Block> {
    let params = test_params();
    build_blocks(&params, &params.genesis, count, salt, |_| Vec::new())
}
