//! Test helpers: mined regtest chains and an in-memory peer network.

mod chain;
mod network;

pub use chain::{
    TEST_BLOCK_SPACING, build_blocks, build_headers, filler_tx, mine, next_header, next_header_with, payment_tx,
};
pub use network::{
    MockBehavior, MockConnector, MockNetwork, MockPeer, test_config, test_params, test_socket_address,
};
