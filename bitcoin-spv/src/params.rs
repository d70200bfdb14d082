//! Per-network consensus and P2P constants.

use bitcoin::block::Header as BlockHeader;
use bitcoin::blockdata::constants::genesis_block;
use bitcoin::p2p::Magic;
use bitcoin::{BlockHash, CompactTarget, Network};
use num_bigint::BigUint;

use crate::chain::checkpoints::{Checkpoint, CheckpointManager};
use crate::chain::difficulty::target_from_compact;

const MAINNET_DNS_SEEDS: &[&str] = &[
    "seed.bitcoin.sipa.be",
    "dnsseed.bluematt.me",
    "dnsseed.bitcoin.dashjr.org",
    "seed.bitcoinstats.com",
    "seed.bitcoin.jonasschnelli.ch",
    "seed.btc.petertodd.net",
];

const TESTNET_DNS_SEEDS: &[&str] = &[
    "testnet-seed.bitcoin.jonasschnelli.ch",
    "seed.tbtc.petertodd.net",
    "testnet-seed.bluematt.me",
];

const TWO_WEEKS: u32 = 14 * 24 * 60 * 60;
const TEN_MINUTES: u32 = 10 * 60;

/// Read-only description of a Bitcoin network.
#[derive(Debug, Clone)]
pub struct NetworkParams {
    pub network: Network,
    pub magic: Magic,
    pub default_port: u16,
    /// Easiest allowed target, in compact form.
    pub pow_limit_bits: CompactTarget,
    pub retarget_timespan: u32,
    pub retarget_spacing: u32,
    pub min_retarget_timespan: u32,
    pub max_retarget_timespan: u32,
    /// Testnet rule: blocks may drop to the pow limit between retargets.
    pub allow_min_difficulty_blocks: bool,
    /// Regtest rule: difficulty never changes.
    pub no_retargeting: bool,
    pub genesis: BlockHeader,
    pub dns_seeds: Vec<String>,
    pub checkpoints: CheckpointManager,
}

impl NetworkParams {
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Bitcoin => Self::bitcoin(),
            Network::Regtest => Self::regtest(),
            _ => Self::testnet(),
        }
    }

    pub fn bitcoin() -> Self {
        Self::base(Network::Bitcoin, 8333, 0x1d00ffff, MAINNET_DNS_SEEDS)
    }

    pub fn testnet() -> Self {
        let mut params = Self::base(Network::Testnet, 18333, 0x1d00ffff, TESTNET_DNS_SEEDS);
        params.allow_min_difficulty_blocks = true;
        params
    }

    pub fn regtest() -> Self {
        let mut params = Self::base(Network::Regtest, 18444, 0x207fffff, &[]);
        params.allow_min_difficulty_blocks = true;
        params.no_retargeting = true;
        params
    }

    fn base(network: Network, default_port: u16, pow_limit_bits: u32, seeds: &[&str]) -> Self {
        let genesis = genesis_block(network).header;
        Self {
            network,
            magic: network.magic(),
            default_port,
            pow_limit_bits: CompactTarget::from_consensus(pow_limit_bits),
            retarget_timespan: TWO_WEEKS,
            retarget_spacing: TEN_MINUTES,
            min_retarget_timespan: TWO_WEEKS / 4,
            max_retarget_timespan: TWO_WEEKS * 4,
            allow_min_difficulty_blocks: false,
            no_retargeting: false,
            genesis,
            dns_seeds: seeds.iter().map(|s| s.to_string()).collect(),
            checkpoints: CheckpointManager::new(Checkpoint::new(0, genesis)),
        }
    }

    /// Override the retarget schedule. Min and max timespans follow Bitcoin's 4x clamp.
    pub fn with_retarget(mut self, timespan: u32, spacing: u32) -> Self {
        self.retarget_timespan = timespan;
        self.retarget_spacing = spacing;
        self.min_retarget_timespan = timespan / 4;
        self.max_retarget_timespan = timespan * 4;
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoints.add(checkpoint);
        self
    }

    /// Blocks per retarget period.
    pub fn retarget_interval(&self) -> u32 {
        (self.retarget_timespan / self.retarget_spacing).max(1)
    }

    pub fn is_retarget_height(&self, height: u32) -> bool {
        height % self.retarget_interval() == 0
    }

    pub fn pow_limit(&self) -> BigUint {
        target_from_compact(self.pow_limit_bits).unwrap_or_default()
    }

    pub fn genesis_hash(&self) -> BlockHash {
        self.genesis.block_hash()
    }

    pub fn checkpoint_at_height(&self, height: u32) -> Option<&Checkpoint> {
        self.checkpoints.at_height(height)
    }

    pub fn last_checkpoint_before_timestamp(&self, timestamp: u32) -> &Checkpoint {
        self.checkpoints.last_before_timestamp(timestamp)
    }
}
