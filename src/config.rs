//! Stack configuration trait.

use crate::{link::queue::PacketQueue, link::Transmitter, time::Timer};

/// Source of random bits, used for access address and session key material generation.
///
/// Implementors typically wrap a hardware TRNG peripheral or, in tests, a seeded PRNG.
pub trait Rng {
    /// Returns the next 32 random bits.
    fn next_u32(&mut self) -> u32;
}

/// A 128-bit block cipher usable for AES-ECB session key derivation and AES-CCM packet
/// encryption/decryption.
///
/// The default `aes`/`ccm`-crate-backed implementation is provided by [`crate::crypto`]; a
/// platform with a hardware AES/CCM offload (`radio_ccm_*` in the reference controller) can
/// implement this trait directly against that peripheral instead.
pub trait BlockCipher {
    /// Encrypts a single 16-byte block in place using the given 128-bit key (ECB mode, no
    /// padding). Used only for session key derivation (`E(LTK, SKDm || SKDs)`), never for
    /// bulk payload encryption.
    fn encrypt_block(&self, key: &[u8; 16], block: &mut [u8; 16]);
}

/// Trait for controller stack configurations.
///
/// This trait defines a number of types used throughout the layers of the BLE stack, which
/// define capabilities, data structures, data, and hardware interface types to be used.
///
/// Every application must define a type implementing this trait and supply it to the
/// [`Controller`](crate::link::Controller).
pub trait Config {
    /// A time source with microsecond resolution.
    type Timer: Timer;

    /// The BLE packet transmitter (radio).
    type Transmitter: Transmitter;

    /// The packet queue to use for exchanging data between the real-time Link-Layer and
    /// non-realtime parts of the stack.
    type PacketQueue: PacketQueue;

    /// Random number source for access address and session key generation.
    type Rng: Rng;

    /// Block cipher used for session key derivation and CCM encryption.
    type BlockCipher: BlockCipher;
}

// Helper aliases to make accessing producer/consumer more convenient
pub(crate) type ConfProducer<C> = <<C as Config>::PacketQueue as PacketQueue>::Producer;
pub(crate) type ConfConsumer<C> = <<C as Config>::PacketQueue as PacketQueue>::Consumer;

/// Runtime-tunable knobs supplied once at controller construction time.
///
/// Mirrors the parameters accepted by the reference controller's `radio_init`/`ll_reset`
/// entry points: pool sizing and the locally supported feature/SCA defaults.
#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    /// Maximum number of simultaneous connections this controller will accept.
    pub max_connections: u8,

    /// Number of RX pool nodes to reserve (in addition to the one permanently reserved for
    /// termination delivery per connection).
    pub rx_pool_count: u8,

    /// Number of TX pool nodes (shared across control and data lists).
    pub tx_pool_count: u8,

    /// Default (pre-DLE) maximum data channel PDU payload length in octets (27 per Core Spec
    /// 4.0/4.1).
    pub default_data_length: u8,

    /// This device's sleep clock accuracy, as an index into the standard ppm table
    /// `{500, 250, 150, 100, 75, 50, 30, 20}`.
    pub local_sca: u8,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1,
            rx_pool_count: 4,
            tx_pool_count: 4,
            default_data_length: 27,
            local_sca: 0,
        }
    }
}
