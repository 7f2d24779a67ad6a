//! Default software encryption primitives: AES-ECB session key derivation and AES-CCM packet
//! encryption state, backed by the RustCrypto `aes`/`ccm` crates.
//!
//! A platform with a hardware AES/CCM offload (`radio_ccm_*` in the reference controller) can
//! bypass this module entirely by implementing [`crate::config::BlockCipher`] directly against
//! the peripheral; the LLCP state machine only ever talks to that trait.

use aead::{generic_array::GenericArray, AeadInPlace, NewAead};
use aes::Aes128;
use block_cipher::{BlockCipher as _, NewBlockCipher};
use ccm::Ccm;
use generic_array::typenum::{U13, U4};

use crate::config::BlockCipher;
use crate::Error;

/// CCM parameterization used by the Bluetooth Core spec: 4-byte MIC, 13-byte nonce
/// (8-byte IV + 4-byte packet counter + 1 direction byte).
type BleCcm = Ccm<Aes128, U4, U13>;

/// Software [`BlockCipher`] implementation backed by `aes::Aes128`.
///
/// Used only for the one-shot `E(LTK, SKDm || SKDs)` session key derivation; bulk payload
/// encryption goes through [`SessionKeys`] instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftAes;

impl BlockCipher for SoftAes {
    fn encrypt_block(&self, key: &[u8; 16], block: &mut [u8; 16]) {
        let cipher = Aes128::new(GenericArray::from_slice(key));
        let mut ga = GenericArray::clone_from_slice(block);
        cipher.encrypt_block(&mut ga);
        block.copy_from_slice(ga.as_slice());
    }
}

/// Derives the 128-bit session key from the long term key and the exchanged `SKD` halves, per
/// `spec.md` §4.5.3: `E(LTK, SKDm || SKDs)`, where `SKDm || SKDs` forms the 16-byte AES-ECB
/// input block (master's half in the high bytes).
pub fn derive_session_key<B: BlockCipher>(cipher: &B, ltk: &[u8; 16], skdm: [u8; 8], skds: [u8; 8]) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[..8].copy_from_slice(&skdm);
    block[8..].copy_from_slice(&skds);
    cipher.encrypt_block(ltk, &mut block);
    block
}

/// Direction bit used in the CCM nonce, per Core spec Vol 6, Part E: packets sent from slave to
/// master use 0, master to slave uses 1.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    SlaveToMaster = 0,
    MasterToSlave = 1,
}

/// Per-direction AES-CCM encryption state: session key, IV, and the 39-bit packet counter used
/// to build the nonce.
#[derive(Clone)]
pub struct CcmState {
    key: [u8; 16],
    iv: [u8; 8],
    direction: Direction,
    counter: u64,
}

impl CcmState {
    /// Creates a fresh CCM state for one direction, with the packet counter reset to zero (as
    /// required immediately after `START_ENC_RSP` is acknowledged).
    pub fn new(key: [u8; 16], iv: [u8; 8], direction: Direction) -> Self {
        Self {
            key,
            iv,
            direction,
            counter: 0,
        }
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn nonce(&self) -> GenericArray<u8, U13> {
        let mut nonce = [0u8; 13];
        nonce[0..4].copy_from_slice(&(self.counter as u32).to_le_bytes());
        nonce[4] = ((self.counter >> 32) as u8 & 0x7F) | ((self.direction as u8) << 7);
        nonce[5..13].copy_from_slice(&self.iv);
        GenericArray::clone_from_slice(&nonce)
    }

    /// Encrypts `payload` in place and appends a 4-byte MIC, using `header` (the PDU header
    /// byte with NESN/SN/MD masked off, per Core spec 4.2) as associated data.
    ///
    /// Advances the packet counter on success.
    pub fn encrypt_in_place(&mut self, header: u8, buffer: &mut [u8], tag_out: &mut [u8; 4]) -> Result<(), Error> {
        let cipher = BleCcm::new(GenericArray::from_slice(&self.key));
        let nonce = self.nonce();
        let tag = cipher
            .encrypt_in_place_detached(&nonce, &[header], buffer)
            .map_err(|_| Error::InvalidValue)?;
        tag_out.copy_from_slice(tag.as_slice());
        self.counter += 1;
        Ok(())
    }

    /// Decrypts `buffer` in place, validating the 4-byte MIC `tag` against `header` as
    /// associated data. Advances the packet counter on success.
    pub fn decrypt_in_place(&mut self, header: u8, buffer: &mut [u8], tag: &[u8; 4]) -> Result<(), Error> {
        let cipher = BleCcm::new(GenericArray::from_slice(&self.key));
        let nonce = self.nonce();
        cipher
            .decrypt_in_place_detached(&nonce, &[header], buffer, GenericArray::from_slice(tag))
            .map_err(|_| Error::InvalidValue)?;
        self.counter += 1;
        Ok(())
    }
}

/// Full per-connection encryption state: one [`CcmState`] per direction, matching `spec.md`
/// §3's "CCM tx/rx contexts".
pub struct SessionKeys {
    pub tx: CcmState,
    pub rx: CcmState,
}

impl SessionKeys {
    /// Builds the TX/RX CCM contexts for a master (which transmits master-to-slave) from the
    /// derived session key and exchanged IV halves.
    pub fn for_master(key: [u8; 16], ivm: [u8; 4], ivs: [u8; 4]) -> Self {
        let iv = concat_iv(ivm, ivs);
        Self {
            tx: CcmState::new(key, iv, Direction::MasterToSlave),
            rx: CcmState::new(key, iv, Direction::SlaveToMaster),
        }
    }

    /// Builds the TX/RX CCM contexts for a slave.
    pub fn for_slave(key: [u8; 16], ivm: [u8; 4], ivs: [u8; 4]) -> Self {
        let iv = concat_iv(ivm, ivs);
        Self {
            tx: CcmState::new(key, iv, Direction::SlaveToMaster),
            rx: CcmState::new(key, iv, Direction::MasterToSlave),
        }
    }
}

/// Combines the master and slave IV halves into the 8-byte session IV, per Core spec Vol 6,
/// Part E: `IV = IVm || IVs` (master's half in the low-order bytes, transmitted first).
fn concat_iv(ivm: [u8; 4], ivs: [u8; 4]) -> [u8; 8] {
    let mut iv = [0u8; 8];
    iv[..4].copy_from_slice(&ivm);
    iv[4..].copy_from_slice(&ivs);
    iv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_derivation_is_deterministic() {
        let cipher = SoftAes;
        let ltk = [0xFFu8; 16];
        let key1 = derive_session_key(&cipher, &ltk, [1; 8], [2; 8]);
        let key2 = derive_session_key(&cipher, &ltk, [1; 8], [2; 8]);
        assert_eq!(key1, key2);
    }

    #[test]
    fn fresh_session_starts_at_counter_zero() {
        let keys = SessionKeys::for_master([0u8; 16], [1; 4], [2; 4]);
        assert_eq!(keys.tx.counter(), 0);
        assert_eq!(keys.rx.counter(), 0);
        assert_eq!(keys.tx.direction(), Direction::MasterToSlave);
        assert_eq!(keys.rx.direction(), Direction::SlaveToMaster);
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let keys_m = SessionKeys::for_master([0x11u8; 16], [3; 4], [4; 4]);
        let keys_s = SessionKeys::for_slave([0x11u8; 16], [3; 4], [4; 4]);

        let mut tx = keys_m.tx;
        let mut rx = keys_s.rx;

        let mut buf = *b"hello world12345";
        let mut tag = [0u8; 4];
        tx.encrypt_in_place(0x02, &mut buf, &mut tag).unwrap();
        rx.decrypt_in_place(0x02, &mut buf, &tag).unwrap();
        assert_eq!(&buf, b"hello world12345");
    }
}
