//! LLCP procedure state machines: connection update, channel map update, encryption, feature
//! exchange, version exchange, ping, length (DLE), and termination.
//!
//! Wire types live in [`crate::link::llcp`]; this module drives the procedures built on top of
//! them. The reference controller packs an active procedure's type and progress into a pair of
//! wrapping counters (`llcp_req`/`llcp_ack`) checked against each other for inequality. This
//! crate keeps that req/ack pair (so the "at most one outer procedure" testable property has an
//! obvious, directly-checkable representation) but attaches the actual progress to a tagged
//! [`ActiveProcedure`] enum instead of re-deriving it from opcode + counter value, per the
//! crate's Design Notes on replacing FSM bitfields with `{phase, type}` structs.

use crate::error::TerminateReason;
use crate::link::llcp::ControlOpcode;
use crate::phy::ChannelMap;
use crate::time::Duration;
use crate::Error;
use core::cmp;

/// A small wrapping counter (effectively 3 bits, matching the reference controller's bitfield
/// width) used for the outer LLCP req/ack pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PhaseCounter(u8);

impl PhaseCounter {
    pub fn zero() -> Self {
        PhaseCounter(0)
    }

    pub fn bump(&mut self) {
        self.0 = (self.0 + 1) % 8;
    }

    pub fn diff(self, ack: PhaseCounter) -> u8 {
        (self.0.wrapping_sub(ack.0)) % 8
    }
}

/// Master-initiated connection parameters to apply at an instant.
#[derive(Debug, Copy, Clone)]
pub struct ConnParams {
    pub win_size: Duration,
    pub win_offset: Duration,
    pub interval: Duration,
    pub latency: u16,
    pub timeout: Duration,
}

/// Progress of the connection-update / connection-parameter-request procedure.
///
/// States follow `spec.md` §4.5.1: a master-initiated update goes `Initiate -> InProg`
/// directly; a slave-initiated (or master using `CONN_PARAM_REQ`) negotiation goes
/// `Req -> RspWait -> InProg`, with `AppWait` interposed when the host must approve
/// peer-proposed parameters, and `Rsp` when we owe the peer a response.
#[derive(Debug, Copy, Clone)]
pub enum ConnUpdateState {
    Initiate(ConnParams),
    Req(ConnParams),
    RspWait,
    AppWait(ConnParams),
    Rsp(ConnParams),
    InProg { instant: u16, params: ConnParams },
}

/// Progress of the channel map update procedure.
#[derive(Debug, Copy, Clone)]
pub struct ChannelMapUpdateState {
    pub map: ChannelMap,
    pub instant: u16,
}

/// Progress of the encryption start/pause/refresh procedure (`spec.md` §4.5.3).
#[derive(Debug, Copy, Clone)]
pub enum EncryptionState {
    /// Master sent `ENC_REQ`, waiting for `ENC_RSP`.
    MasterWaitEncRsp { skdm: [u8; 8], ivm: [u8; 4] },
    /// Slave received `ENC_REQ`, waiting for the host to supply the LTK.
    SlaveWaitLtk { skdm: [u8; 8], ivm: [u8; 4], rand: [u8; 8], ediv: u16 },
    /// Either side waiting for `START_ENC_REQ`/`START_ENC_RSP` to be acked.
    WaitStartEnc,
    /// Pause requested, waiting for `PAUSE_ENC_RSP`.
    WaitPauseEncRsp,
}

/// Progress of the single-round-trip feature/version/ping exchanges.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SimpleExchangeState {
    WaitRsp,
}

/// The currently active outer LLCP procedure, if any.
#[derive(Debug, Copy, Clone)]
pub enum ActiveProcedure {
    ConnectionUpdate(ConnUpdateState),
    ChannelMap(ChannelMapUpdateState),
    Encryption(EncryptionState),
    Feature(SimpleExchangeState),
    Version(SimpleExchangeState),
    Ping(SimpleExchangeState),
    SlaveFeatureReq(SimpleExchangeState),
}

impl ActiveProcedure {
    pub fn opcode_hint(&self) -> &'static str {
        match self {
            ActiveProcedure::ConnectionUpdate(_) => "connection update",
            ActiveProcedure::ChannelMap(_) => "channel map",
            ActiveProcedure::Encryption(_) => "encryption",
            ActiveProcedure::Feature(_) => "feature exchange",
            ActiveProcedure::Version(_) => "version exchange",
            ActiveProcedure::Ping(_) => "ping",
            ActiveProcedure::SlaveFeatureReq(_) => "slave feature request",
        }
    }

    /// Whether this procedure type collides with connection-update/channel-map per
    /// `spec.md` §4.5.5's collision rules (the two may never run concurrently for the same
    /// connection).
    pub fn collides_with_conn_update_or_channel_map(&self) -> bool {
        matches!(
            self,
            ActiveProcedure::ConnectionUpdate(_) | ActiveProcedure::ChannelMap(_)
        )
    }
}

/// The outer LLCP state for one connection: at most one procedure may be active at a time.
#[derive(Debug, Copy, Clone)]
pub struct Outer {
    req: PhaseCounter,
    ack: PhaseCounter,
    active: Option<ActiveProcedure>,
    procedure_expire: u16,
}

impl Outer {
    pub fn new() -> Self {
        Self {
            req: PhaseCounter::zero(),
            ack: PhaseCounter::zero(),
            active: None,
            procedure_expire: 0,
        }
    }

    /// Testable property 2: `(llcp_req - llcp_ack) mod 8 ∈ {0, 1}`.
    pub fn phase_diff_is_valid(&self) -> bool {
        matches!(self.req.diff(self.ack), 0 | 1)
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active(&self) -> Option<&ActiveProcedure> {
        self.active.as_ref()
    }

    pub fn active_mut(&mut self) -> Option<&mut ActiveProcedure> {
        self.active.as_mut()
    }

    /// Starts a new outer procedure, enforcing the at-most-one rule and the
    /// connection-update/channel-map collision rule.
    pub fn start(&mut self, proc: ActiveProcedure, procedure_reload: u16) -> Result<(), Error> {
        if let Some(active) = &self.active {
            if proc.collides_with_conn_update_or_channel_map()
                && active.collides_with_conn_update_or_channel_map()
            {
                return Err(Error::ProcedureAlreadyActive);
            }
            if !proc.collides_with_conn_update_or_channel_map() {
                return Err(Error::ProcedureAlreadyActive);
            }
        }
        self.req.bump();
        self.active = Some(proc);
        self.procedure_expire = procedure_reload;
        Ok(())
    }

    /// Marks the active procedure as completed, releasing the outer slot.
    pub fn complete(&mut self) {
        self.ack.bump();
        self.active = None;
        self.procedure_expire = 0;
    }

    /// Ticks the procedure-response timer down by one event; returns `true` once it has
    /// reached zero with a procedure still outstanding (LL response timeout, reason 0x22).
    pub fn tick_expire(&mut self) -> bool {
        if self.active.is_some() && self.procedure_expire > 0 {
            self.procedure_expire -= 1;
            self.procedure_expire == 0
        } else {
            false
        }
    }
}

impl Default for Outer {
    fn default() -> Self {
        Self::new()
    }
}

/// The global, controller-wide connection-parameter-update mutex: at most one connection may
/// hold it at a time (testable property 3).
#[derive(Debug, Default, Copy, Clone)]
pub struct ConnUpdateMutex {
    owner: Option<u8>,
}

impl ConnUpdateMutex {
    pub fn new() -> Self {
        Self { owner: None }
    }

    pub fn try_acquire(&mut self, handle: u8) -> Result<(), Error> {
        match self.owner {
            None => {
                self.owner = Some(handle);
                Ok(())
            }
            Some(h) if h == handle => Ok(()),
            Some(_) => Err(Error::ConnUpdateMutexBusy),
        }
    }

    pub fn release(&mut self, handle: u8) {
        if self.owner == Some(handle) {
            self.owner = None;
        }
    }

    pub fn is_held_by_other(&self, handle: u8) -> bool {
        matches!(self.owner, Some(h) if h != handle)
    }

    pub fn owner(&self) -> Option<u8> {
        self.owner
    }
}

/// Computes the instant (connection event count) at which a scheduled change takes effect:
/// `event_counter + latency + 6`, per `spec.md` §4.5.1.
pub fn compute_instant(event_counter: u16, latency: u16) -> u16 {
    event_counter.wrapping_add(latency).wrapping_add(6)
}

/// Whether `instant` has been reached at the current `event_counter`, using the wraparound-safe
/// comparison from `spec.md` §4.5.2 (`(event_counter - instant) mod 2^16 <= 0x7FFF`).
pub fn instant_reached(event_counter: u16, instant: u16) -> bool {
    event_counter.wrapping_sub(instant) <= 0x7FFF
}

/// Error code returned for a `CONN_PARAM_REQ` received while the mutex is held by another
/// connection, or while an unrelated outer procedure is active (`spec.md` §4.5.5).
pub const REJECT_DIFFERENT_TRANSACTION_COLLISION: u8 = 0x20;

/// Progress of the length (Data Length Extension) mini-FSM, independent of the outer LLCP
/// procedure slot (`spec.md` §3/§4.5.4).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LengthState {
    Idle,
    Req,
    AckWait,
    RspWait,
    /// The new effective RX size exceeds the current pool node size; waiting for the RX pool
    /// to become idle before re-initializing it with the larger node size.
    Resize { new_rx_octets: u8 },
}

impl Default for LengthState {
    fn default() -> Self {
        LengthState::Idle
    }
}

/// Computes the effective TX octets we will use for outgoing data PDUs:
/// `min(peer_max_rx_octets, our_default_tx_octets)`.
pub fn effective_tx_octets(peer_max_rx_octets: u16, our_default_tx_octets: u16) -> u16 {
    cmp::min(peer_max_rx_octets, our_default_tx_octets)
}

/// Computes the effective RX octets we will request the peer use:
/// `min(peer_max_tx_octets, RX_MAX)`.
pub fn effective_rx_octets(peer_max_tx_octets: u16, rx_max: u16) -> u16 {
    cmp::min(peer_max_tx_octets, rx_max)
}

/// Progress of the termination procedure (`spec.md` §4.5.5). Independent of the outer LLCP
/// procedure slot so a pending terminate is never blocked by another procedure completing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TerminateState {
    Idle,
    /// Host requested termination; `TERMINATE_IND` queued, waiting for it to be acked.
    Pending(TerminateReason),
    /// Our `TERMINATE_IND` was acked; the pre-reserved terminate RX node can now be delivered.
    Acked(TerminateReason),
    /// Peer sent `TERMINATE_IND`; deliver the reserved terminate RX node at the next event
    /// close.
    PeerRequested(u8),
}

impl Default for TerminateState {
    fn default() -> Self {
        TerminateState::Idle
    }
}

/// Maps a raw opcode we don't recognize (or don't support) onto an `UNKNOWN_RSP`.
pub fn unknown_rsp_for(opcode: ControlOpcode) -> ControlOpcode {
    let _ = opcode;
    ControlOpcode::UnknownRsp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_counter_diff_stays_in_valid_set() {
        let mut outer = Outer::new();
        assert!(outer.phase_diff_is_valid());
        outer
            .start(
                ActiveProcedure::Ping(SimpleExchangeState::WaitRsp),
                40,
            )
            .unwrap();
        assert!(outer.phase_diff_is_valid());
        assert!(outer.is_active());
        outer.complete();
        assert!(outer.phase_diff_is_valid());
        assert!(!outer.is_active());
    }

    #[test]
    fn cannot_start_two_unrelated_procedures() {
        let mut outer = Outer::new();
        outer
            .start(ActiveProcedure::Feature(SimpleExchangeState::WaitRsp), 40)
            .unwrap();
        let err = outer.start(ActiveProcedure::Ping(SimpleExchangeState::WaitRsp), 40);
        assert_eq!(err, Err(Error::ProcedureAlreadyActive));
    }

    #[test]
    fn mutex_rejects_second_owner() {
        let mut mutex = ConnUpdateMutex::new();
        mutex.try_acquire(0).unwrap();
        assert_eq!(mutex.try_acquire(1), Err(Error::ConnUpdateMutexBusy));
        assert!(mutex.is_held_by_other(1));
        mutex.release(0);
        mutex.try_acquire(1).unwrap();
    }

    #[test]
    fn instant_arithmetic_matches_spec() {
        assert_eq!(compute_instant(100, 2), 108);
        assert!(instant_reached(108, 108));
        assert!(instant_reached(109, 108));
        assert!(!instant_reached(50_000, 108));
    }

    #[test]
    fn length_defaults_to_idle() {
        assert_eq!(LengthState::default(), LengthState::Idle);
        assert_eq!(effective_tx_octets(251, 27), 27);
        assert_eq!(effective_rx_octets(251, 251), 251);
    }
}
