//! Per-connection state: event timing, LLCP procedure engine, and encryption/length progress.
//!
//! Generalizes the reference controller's `Connection<C>` (one struct holding event timing, the
//! data PDU retransmit window, and a single ad-hoc LLCP dispatch) into a structure that also
//! tracks the outer LLCP procedure slot, the global connection-update mutex cooperation, the
//! Data Length Extension mini-FSM, and encryption progress, per this crate's expanded scope.

use core::cmp;
use core::num::Wrapping;

use crate::config::{BlockCipher, Config};
use crate::crypto::SessionKeys;
use crate::error::TerminateReason;
use crate::link::advertising::ConnectRequestData;
use crate::link::data::{Header, Llid};
use crate::link::features::FeatureSet;
use crate::link::llcp::{
    ChannelMapReq, ConnectionParamReq, ConnectionParamRsp, ConnectionUpdateReq, ControlPdu, EncReq, EncRsp,
    FeatureRsp, LengthReq, LengthRsp, PauseEncRsp, PingRsp, StartEncRsp, UnknownRsp, VersionInd, VersionNumber,
};
use crate::link::llcp_engine::{
    compute_instant, effective_rx_octets, effective_tx_octets, instant_reached, ActiveProcedure,
    ChannelMapUpdateState, ConnParams, ConnUpdateState, EncryptionState, LengthState, Outer, SimpleExchangeState,
    TerminateState,
};
use crate::link::pool::ConnHandle;
use crate::link::seq_num::SeqNum;
use crate::link::MAX_DATA_PAYLOAD_BUF;
use crate::phy::{select_data_channel, ChannelMap, DataChannel};
use crate::time::{Duration, Instant};
use crate::Error;

/// Which side of the connection this controller is playing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

/// Event-timing state: anchor point, channel hopping, and (slave-only) window widening.
#[derive(Debug, Copy, Clone)]
pub struct EventState {
    anchor: Instant,
    conn_interval: Duration,
    conn_event_count: Wrapping<u16>,
    unmapped_channel: DataChannel,
    channel: DataChannel,
    hop: u8,
    latency: u16,
    channel_map: ChannelMap,
    /// Accumulated receive window widening, slave-only; zero for a master.
    window_widening: Duration,
    /// Local clock accuracy + peer worst-case SCA, in ppm, used to grow `window_widening` each
    /// event (slave-only).
    total_sca_ppm: u32,
}

impl EventState {
    pub fn from_connect_request(data: &ConnectRequestData, anchor: Instant, total_sca_ppm: u32) -> Self {
        Self {
            anchor,
            conn_interval: data.interval(),
            conn_event_count: Wrapping(0),
            unmapped_channel: DataChannel::new(0),
            channel: DataChannel::new(0),
            hop: data.hop(),
            latency: 0,
            channel_map: *data.channel_map(),
            window_widening: Duration::from_micros(0),
            total_sca_ppm,
        }
    }

    pub fn anchor(&self) -> Instant {
        self.anchor
    }

    pub fn conn_event_count(&self) -> u16 {
        self.conn_event_count.0
    }

    pub fn channel(&self) -> DataChannel {
        self.channel
    }

    pub fn channel_map(&self) -> &ChannelMap {
        &self.channel_map
    }

    pub fn conn_interval(&self) -> Duration {
        self.conn_interval
    }

    /// Advances to the next connection event: bumps the anchor by `conn_interval`, re-derives the
    /// data channel per `spec.md` §4.7, and grows the receive window per `spec.md` §4.4:
    /// `periodic = ceil((local_ppm + peer_ppm) * interval / 1e6)`, accumulated across any events
    /// skipped by slave latency (`prepare += periodic * (lazy + 1)`) and clamped to
    /// `interval / 2 - T_IFS`. Slave only; masters keep `total_sca_ppm == 0` and never widen.
    pub fn advance(&mut self) {
        self.anchor = self.anchor + self.conn_interval;
        self.conn_event_count += Wrapping(1);
        let (unmapped, used) =
            select_data_channel(self.unmapped_channel, self.hop, self.latency, &self.channel_map);
        self.unmapped_channel = unmapped;
        self.channel = used;
        let events_elapsed = u64::from(self.latency) + 1;
        self.latency = 0;

        if self.total_sca_ppm > 0 {
            let interval_us = u64::from(self.conn_interval.as_micros());
            let periodic_us = (interval_us * u64::from(self.total_sca_ppm) + 999_999) / 1_000_000;
            let max_us =
                (interval_us / 2).saturating_sub(u64::from(Duration::T_IFS.as_micros()));
            let widening_us = cmp::min(
                u64::from(self.window_widening.as_micros()) + periodic_us * events_elapsed,
                max_us,
            );
            self.window_widening = Duration::from_micros(widening_us as u32);
        }
    }

    pub fn window_widening(&self) -> Duration {
        self.window_widening
    }

    /// Resets accumulated window widening to zero, called on every successfully received packet
    /// (`spec.md` §4.4: widening only accumulates across *consecutive* missed/lazy events).
    pub fn reset_window_widening(&mut self) {
        self.window_widening = Duration::from_micros(0);
    }

    /// Applies a new channel map at the given instant's boundary (called once `instant_reached`
    /// returns true for a pending channel map update).
    pub fn apply_channel_map(&mut self, map: ChannelMap) {
        self.channel_map = map;
    }

    /// Applies new connection parameters at the instant boundary: shifts the anchor by
    /// `win_offset` (the new connection event's window offset, `spec.md` §4.5.1) and installs
    /// the new interval/latency from that point on.
    pub fn apply_conn_update(&mut self, win_offset: Duration, interval: Duration, latency: u16) {
        self.anchor = self.anchor + win_offset;
        self.conn_interval = interval;
        self.latency = latency;
    }

    /// Records slave latency skipped ahead by the host (applied on the next `advance`).
    pub fn set_latency(&mut self, latency: u16) {
        self.latency = latency;
    }
}

/// Data length (DLE) negotiated sizes, independent of the outer LLCP procedure slot.
#[derive(Debug, Copy, Clone)]
pub struct DataLength {
    pub max_tx_octets: u16,
    pub max_rx_octets: u16,
    pub max_tx_time: u16,
    pub max_rx_time: u16,
}

/// A host-facing notification emitted once an LLCP procedure completes, mirroring the Core
/// spec's LE Meta Events (`LE Connection Update Complete`, `LE Data Length Change`,
/// `LE Encryption Change`/refresh). Collected via [`crate::link::Controller::drain_meta_events`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnMetaEvent {
    ConnectionUpdate {
        status: u8,
        interval: Duration,
        latency: u16,
        timeout: Duration,
    },
    DataLengthChange {
        max_tx_octets: u16,
        max_tx_time: u16,
        max_rx_octets: u16,
        max_rx_time: u16,
    },
    EncryptionChange {
        enabled: bool,
    },
}

impl Default for DataLength {
    fn default() -> Self {
        Self {
            max_tx_octets: 27,
            max_rx_octets: 27,
            max_tx_time: 328,
            max_rx_time: 328,
        }
    }
}

/// Raw key material exchanged during an `ENC_REQ`/`ENC_RSP` round trip, held until the host has
/// derived the session key and the `START_ENC_REQ`/`START_ENC_RSP` round trip installs it.
///
/// Deriving the session key needs the LTK, which only the host knows (looked up by `rand`/
/// `ediv`), so the real-time side just stashes the exchanged halves for the host to pick up via
/// [`Connection::pending_encryption_material`].
#[derive(Debug, Copy, Clone)]
pub struct PendingEncMaterial {
    pub skdm: [u8; 8],
    pub ivm: [u8; 4],
    pub skds: [u8; 8],
    pub ivs: [u8; 4],
}

/// One live connection: timing, procedure engine, and (once negotiated) encryption state.
pub struct Connection<C: Config> {
    handle: ConnHandle,
    role: Role,
    access_address: u32,
    crc_init: u32,
    events: EventState,
    supervision_timeout: Duration,
    last_received: Instant,
    transmit_seq_num: SeqNum,
    next_expected_seq_num: SeqNum,
    outer: Outer,
    length: LengthState,
    data_length: DataLength,
    /// The `LENGTH_RSP` owed to the peer once a pending RX pool resize
    /// ([`LengthState::Resize`]) completes; `None` once sent or when no resize was needed.
    pending_length_rsp: Option<LengthRsp>,
    terminate: TerminateState,
    feature_rsp_received: bool,
    encryption: Option<SessionKeys>,
    pending_enc_material: Option<PendingEncMaterial>,
    prepared_keys: Option<SessionKeys>,
    _block_cipher: core::marker::PhantomData<C>,
}

impl<C: Config> Connection<C> {
    /// Creates a new connection from a parsed `CONNECT_REQ`, anchored at the end of the
    /// advertising exchange that established it.
    pub fn create(data: &ConnectRequestData, handle: ConnHandle, anchor: Instant, local_sca_ppm: u32) -> Self {
        let peer_sca_idx = data.sca() as usize;
        let peer_sca_ppm = u32::from(crate::link::advertising::SCA_PPM_TABLE[peer_sca_idx]);
        Self {
            handle,
            role: Role::Slave,
            access_address: data.access_address(),
            crc_init: data.crc_init(),
            events: EventState::from_connect_request(data, anchor, local_sca_ppm + peer_sca_ppm),
            supervision_timeout: data.timeout(),
            last_received: anchor,
            transmit_seq_num: SeqNum::ZERO,
            next_expected_seq_num: SeqNum::ZERO,
            outer: Outer::new(),
            length: LengthState::default(),
            data_length: DataLength::default(),
            pending_length_rsp: None,
            terminate: TerminateState::default(),
            feature_rsp_received: false,
            encryption: None,
            pending_enc_material: None,
            prepared_keys: None,
            _block_cipher: core::marker::PhantomData,
        }
    }

    pub fn handle(&self) -> ConnHandle {
        self.handle
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn access_address(&self) -> u32 {
        self.access_address
    }

    pub fn crc_init(&self) -> u32 {
        self.crc_init
    }

    pub fn events(&self) -> &EventState {
        &self.events
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    pub fn encryption(&self) -> Option<&SessionKeys> {
        self.encryption.as_ref()
    }

    pub fn outer(&self) -> &Outer {
        &self.outer
    }

    pub fn length_state(&self) -> LengthState {
        self.length
    }

    pub fn data_length(&self) -> DataLength {
        self.data_length
    }

    pub fn terminate_state(&self) -> TerminateState {
        self.terminate
    }

    /// Testable property: supervision timeout has elapsed since the last successfully received
    /// packet.
    pub fn supervision_expired(&self, now: Instant) -> bool {
        supervision_expired(self.last_received, self.supervision_timeout, now)
    }

    /// Whether the peer has answered our outstanding feature request (or initiated its own).
    pub fn feature_response_received(&self) -> bool {
        self.feature_rsp_received
    }

    /// Records a successfully received packet, resetting the supervision timer and the
    /// accumulated receive window widening (`spec.md` §4.4: widening only accumulates across
    /// consecutive missed/lazy events).
    pub fn note_received(&mut self, now: Instant) {
        self.last_received = now;
        self.events.reset_window_widening();
    }

    /// Advances timing and channel selection to the next connection event.
    pub fn advance_event(&mut self) {
        self.events.advance();
    }

    pub fn transmit_seq_num(&self) -> SeqNum {
        self.transmit_seq_num
    }

    pub fn next_expected_seq_num(&self) -> SeqNum {
        self.next_expected_seq_num
    }

    /// Updates local `SN`/`NESN` state for a received data channel header. Testable property 1:
    /// `nesn` toggles exactly once per accepted RX, `sn` toggles exactly once per acknowledged
    /// TX. Returns whether the PDU carries payload that hasn't already been delivered; a
    /// retransmission of the last accepted PDU is ACKed again but must not be re-delivered.
    pub fn process_data_header(&mut self, header: &Header) -> bool {
        let is_new = header.sn() == self.next_expected_seq_num;
        if is_new {
            self.next_expected_seq_num += SeqNum::ONE;
        }
        if header.nesn() == self.transmit_seq_num + SeqNum::ONE {
            self.transmit_seq_num += SeqNum::ONE;
            if let TerminateState::Pending(reason) = self.terminate {
                self.terminate = TerminateState::Acked(reason);
            }
        }
        is_new
    }

    /// Builds the `SN`/`NESN` fields to stamp on the next outgoing data channel PDU.
    pub fn next_tx_header(&self, llid: Llid) -> Header {
        let mut header = Header::new(llid);
        header.set_sn(self.transmit_seq_num);
        header.set_nesn(self.next_expected_seq_num);
        header
    }

    /// Begins the connection-update (or CONN_PARAM_REQ-negotiated update) procedure as the
    /// initiator. Returns `Err(Error::ProcedureAlreadyActive)` if another incompatible
    /// procedure is running, per `spec.md` §4.5.5's collision rule.
    pub fn start_connection_update(&mut self, params: ConnParams) -> Result<(), Error> {
        self.outer
            .start(ActiveProcedure::ConnectionUpdate(ConnUpdateState::Initiate(params)), 40)
    }

    /// Begins a `CONNECTION_PARAM_REQ`-negotiated update as the initiator (the path a slave, or
    /// a master preferring the negotiated form over `CONNECTION_UPDATE_REQ`, uses). Transitions
    /// `Req -> RspWait`; returns the `CONNECTION_PARAM_REQ` to transmit.
    pub fn start_connection_param_request(&mut self, params: ConnParams) -> Result<ControlPdu, Error> {
        self.outer
            .start(ActiveProcedure::ConnectionUpdate(ConnUpdateState::Req(params)), 40)?;
        if let Some(active) = self.outer.active_mut() {
            *active = ActiveProcedure::ConnectionUpdate(ConnUpdateState::RspWait);
        }
        let mut req = ConnectionParamReq::new();
        req.set_conn_interval(params.interval, params.interval);
        req.set_slave_latency(params.latency);
        req.set_supervision_timeout_raw((params.timeout.as_micros() / 10_000) as u16);
        Ok(ControlPdu::ConnectionParamReq(req))
    }

    /// Approves a peer-proposed `CONNECTION_PARAM_REQ` currently waiting on host approval
    /// (`ConnUpdateState::AppWait`), computing the instant and returning the
    /// `CONNECTION_PARAM_RSP` to transmit (`spec.md` §4.5.1's host-approval step).
    pub fn approve_connection_param_update(&mut self) -> Result<ControlPdu, Error> {
        let params = match self.outer.active() {
            Some(ActiveProcedure::ConnectionUpdate(ConnUpdateState::AppWait(params))) => *params,
            _ => return Err(Error::InvalidValue),
        };
        let instant = compute_instant(self.events.conn_event_count(), params.latency);
        if let Some(active) = self.outer.active_mut() {
            *active = ActiveProcedure::ConnectionUpdate(ConnUpdateState::InProg { instant, params });
        }
        let mut rsp = ConnectionParamRsp::new();
        rsp.set_conn_interval(params.interval, params.interval);
        rsp.set_slave_latency(params.latency);
        rsp.set_supervision_timeout_raw((params.timeout.as_micros() / 10_000) as u16);
        Ok(ControlPdu::ConnectionParamRsp(rsp))
    }

    /// Begins the channel map update procedure as the initiator.
    pub fn start_channel_map_update(&mut self, map: ChannelMap) -> Result<(), Error> {
        let instant = compute_instant(self.events.conn_event_count(), 0);
        self.outer
            .start(ActiveProcedure::ChannelMap(ChannelMapUpdateState { map, instant }), 40)
    }

    /// Begins a feature exchange as the initiator.
    pub fn start_feature_exchange(&mut self) -> Result<(), Error> {
        self.outer
            .start(ActiveProcedure::Feature(SimpleExchangeState::WaitRsp), 40)
    }

    /// Begins a ping exchange (keepalive) as the initiator.
    pub fn start_ping(&mut self) -> Result<(), Error> {
        self.outer.start(ActiveProcedure::Ping(SimpleExchangeState::WaitRsp), 40)
    }

    /// Queues local host termination with `reason`.
    pub fn request_termination(&mut self, reason: TerminateReason) {
        self.terminate = TerminateState::Pending(reason);
    }

    /// Begins link encryption as the master, using key material the host has already chosen
    /// (`rand`/`ediv` identify the LTK to the peer; `skdm`/`ivm` are our half of the session key
    /// material). Returns the `ENC_REQ` to transmit.
    pub fn start_encryption(&mut self, rand: [u8; 8], ediv: u16, skdm: [u8; 8], ivm: [u8; 4]) -> Result<ControlPdu, Error> {
        self.outer
            .start(ActiveProcedure::Encryption(EncryptionState::MasterWaitEncRsp { skdm, ivm }), 40)?;
        Ok(ControlPdu::EncReq(EncReq::new(rand, ediv, skdm, ivm)))
    }

    /// Returns the key material the host needs to derive the session key, once an `ENC_REQ`/
    /// `ENC_RSP` round trip has completed on either side.
    pub fn pending_encryption_material(&self) -> Option<PendingEncMaterial> {
        self.pending_enc_material
    }

    /// As the slave, accepts a peer-initiated `ENC_REQ` once the host has looked up the LTK and
    /// chosen its own `SKDs`/`IVs` half. Returns the `ENC_RSP` to transmit.
    pub fn accept_encryption_request(&mut self, skds: [u8; 8], ivs: [u8; 4]) -> Result<ControlPdu, Error> {
        let (skdm, ivm) = match self.outer.active() {
            Some(ActiveProcedure::Encryption(EncryptionState::SlaveWaitLtk { skdm, ivm, .. })) => (*skdm, *ivm),
            _ => return Err(Error::InvalidValue),
        };
        self.pending_enc_material = Some(PendingEncMaterial { skdm, ivm, skds, ivs });
        if let Some(active) = self.outer.active_mut() {
            *active = ActiveProcedure::Encryption(EncryptionState::WaitStartEnc);
        }
        Ok(ControlPdu::EncRsp(EncRsp::new(skds, ivs)))
    }

    /// Stashes the session key the host derived from [`Connection::pending_encryption_material`],
    /// to be installed once `START_ENC_REQ`/`START_ENC_RSP` is acked.
    pub fn prepare_session_keys(&mut self, keys: SessionKeys) {
        self.prepared_keys = Some(keys);
    }

    /// Begins the Data Length Extension request procedure as the initiator, requesting the peer
    /// use up to `max_rx_octets`/`max_rx_time` when transmitting to us.
    pub fn start_length_request(&mut self, max_rx_octets: u16, max_rx_time: u16) -> Result<ControlPdu, Error> {
        if self.length != LengthState::Idle {
            return Err(Error::ProcedureAlreadyActive);
        }
        self.length = LengthState::RspWait;
        Ok(ControlPdu::LengthReq(LengthReq::new(
            max_rx_octets,
            max_rx_time,
            self.data_length.max_tx_octets,
            self.data_length.max_tx_time,
        )))
    }

    /// Checks whether a pending connection-update/channel-map instant has been reached for the
    /// current connection event, applying it and completing the outer procedure if so. Returns
    /// the conn-update-complete meta event to surface to the host once a parameter change has
    /// been applied (`spec.md` §4.5.1, §5).
    pub fn poll_instant(&mut self) -> Option<ConnMetaEvent> {
        let event_count = self.events.conn_event_count();
        let mut meta = None;
        let completed = match self.outer.active() {
            Some(ActiveProcedure::ConnectionUpdate(ConnUpdateState::InProg { instant, params })) => {
                if instant_reached(event_count, *instant) {
                    self.events.apply_conn_update(params.win_offset, params.interval, params.latency);
                    self.supervision_timeout = params.timeout;
                    meta = Some(ConnMetaEvent::ConnectionUpdate {
                        status: 0,
                        interval: params.interval,
                        latency: params.latency,
                        timeout: params.timeout,
                    });
                    true
                } else {
                    false
                }
            }
            Some(ActiveProcedure::ChannelMap(ChannelMapUpdateState { map, instant })) => {
                if instant_reached(event_count, *instant) {
                    self.events.apply_channel_map(*map);
                    true
                } else {
                    false
                }
            }
            _ => false,
        };
        if completed {
            self.outer.complete();
        }
        meta
    }

    /// Processes an incoming LLCP control PDU, returning an optional response to queue for
    /// transmission and an optional meta event to surface to the host. Mirrors `spec.md` §4.5's
    /// per-procedure dispatch; the parts of encryption establishment that need the LTK
    /// (`ENC_REQ`/`ENC_RSP`) are driven by the host via
    /// [`Connection::accept_encryption_request`]/[`Connection::prepare_session_keys`], since
    /// deriving the session key crosses the real-time/non-real-time boundary.
    ///
    /// `rx_pool_octets` is the shared RX pool's current per-node payload capacity, needed by the
    /// length (DLE) arms to decide whether a negotiated size requires growing the pool first.
    pub fn process_control_pdu(
        &mut self,
        pdu: &ControlPdu,
        rx_pool_octets: u16,
    ) -> Result<(Option<ControlPdu>, Option<ConnMetaEvent>), Error> {
        match pdu {
            ControlPdu::ConnectionUpdateReq(req) => {
                self.handle_connection_update_req(req);
                Ok((None, None))
            }
            ControlPdu::ChannelMapReq(req) => {
                self.handle_channel_map_req(req);
                Ok((None, None))
            }
            ControlPdu::TerminateInd(ind) => {
                let reason = TerminateReason::remap_peer_reason(ind.error_code());
                self.terminate = TerminateState::PeerRequested(reason);
                Ok((None, None))
            }
            ControlPdu::EncReq(req) => {
                let _ = self.outer.start(
                    ActiveProcedure::Encryption(EncryptionState::SlaveWaitLtk {
                        skdm: req.skdm(),
                        ivm: req.ivm(),
                        rand: req.rand(),
                        ediv: req.ediv(),
                    }),
                    40,
                );
                Ok((None, None))
            }
            ControlPdu::EncRsp(rsp) => {
                if let Some(ActiveProcedure::Encryption(EncryptionState::MasterWaitEncRsp { skdm, ivm })) =
                    self.outer.active()
                {
                    self.pending_enc_material = Some(PendingEncMaterial {
                        skdm: *skdm,
                        ivm: *ivm,
                        skds: rsp.skds(),
                        ivs: rsp.ivs(),
                    });
                    if let Some(active) = self.outer.active_mut() {
                        *active = ActiveProcedure::Encryption(EncryptionState::WaitStartEnc);
                    }
                }
                Ok((None, None))
            }
            ControlPdu::StartEncReq(_) => {
                if matches!(self.outer.active(), Some(ActiveProcedure::Encryption(EncryptionState::WaitStartEnc))) {
                    if let Some(keys) = self.prepared_keys.take() {
                        self.encryption = Some(keys);
                    }
                    self.pending_enc_material = None;
                    self.outer.complete();
                    Ok((
                        Some(ControlPdu::StartEncRsp(StartEncRsp::new())),
                        Some(ConnMetaEvent::EncryptionChange { enabled: true }),
                    ))
                } else {
                    Ok((Some(ControlPdu::UnknownRsp(UnknownRsp::new(pdu.opcode()))), None))
                }
            }
            ControlPdu::StartEncRsp(_) => {
                if matches!(self.outer.active(), Some(ActiveProcedure::Encryption(EncryptionState::WaitStartEnc))) {
                    if let Some(keys) = self.prepared_keys.take() {
                        self.encryption = Some(keys);
                    }
                    self.pending_enc_material = None;
                    self.outer.complete();
                    Ok((None, Some(ConnMetaEvent::EncryptionChange { enabled: true })))
                } else {
                    Ok((None, None))
                }
            }
            ControlPdu::PauseEncReq(_) => {
                let _ = self.outer.start(ActiveProcedure::Encryption(EncryptionState::WaitPauseEncRsp), 40);
                self.clear_session_keys();
                Ok((Some(ControlPdu::PauseEncRsp(PauseEncRsp::new())), None))
            }
            ControlPdu::PauseEncRsp(_) => {
                if matches!(self.outer.active(), Some(ActiveProcedure::Encryption(EncryptionState::WaitPauseEncRsp))) {
                    self.clear_session_keys();
                    self.outer.complete();
                    Ok((None, Some(ConnMetaEvent::EncryptionChange { enabled: false })))
                } else {
                    Ok((None, None))
                }
            }
            ControlPdu::FeatureReq(req) => {
                let rsp = FeatureRsp::new(req.features() & FeatureSet::supported());
                self.feature_rsp_received = true;
                Ok((Some(ControlPdu::FeatureRsp(rsp)), None))
            }
            ControlPdu::SlaveFeatureReq(req) => {
                let rsp = FeatureRsp::new(req.feature_set() & FeatureSet::supported());
                self.feature_rsp_received = true;
                Ok((Some(ControlPdu::FeatureRsp(rsp)), None))
            }
            ControlPdu::FeatureRsp(_) => {
                self.feature_rsp_received = true;
                if matches!(self.outer.active(), Some(ActiveProcedure::Feature(_))) {
                    self.outer.complete();
                }
                Ok((None, None))
            }
            ControlPdu::VersionInd(_) => {
                let ours = VersionInd::new(VersionNumber::V5_1, crate::link::comp_id::CompanyId::UNASSIGNED, 0);
                Ok((Some(ControlPdu::VersionInd(ours)), None))
            }
            ControlPdu::RejectInd(_) | ControlPdu::RejectIndExt(_) => {
                self.outer.complete();
                Ok((None, None))
            }
            ControlPdu::ConnectionParamReq(req) => Ok((self.handle_connection_param_req(req), None)),
            ControlPdu::ConnectionParamRsp(rsp) => {
                self.handle_connection_param_rsp(rsp);
                Ok((None, None))
            }
            ControlPdu::PingReq(_) => Ok((Some(ControlPdu::PingRsp(PingRsp::new())), None)),
            ControlPdu::PingRsp(_) => {
                if matches!(self.outer.active(), Some(ActiveProcedure::Ping(_))) {
                    self.outer.complete();
                }
                Ok((None, None))
            }
            ControlPdu::LengthReq(req) => {
                let rsp = self.handle_length_req(req, rx_pool_octets);
                Ok((rsp.map(ControlPdu::LengthRsp), None))
            }
            ControlPdu::LengthRsp(rsp) => {
                self.handle_length_rsp(rsp, rx_pool_octets);
                Ok((None, None))
            }
            ControlPdu::UnknownRsp(_) => {
                self.outer.complete();
                Ok((None, None))
            }
        }
    }

    fn handle_connection_update_req(&mut self, req: &ConnectionUpdateReq) {
        let params = ConnParams {
            win_size: req.win_size(),
            win_offset: req.win_offset(),
            interval: req.interval(),
            latency: req.latency(),
            timeout: req.timeout(),
        };
        let instant = req.instant();
        let state = ActiveProcedure::ConnectionUpdate(ConnUpdateState::InProg { instant, params });
        match self.outer.active_mut() {
            Some(active) => *active = state,
            None => {
                let _ = self.outer.start(state, 40);
            }
        }
        self.supervision_timeout = params.timeout;
    }

    fn handle_channel_map_req(&mut self, req: &ChannelMapReq) {
        let map = req.channel_map();
        let instant = req.instant();
        let proc_state = ActiveProcedure::ChannelMap(ChannelMapUpdateState { map, instant });
        match self.outer.active_mut() {
            Some(active) => *active = proc_state,
            None => {
                let _ = self.outer.start(proc_state, 40);
            }
        }
    }

    /// Stages a peer-proposed `CONNECTION_PARAM_REQ` for host approval (`spec.md` §4.5.1's
    /// host-approval step): moves the outer procedure to `AppWait` and returns `None`, deferring
    /// the `CONNECTION_PARAM_RSP` until the host calls
    /// [`Connection::approve_connection_param_update`].
    fn handle_connection_param_req(&mut self, req: &ConnectionParamReq) -> Option<ControlPdu> {
        let params = ConnParams {
            win_size: Duration::from_micros(0),
            win_offset: Duration::from_micros(0),
            interval: req.max_conn_interval(),
            latency: req.slave_latency(),
            timeout: req.supervision_timeout(),
        };
        let state = ActiveProcedure::ConnectionUpdate(ConnUpdateState::AppWait(params));
        match self.outer.active_mut() {
            Some(active) => *active = state,
            None => {
                let _ = self.outer.start(state, 40);
            }
        }
        None
    }

    /// Applies the peer's `CONNECTION_PARAM_RSP` to an update we initiated via `CONN_PARAM_REQ`.
    /// Only valid while we are specifically waiting on that response (`RspWait`); a response
    /// arriving for any other outer procedure (or none) is ignored.
    fn handle_connection_param_rsp(&mut self, rsp: &ConnectionParamRsp) {
        if !matches!(
            self.outer.active(),
            Some(ActiveProcedure::ConnectionUpdate(ConnUpdateState::RspWait))
        ) {
            return;
        }
        let params = ConnParams {
            win_size: Duration::from_micros(0),
            win_offset: Duration::from_micros(0),
            interval: rsp.max_conn_interval(),
            latency: rsp.slave_latency(),
            timeout: rsp.supervision_timeout(),
        };
        let instant = compute_instant(self.events.conn_event_count(), params.latency);
        if let Some(active) = self.outer.active_mut() {
            *active = ActiveProcedure::ConnectionUpdate(ConnUpdateState::InProg { instant, params });
        }
        self.supervision_timeout = params.timeout;
    }

    /// Negotiates Data Length Extension sizes for a peer-initiated `LENGTH_REQ`, per `spec.md`
    /// §4.6: our effective TX size is capped by the peer's advertised RX size, and vice versa.
    /// If the negotiated RX size exceeds the shared RX pool's current node capacity, defers the
    /// `LENGTH_RSP` until [`Connection::complete_length_resize`] is called once the pool has
    /// been grown (`spec.md` §4.6/§5's pool re-initialisation rule), returning `None` here.
    fn handle_length_req(&mut self, req: &LengthReq, rx_pool_octets: u16) -> Option<LengthRsp> {
        let new_tx_octets = effective_tx_octets(req.max_rx_octets(), MAX_DATA_PAYLOAD_BUF as u16);
        let new_rx_octets = effective_rx_octets(req.max_tx_octets(), MAX_DATA_PAYLOAD_BUF as u16);
        self.data_length.max_tx_octets = new_tx_octets;
        let rsp = LengthRsp::new(
            new_rx_octets,
            self.data_length.max_rx_time,
            new_tx_octets,
            self.data_length.max_tx_time,
        );
        if new_rx_octets > rx_pool_octets {
            self.length = LengthState::Resize {
                new_rx_octets: new_rx_octets as u8,
            };
            self.pending_length_rsp = Some(rsp);
            None
        } else {
            self.data_length.max_rx_octets = new_rx_octets;
            self.length = LengthState::Idle;
            Some(rsp)
        }
    }

    /// Applies the peer's `LENGTH_RSP` to a DLE request we initiated. Mirrors
    /// [`Connection::handle_length_req`]'s deferral when the negotiated RX size outgrows the
    /// pool's current capacity.
    fn handle_length_rsp(&mut self, rsp: &LengthRsp, rx_pool_octets: u16) {
        if self.length != LengthState::RspWait {
            return;
        }
        let new_tx_octets = effective_tx_octets(rsp.max_rx_octets(), MAX_DATA_PAYLOAD_BUF as u16);
        let new_rx_octets = effective_rx_octets(rsp.max_tx_octets(), MAX_DATA_PAYLOAD_BUF as u16);
        self.data_length.max_tx_octets = new_tx_octets;
        if new_rx_octets > rx_pool_octets {
            self.length = LengthState::Resize {
                new_rx_octets: new_rx_octets as u8,
            };
        } else {
            self.data_length.max_rx_octets = new_rx_octets;
            self.length = LengthState::Idle;
        }
    }

    /// Returns the pending new RX octet size if this connection is waiting for the shared RX
    /// pool to be grown, without requiring mutable access.
    pub fn pending_length_resize(&self) -> Option<u8> {
        match self.length {
            LengthState::Resize { new_rx_octets } => Some(new_rx_octets),
            _ => None,
        }
    }

    /// Finalizes a deferred DLE resize once the shared RX pool has been re-initialised with
    /// enough capacity: installs the new RX octet size, completes the length mini-FSM, and
    /// returns the deferred `LENGTH_RSP` (if we were the peer-initiated side) plus the
    /// data-length-change meta event to surface to the host.
    pub fn complete_length_resize(&mut self) -> (Option<ControlPdu>, ConnMetaEvent) {
        if let LengthState::Resize { new_rx_octets } = self.length {
            self.data_length.max_rx_octets = u16::from(new_rx_octets);
        }
        self.length = LengthState::Idle;
        let rsp = self.pending_length_rsp.take().map(ControlPdu::LengthRsp);
        let meta = ConnMetaEvent::DataLengthChange {
            max_tx_octets: self.data_length.max_tx_octets,
            max_tx_time: self.data_length.max_tx_time,
            max_rx_octets: self.data_length.max_rx_octets,
            max_rx_time: self.data_length.max_rx_time,
        };
        (rsp, meta)
    }

    /// Installs the session keys once `START_ENC_RSP` has been exchanged and acknowledged.
    pub fn install_session_keys(&mut self, keys: SessionKeys) {
        self.encryption = Some(keys);
    }

    /// Tears down encryption, e.g. on disconnect or an `ENCRYPTION_PAUSE` round trip completing.
    pub fn clear_session_keys(&mut self) {
        self.encryption = None;
    }

    /// Derives the session key for an `ENC_REQ`/`ENC_RSP` handshake using the configured cipher.
    pub fn derive_session_key<B: BlockCipher>(cipher: &B, ltk: &[u8; 16], skdm: [u8; 8], skds: [u8; 8]) -> [u8; 16] {
        crate::crypto::derive_session_key(cipher, ltk, skdm, skds)
    }
}

fn supervision_expired(last_received: Instant, timeout: Duration, now: Instant) -> bool {
    now.duration_since(last_received) >= timeout
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::{ByteReader, FromBytes};
    use crate::link::advertising::{ConnectRequestData, Header};
    use crate::link::llcp::StartEncReq;

    fn sample_connect_request() -> ConnectRequestData {
        let mut buf = [0u8; 34];
        buf[0..6].copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        buf[6..12].copy_from_slice(&[0x5A, 0x92, 0x04, 0x26, 0xC6, 0x88]);
        buf[12..16].copy_from_slice(&0x1234_5678u32.to_le_bytes());
        buf[16..19].copy_from_slice(&[0x01, 0x02, 0x03]);
        buf[19] = 6;
        buf[20..22].copy_from_slice(&2u16.to_le_bytes());
        buf[22..24].copy_from_slice(&6u16.to_le_bytes());
        buf[24..26].copy_from_slice(&0u16.to_le_bytes());
        buf[26..28].copy_from_slice(&100u16.to_le_bytes());
        buf[28..33].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0x1F]);
        buf[33] = 5 | (3 << 5);

        let raw_header: u16 = 0x05 | (34u16 << 8);
        let mut reader = ByteReader::new(&raw_header.to_le_bytes());
        let header = Header::from_bytes(&mut reader).unwrap();
        ConnectRequestData::parse(&header, &buf).unwrap()
    }

    #[test]
    fn connection_event_advances_channel() {
        let data = sample_connect_request();
        let mut events = EventState::from_connect_request(&data, Instant::from_raw_micros(0), 0);
        let first = events.channel();
        events.advance();
        assert_eq!(events.conn_event_count(), 1);
        let _ = first;
    }

    #[test]
    fn supervision_timeout_detects_silence() {
        let start = Instant::from_raw_micros(0);
        let timeout = Duration::from_secs(1);
        assert!(!supervision_expired(start, timeout, start));
        let later = start + Duration::from_secs(2);
        assert!(supervision_expired(start, timeout, later));
    }

    #[test]
    fn outer_procedure_start_and_complete() {
        let mut outer = Outer::new();
        outer
            .start(ActiveProcedure::Feature(SimpleExchangeState::WaitRsp), 40)
            .unwrap();
        assert!(outer.is_active());
        outer.complete();
        assert!(!outer.is_active());
    }

    #[test]
    fn data_header_toggles_nesn_on_new_pdu_and_sn_on_peer_ack() {
        let data = sample_connect_request();
        let mut conn = Connection::<TestConfig>::create(&data, ConnHandle(0), Instant::from_raw_micros(0), 0);

        // Peer's first PDU: SN=0 (matches our expected 0), NESN=0 (our last TX, none yet, still
        // not acked).
        let mut header = crate::link::data::Header::new(Llid::DataCont);
        header.set_sn(SeqNum::ZERO);
        header.set_nesn(SeqNum::ZERO);
        assert!(conn.process_data_header(&header));
        assert_eq!(conn.next_expected_seq_num(), SeqNum::ONE);
        assert_eq!(conn.transmit_seq_num(), SeqNum::ZERO);

        // Peer acks our (not-yet-sent) transmission by echoing NESN=1 and sends a retransmit of
        // the PDU it just sent (SN still 0): not new data, but still acks our TX.
        let mut header2 = crate::link::data::Header::new(Llid::DataCont);
        header2.set_sn(SeqNum::ZERO);
        header2.set_nesn(SeqNum::ONE);
        assert!(!conn.process_data_header(&header2));
        assert_eq!(conn.transmit_seq_num(), SeqNum::ONE);

        let tx = conn.next_tx_header(Llid::DataCont);
        assert_eq!(tx.sn(), SeqNum::ONE);
        assert_eq!(tx.nesn(), SeqNum::ONE);
    }

    #[test]
    fn length_req_negotiates_min_of_both_sides() {
        let data = sample_connect_request();
        let mut conn = Connection::<TestConfig>::create(&data, ConnHandle(0), Instant::from_raw_micros(0), 0);

        // Peer can receive up to 100 octets from us, and can send us up to 251.
        let req = LengthReq::new(100, 2120, 251, 2120);
        let rsp = match conn.process_control_pdu(&ControlPdu::LengthReq(req), 251).unwrap() {
            (Some(ControlPdu::LengthRsp(rsp)), None) => rsp,
            other => panic!("unexpected response: {:?}", other),
        };
        // Our TX is capped by the peer's advertised RX size (100); our RX is capped by the
        // peer's advertised TX size (251), which is within our own 251-octet ceiling.
        assert_eq!(rsp.max_tx_octets(), 100);
        assert_eq!(rsp.max_rx_octets(), 251);
        assert_eq!(conn.data_length().max_tx_octets, 100);
        assert_eq!(conn.data_length().max_rx_octets, 251);
    }

    #[test]
    fn length_req_defers_response_until_pool_resized() {
        let data = sample_connect_request();
        let mut conn = Connection::<TestConfig>::create(&data, ConnHandle(0), Instant::from_raw_micros(0), 0);

        // Peer wants to negotiate a 251-octet RX size, but the shared pool is still at the
        // 27-octet default: the response must be deferred until the pool is grown.
        let req = LengthReq::new(27, 328, 251, 2120);
        let (rsp, meta) = conn.process_control_pdu(&ControlPdu::LengthReq(req), 27).unwrap();
        assert!(rsp.is_none());
        assert!(meta.is_none());
        assert_eq!(conn.pending_length_resize(), Some(251));

        let (deferred_rsp, meta) = conn.complete_length_resize();
        assert_eq!(conn.pending_length_resize(), None);
        assert_eq!(conn.data_length().max_rx_octets, 251);
        match deferred_rsp {
            Some(ControlPdu::LengthRsp(rsp)) => assert_eq!(rsp.max_rx_octets(), 251),
            other => panic!("unexpected response: {:?}", other),
        }
        match meta {
            ConnMetaEvent::DataLengthChange { max_rx_octets, .. } => assert_eq!(max_rx_octets, 251),
            other => panic!("unexpected meta event: {:?}", other),
        }
    }

    #[test]
    fn connection_param_req_is_accepted_and_echoed() {
        let data = sample_connect_request();
        let mut conn = Connection::<TestConfig>::create(&data, ConnHandle(0), Instant::from_raw_micros(0), 0);

        let mut req = ConnectionParamReq::new();
        req.set_conn_interval(Duration::from_micros(30_000), Duration::from_micros(30_000));
        req.set_slave_latency(2);

        let (rsp, meta) = conn.process_control_pdu(&ControlPdu::ConnectionParamReq(req), 27).unwrap();
        assert!(rsp.is_none());
        assert!(meta.is_none());
        assert!(conn.outer().is_active());

        match conn.approve_connection_param_update().unwrap() {
            ControlPdu::ConnectionParamRsp(rsp) => {
                assert_eq!(rsp.max_conn_interval(), Duration::from_micros(30_000));
                assert_eq!(rsp.slave_latency(), 2);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn encryption_round_trip_installs_matching_session_keys() {
        let data = sample_connect_request();
        let mut master = Connection::<TestConfig>::create(&data, ConnHandle(0), Instant::from_raw_micros(0), 0);
        let mut slave = Connection::<TestConfig>::create(&data, ConnHandle(1), Instant::from_raw_micros(0), 0);

        let ltk = [0xFFu8; 16];
        let cipher = crate::crypto::SoftAes;
        let skdm = [0x11u8; 8];
        let ivm = [0x22u8; 4];

        let enc_req = match master.start_encryption([0; 8], 0, skdm, ivm).unwrap() {
            ControlPdu::EncReq(req) => req,
            other => panic!("unexpected: {:?}", other),
        };

        slave
            .process_control_pdu(&ControlPdu::EncReq(enc_req), 27)
            .unwrap();

        let skds = [0x33u8; 8];
        let ivs = [0x44u8; 4];
        let enc_rsp = match slave.accept_encryption_request(skds, ivs).unwrap() {
            ControlPdu::EncRsp(rsp) => rsp,
            other => panic!("unexpected: {:?}", other),
        };

        master
            .process_control_pdu(&ControlPdu::EncRsp(enc_rsp), 27)
            .unwrap();

        let master_material = master.pending_encryption_material().unwrap();
        let slave_material = slave.pending_encryption_material().unwrap();
        assert_eq!(master_material.skdm, slave_material.skdm);
        assert_eq!(master_material.skds, slave_material.skds);

        let master_key = Connection::<TestConfig>::derive_session_key(
            &cipher,
            &ltk,
            master_material.skdm,
            master_material.skds,
        );
        let slave_key =
            Connection::<TestConfig>::derive_session_key(&cipher, &ltk, slave_material.skdm, slave_material.skds);
        assert_eq!(master_key, slave_key);

        master.prepare_session_keys(SessionKeys::for_master(master_key, master_material.ivm, master_material.ivs));
        slave.prepare_session_keys(SessionKeys::for_slave(slave_key, slave_material.ivm, slave_material.ivs));

        let start_req = StartEncReq::new();
        master
            .process_control_pdu(&ControlPdu::StartEncReq(start_req), 27)
            .unwrap();
        slave
            .process_control_pdu(&ControlPdu::StartEncReq(start_req), 27)
            .unwrap();

        assert!(master.is_encrypted());
        assert!(slave.is_encrypted());
        assert!(!master.outer().is_active());
        assert!(!slave.outer().is_active());
    }

    struct TestTimer;
    impl crate::time::Timer for TestTimer {
        fn now(&self) -> Instant {
            Instant::from_raw_micros(0)
        }
    }

    struct TestRng(u32);
    impl crate::config::Rng for TestRng {
        fn next_u32(&mut self) -> u32 {
            self.0 = self.0.wrapping_add(1);
            self.0
        }
    }

    struct TestTransmitter {
        buf: [u8; crate::link::MIN_PAYLOAD_BUF],
    }

    impl crate::link::Transmitter for TestTransmitter {
        fn tx_payload_buf(&mut self) -> &mut [u8] {
            &mut self.buf
        }

        fn transmit_advertising(
            &mut self,
            _header: crate::link::advertising::Header,
            _channel: crate::phy::AdvertisingChannel,
        ) {
        }

        fn transmit_data(
            &mut self,
            _access_address: u32,
            _crc_iv: u32,
            _header: crate::link::data::Header,
            _channel: DataChannel,
        ) {
        }
    }

    enum TestConfig {}

    impl Config for TestConfig {
        type Timer = TestTimer;
        type Transmitter = TestTransmitter;
        type PacketQueue = &'static mut crate::link::queue::SimpleQueue;
        type Rng = TestRng;
        type BlockCipher = crate::crypto::SoftAes;
    }
}
