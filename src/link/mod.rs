//! Link-Layer: connection scheduling and the controller that owns every live connection.
//!
//! This module ties together event timing ([`crate::ticker`], [`crate::scheduler`]), the LLCP
//! procedure engine ([`llcp_engine`]), and the RX/TX pools ([`pool`]) behind a single
//! [`Controller`] type, generalizing the reference controller's `LinkLayer<C>` (one
//! `State::Connection` at a time) into a multi-connection owner struct, per this crate's Design
//! Notes on replacing the single-connection state machine with a pool-backed one.

pub mod advertising;
mod comp_id;
pub mod connection;
pub mod data;
mod device_address;
pub mod features;
pub mod llcp;
pub mod llcp_engine;
pub mod pool;
pub mod queue;
mod seq_num;

pub use self::comp_id::CompanyId;
pub use self::connection::{Connection, Role};
pub use self::device_address::{AddressKind, DeviceAddress};
pub use self::features::FeatureSet;
pub use self::seq_num::SeqNum;

use heapless::consts::{U4, U8};
use heapless::Vec;

use crate::config::{Config, ControllerConfig};
use crate::error::TerminateReason;
use crate::link::advertising::ConnectRequestData;
use crate::link::connection::ConnMetaEvent;
use crate::link::llcp_engine::{ConnUpdateMutex, TerminateState};
use crate::link::pool::{ConnHandle, FlowControlMutex, NodeIndex, RxPool, TerminatePool, TxPool};
use crate::phy::DataChannel;
use crate::time::{Duration, Instant, Timer};
use crate::Error;

/// The CRC polynomial to use for CRC24 generation.
///
/// The CRC should be computed only over the PDU, and is transmitted MSb first, unlike every other
/// field in the packet.
///
/// Written out, the polynomial is: `x^24 + x^10 + x^9 + x^6 + x^4 + x^3 + x + 1`.
pub const CRC_POLY: u32 = 0b00000001_00000000_00000110_01011011;

/// Min. size a data PDU payload buffer must have (assuming only the pre-DLE PDU size).
pub const MIN_DATA_PAYLOAD_BUF: usize = 27;

/// Max. octets this controller will ever negotiate per data PDU payload via Data Length
/// Extension (Core Spec 5.1 `supportedMaxTxOctets`/`supportedMaxRxOctets`).
pub const MAX_DATA_PAYLOAD_BUF: usize = 251;

/// Size of the data channel PDU header (LLID/NESN/SN/MD flags plus length), subtracted from a
/// pool node's total size to get the payload octets available to DLE negotiation.
pub const DATA_PDU_HEADER_LEN: usize = 2;

/// Min. size a data PDU buffer must have: payload plus the 2-byte data channel header.
pub const MIN_DATA_PDU_BUF: usize = MIN_DATA_PAYLOAD_BUF + DATA_PDU_HEADER_LEN;

/// Min. size an advertising PDU payload buffer must have.
pub const MIN_PAYLOAD_BUF: usize = 37;

/// Min. size a Link-Layer PDU buffer must have to cover both advertising and data channels.
pub const MIN_PDU_BUF: usize = MIN_PAYLOAD_BUF + 2;

/// Min. size a buffer for Link-Layer packets must have: preamble, access address, PDU, CRC.
pub const MIN_PACKET_BUF: usize = 1 + 4 + MIN_PDU_BUF + 3;

/// Max. simultaneous connections a [`Controller`] can track, bounding the fixed-capacity
/// connection vector.
pub const MAX_CONNECTIONS: usize = 4;

/// Trait for the BLE packet transmitter (radio), generalized from the reference controller's
/// `Transmitter` to also expose the buffer the Link-Layer fills with an outgoing data channel
/// PDU before calling `transmit_data`.
pub trait Transmitter {
    /// Returns a buffer that the Link-Layer can use to build the PDU to transmit.
    ///
    /// The buffer must be at least `MIN_PAYLOAD_BUF` bytes, and should be at least
    /// `MIN_DATA_PAYLOAD_BUF` bytes larger once Data Length Extension has been negotiated.
    fn tx_payload_buf(&mut self) -> &mut [u8];

    /// Transmits an advertising channel PDU using the data in the buffer returned by
    /// [`Transmitter::tx_payload_buf`].
    fn transmit_advertising(&mut self, header: crate::link::advertising::Header, channel: crate::phy::AdvertisingChannel);

    /// Transmits a data channel PDU using the data in the buffer returned by
    /// [`Transmitter::tx_payload_buf`].
    fn transmit_data(&mut self, access_address: u32, crc_iv: u32, header: crate::link::data::Header, channel: DataChannel);
}

/// Tells the surrounding code what to do after a Link-Layer event.
///
/// Returned from every [`Controller`] entry point that runs on the real-time (radio ISR) side.
#[derive(Debug)]
#[must_use]
pub struct Cmd {
    /// What the radio should do until the next scheduled update.
    pub radio: RadioCmd,

    /// When [`Controller`] should be polled again, if at all.
    pub next_update: NextUpdate,

    /// Whether non-real-time work (an RX packet to dequeue, a control PDU to hand to the host)
    /// is now pending.
    pub queued_work: bool,
}

/// Specifies when the Link-Layer's ticker-driven update function should be called again.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NextUpdate {
    /// No further update needed; disable the ticker for this handle.
    Disable,

    /// Leave the next update time unchanged.
    Keep,

    /// Call the update function when `Instant` is reached.
    At(Instant),
}

/// Instructs the radio what to do until the next Link-Layer update.
#[derive(Debug)]
pub enum RadioCmd {
    /// Turn the radio off.
    Off,

    /// Listen for advertising channel PDUs on `channel`.
    ListenAdvertising { channel: crate::phy::AdvertisingChannel },

    /// Listen for data channel PDUs on `channel`, transmitted using `access_address` and whose
    /// CRC is initialized with `crc_init`. If no valid packet is received for `timeout`, the
    /// radio should stop listening (supervision timeout).
    ListenData {
        channel: DataChannel,
        access_address: u32,
        crc_init: u32,
        timeout: Duration,
    },
}

/// A host-facing LLCP meta event, tagged with the connection it came from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MetaEvent {
    pub handle: ConnHandle,
    pub event: ConnMetaEvent,
}

/// A connection that has fully completed termination (our `TERMINATE_IND` acked, or the peer's
/// received and remapped) and has a reserved RX node ready to carry the disconnect notice to the
/// host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TerminationEvent {
    pub handle: ConnHandle,
    pub reason: u8,
    pub node: NodeIndex,
}

/// Owns every live connection plus the shared pools and mutexes a complete BLE peripheral
/// controller needs, generalizing the reference controller's single `LinkLayer<C>` +
/// `State::Connection` slot into a pool of up to [`MAX_CONNECTIONS`] connections.
pub struct Controller<C: Config> {
    dev_addr: DeviceAddress,
    timer: C::Timer,
    connections: Vec<Connection<C>, U4>,
    rx_pool: RxPool,
    tx_pool: TxPool,
    flow_control: FlowControlMutex,
    conn_upd_mutex: ConnUpdateMutex,
    terminate_pool: TerminatePool,
    meta_events: Vec<MetaEvent, U8>,
    next_handle: u8,
    config: ControllerConfig,
}

impl<C: Config> Controller<C> {
    /// Creates a new, empty controller with no live connections.
    pub fn new(dev_addr: DeviceAddress, timer: C::Timer, config: ControllerConfig) -> Self {
        trace!("new Controller, dev={:?}", dev_addr);
        Self {
            dev_addr,
            timer,
            connections: Vec::new(),
            rx_pool: RxPool::new(config.rx_pool_count, config.default_data_length as usize),
            tx_pool: TxPool::new(config.tx_pool_count / 2, config.tx_pool_count / 2),
            flow_control: FlowControlMutex::new(),
            conn_upd_mutex: ConnUpdateMutex::new(),
            terminate_pool: TerminatePool::new(config.max_connections),
            meta_events: Vec::new(),
            next_handle: 0,
            config,
        }
    }

    pub fn device_address(&self) -> &DeviceAddress {
        &self.dev_addr
    }

    pub fn timer(&mut self) -> &mut C::Timer {
        &mut self.timer
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection(&self, handle: ConnHandle) -> Option<&Connection<C>> {
        self.connections.iter().find(|c| c.handle() == handle)
    }

    pub fn connection_mut(&mut self, handle: ConnHandle) -> Option<&mut Connection<C>> {
        self.connections.iter_mut().find(|c| c.handle() == handle)
    }

    /// Establishes a new connection from a parsed `CONNECT_REQ`, if a connection slot and the
    /// RX/TX pools have room.
    ///
    /// `anchor` is the instant at which the first connection event's reference point falls,
    /// typically the end of the `CONNECT_REQ` reception.
    pub fn create_connection(&mut self, data: &ConnectRequestData, anchor: Instant) -> Result<ConnHandle, Error> {
        if self.connections.len() >= self.connections.capacity() || self.connections.len() >= self.config.max_connections as usize {
            return Err(Error::OutOfMemory);
        }
        let handle = ConnHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);
        let local_sca_ppm = u32::from(crate::link::advertising::SCA_PPM_TABLE[self.config.local_sca as usize]);
        let conn = Connection::create(data, handle, anchor, local_sca_ppm);
        self.connections
            .push(conn)
            .map_err(|_| Error::OutOfMemory)?;
        Ok(handle)
    }

    /// Removes a connection immediately (used once a `TERMINATE_IND` round trip, or a
    /// supervision timeout, has been fully processed).
    pub fn remove_connection(&mut self, handle: ConnHandle) {
        if let Some(pos) = self.connections.iter().position(|c| c.handle() == handle) {
            self.connections.swap_remove(pos);
            self.flow_control.release(handle);
        }
    }

    /// Requests termination of `handle` from the host side.
    pub fn terminate(&mut self, handle: ConnHandle, reason: TerminateReason) -> Result<(), Error> {
        self.connection_mut(handle)
            .ok_or(Error::UnknownHandle)?
            .request_termination(reason);
        Ok(())
    }

    /// Polls every connection for a supervision timeout, returning the handles that have gone
    /// silent for longer than their negotiated `connSupervisionTimeout`.
    pub fn poll_supervision_timeouts(&mut self, now: Instant) -> Vec<ConnHandle, U4> {
        let mut expired = Vec::new();
        for conn in self.connections.iter() {
            if conn.supervision_expired(now) {
                let _ = expired.push(conn.handle());
            }
        }
        expired
    }

    /// Acquires the global connection-parameter-update mutex for `handle`, returning
    /// `Err(Error::ConnUpdateMutexBusy)` if another connection currently holds it
    /// (`spec.md` §4.5.5's collision rule).
    pub fn acquire_conn_update_mutex(&mut self, handle: ConnHandle) -> Result<(), Error> {
        self.conn_upd_mutex.try_acquire(handle.0)
    }

    pub fn release_conn_update_mutex(&mut self, handle: ConnHandle) {
        self.conn_upd_mutex.release(handle.0);
    }

    /// Dispatches a received LLCP control PDU to `handle`'s connection, acquiring the global
    /// connection-update mutex first for the procedures that need it
    /// (`CONNECTION_UPDATE_REQ`/`CHANNEL_MAP_REQ`/`CONNECTION_PARAM_REQ`, per `spec.md` §4.5.5's
    /// collision rule) and releasing it once the connection's outer procedure slot frees up.
    /// Returns the response to transmit, if any. Any meta event the PDU completes is queued for
    /// [`Controller::drain_meta_events`].
    pub fn on_control_pdu(&mut self, handle: ConnHandle, pdu: &llcp::ControlPdu) -> Result<Option<llcp::ControlPdu>, Error> {
        let needs_mutex = matches!(
            pdu,
            llcp::ControlPdu::ConnectionUpdateReq(_)
                | llcp::ControlPdu::ChannelMapReq(_)
                | llcp::ControlPdu::ConnectionParamReq(_)
        );
        if needs_mutex && self.conn_upd_mutex.try_acquire(handle.0).is_err() {
            return Ok(Some(llcp::ControlPdu::RejectIndExt(llcp::RejectIndExt::new(
                pdu.opcode(),
                llcp_engine::REJECT_DIFFERENT_TRANSACTION_COLLISION,
            ))));
        }
        let rx_pool_octets = self.rx_octets_capacity();
        let conn = self.connection_mut(handle).ok_or(Error::UnknownHandle)?;
        let (response, meta) = conn.process_control_pdu(pdu, rx_pool_octets)?;
        let mutex_released = !conn.outer().is_active();
        if mutex_released {
            self.conn_upd_mutex.release(handle.0);
        }
        if let Some(event) = meta {
            self.push_meta_event(handle, event);
        }
        Ok(response)
    }

    /// Checks every connection's pending connection-update/channel-map instant, applying it if
    /// reached and releasing the connection-update mutex for any connection whose outer
    /// procedure slot frees up as a result. Call once per Link-Layer event tick. Any completed
    /// update queues a meta event for [`Controller::drain_meta_events`].
    pub fn poll_instants(&mut self) {
        let mut completed: Vec<(ConnHandle, ConnMetaEvent), U4> = Vec::new();
        for conn in self.connections.iter_mut() {
            if let Some(event) = conn.poll_instant() {
                let _ = completed.push((conn.handle(), event));
            }
            if !conn.outer().is_active() {
                self.conn_upd_mutex.release(conn.handle().0);
            }
        }
        for (handle, event) in completed {
            self.push_meta_event(handle, event);
        }
    }

    /// Once the shared RX pool is idle, grows it to fit the largest pending DLE resize among
    /// connections waiting on one, then finalizes every such connection, returning the deferred
    /// `LENGTH_RSP`s to transmit (`spec.md` §4.6/§5's pool re-initialisation rule).
    pub fn poll_length_resizes(&mut self) -> Vec<(ConnHandle, llcp::ControlPdu), U4> {
        let mut responses = Vec::new();
        if !self.rx_pool.is_idle() {
            return responses;
        }
        let target = self
            .connections
            .iter()
            .filter_map(|c| c.pending_length_resize())
            .max();
        let target = match target {
            Some(t) => t,
            None => return responses,
        };
        self.rx_pool.resize(usize::from(target) + DATA_PDU_HEADER_LEN);

        let mut completed: Vec<(ConnHandle, Option<llcp::ControlPdu>, ConnMetaEvent), U4> = Vec::new();
        for conn in self.connections.iter_mut() {
            if conn.pending_length_resize().is_some() {
                let (rsp, meta) = conn.complete_length_resize();
                let _ = completed.push((conn.handle(), rsp, meta));
            }
        }
        for (handle, rsp, meta) in completed {
            self.push_meta_event(handle, meta);
            if let Some(rsp) = rsp {
                let _ = responses.push((handle, rsp));
            }
        }
        responses
    }

    /// Collects every connection whose termination procedure has fully completed (our
    /// `TERMINATE_IND` acked, or the peer's received) and has a free reserved node to carry the
    /// disconnect notice, removing each such connection from the controller.
    pub fn poll_terminations(&mut self) -> Vec<TerminationEvent, U4> {
        let mut events = Vec::new();
        let mut handles: Vec<(ConnHandle, u8), U4> = Vec::new();
        for conn in self.connections.iter() {
            match conn.terminate_state() {
                TerminateState::Acked(reason) => {
                    let _ = handles.push((conn.handle(), reason.code()));
                }
                TerminateState::PeerRequested(reason) => {
                    let _ = handles.push((conn.handle(), reason));
                }
                _ => {}
            }
        }
        for (handle, reason) in handles {
            if let Some(node) = self.terminate_pool.alloc() {
                let _ = events.push(TerminationEvent { handle, reason, node });
                self.remove_connection(handle);
            }
        }
        events
    }

    /// Returns a reserved terminate node to the pool once the host has dequeued its disconnect
    /// notice.
    pub fn free_terminate_node(&mut self, node: NodeIndex) {
        self.terminate_pool.free(node);
    }

    /// Builds the radio command to listen for the next data channel PDU on `handle`, widening
    /// the listen timeout by the connection's accumulated receive window widening
    /// (`spec.md` §4.4).
    pub fn next_listen_cmd(&self, handle: ConnHandle) -> Option<RadioCmd> {
        let conn = self.connection(handle)?;
        let events = conn.events();
        Some(RadioCmd::ListenData {
            channel: events.channel(),
            access_address: conn.access_address(),
            crc_init: conn.crc_init(),
            timeout: Duration::T_IFS + events.window_widening(),
        })
    }

    fn rx_octets_capacity(&self) -> u16 {
        self.rx_pool.node_size().saturating_sub(DATA_PDU_HEADER_LEN) as u16
    }

    fn push_meta_event(&mut self, handle: ConnHandle, event: ConnMetaEvent) {
        let _ = self.meta_events.push(MetaEvent { handle, event });
    }

    /// Drains every meta event queued since the last call, for the host to turn into LE Meta
    /// Event HCI packets.
    pub fn drain_meta_events(&mut self) -> Vec<MetaEvent, U8> {
        core::mem::replace(&mut self.meta_events, Vec::new())
    }

    pub fn rx_pool(&mut self) -> &mut RxPool {
        &mut self.rx_pool
    }

    pub fn tx_pool(&mut self) -> &mut TxPool {
        &mut self.tx_pool
    }

    pub fn flow_control(&mut self) -> &mut FlowControlMutex {
        &mut self.flow_control
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::{ByteReader, FromBytes};
    use crate::config::{ControllerConfig, Rng};
    use crate::crypto::SoftAes;
    use crate::link::advertising::{ConnectRequestData, Header as AdvHeader};
    use crate::link::data::{Header as DataHeader, Llid};
    use crate::link::device_address::{AddressKind, DeviceAddress};
    use crate::link::llcp::{ConnectionParamReq, ControlPdu};
    use crate::link::queue::SimpleQueue;
    use crate::time::Timer;

    #[test]
    fn constants_match_core_spec_limits() {
        assert_eq!(MIN_DATA_PDU_BUF, 29);
        assert_eq!(MIN_PDU_BUF, 39);
        assert_eq!(MIN_PACKET_BUF, 47);
    }

    fn sample_connect_request() -> ConnectRequestData {
        // Interval 6 * 1.25ms = 7.5ms, supervision timeout 100 * 10ms = 1s.
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
        let header = AdvHeader::from_bytes(&mut reader).unwrap();
        ConnectRequestData::parse(&header, &buf).unwrap()
    }

    struct TestTimer;
    impl Timer for TestTimer {
        fn now(&self) -> Instant {
            Instant::from_raw_micros(0)
        }
    }

    struct TestRng(u32);
    impl Rng for TestRng {
        fn next_u32(&mut self) -> u32 {
            self.0 = self.0.wrapping_add(1);
            self.0
        }
    }

    struct TestTransmitter {
        buf: [u8; MIN_PAYLOAD_BUF],
    }

    impl Transmitter for TestTransmitter {
        fn tx_payload_buf(&mut self) -> &mut [u8] {
            &mut self.buf
        }

        fn transmit_advertising(&mut self, _header: advertising::Header, _channel: crate::phy::AdvertisingChannel) {}

        fn transmit_data(&mut self, _access_address: u32, _crc_iv: u32, _header: data::Header, _channel: DataChannel) {}
    }

    enum TestConfig {}

    impl Config for TestConfig {
        type Timer = TestTimer;
        type Transmitter = TestTransmitter;
        type PacketQueue = &'static mut SimpleQueue;
        type Rng = TestRng;
        type BlockCipher = SoftAes;
    }

    fn new_controller(max_connections: u8) -> Controller<TestConfig> {
        let dev_addr = DeviceAddress::new([0xAA; 6], AddressKind::Public);
        let config = ControllerConfig {
            max_connections,
            ..ControllerConfig::default()
        };
        Controller::<TestConfig>::new(dev_addr, TestTimer, config)
    }

    /// S1: an idle connection with no host data still alternates `SN`/`NESN` and resets the
    /// supervision timer on every received empty PDU, across 10 consecutive events.
    #[test]
    fn empty_pdu_keepalive_toggles_seq_nums_and_resets_supervision() {
        let data = sample_connect_request();
        let mut controller = new_controller(1);
        let anchor = Instant::from_raw_micros(0);
        let handle = controller.create_connection(&data, anchor).unwrap();

        let mut now = anchor;
        for i in 0..10u8 {
            let conn = controller.connection_mut(handle).unwrap();
            let mut header = DataHeader::new(Llid::DataCont);
            header.set_sn(conn.transmit_seq_num());
            header.set_nesn(conn.next_expected_seq_num() + SeqNum::ONE);
            let prev_nesn = conn.next_expected_seq_num();
            let prev_sn = conn.transmit_seq_num();

            assert!(conn.process_data_header(&header), "event {} PDU should be new", i);
            assert_eq!(conn.next_expected_seq_num(), prev_nesn + SeqNum::ONE);
            assert_eq!(conn.transmit_seq_num(), prev_sn + SeqNum::ONE);

            now = now + Duration::from_millis(7) + Duration::from_micros(500);
            conn.note_received(now);
            assert!(!conn.supervision_expired(now));
            conn.advance_event();
        }

        assert_eq!(controller.connection(handle).unwrap().events().conn_event_count(), 10);
    }

    /// S5: after 1 second (the negotiated supervision timeout) of silence, the connection is
    /// reported expired and can be torn down.
    #[test]
    fn supervision_timeout_expires_connection_after_silence() {
        let data = sample_connect_request();
        let mut controller = new_controller(1);
        let anchor = Instant::from_raw_micros(0);
        let handle = controller.create_connection(&data, anchor).unwrap();

        let almost = anchor + Duration::from_millis(999);
        assert!(controller.poll_supervision_timeouts(almost).is_empty());

        let expired_at = anchor + Duration::from_secs(1) + Duration::from_micros(1);
        let expired = controller.poll_supervision_timeouts(expired_at);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0], handle);

        controller.terminate(handle, TerminateReason::SupervisionTimeout).unwrap();
        controller.remove_connection(handle);
        assert_eq!(controller.connection_count(), 0);
    }

    /// S2-ish: a `CONNECTION_PARAM_REQ` is accepted, applied at the computed instant once the
    /// event counter catches up, and releases the connection-update mutex once applied.
    #[test]
    fn connection_param_req_applies_at_instant_and_shifts_interval() {
        let data = sample_connect_request();
        let mut controller = new_controller(1);
        let anchor = Instant::from_raw_micros(0);
        let handle = controller.create_connection(&data, anchor).unwrap();

        assert_eq!(
            controller.connection(handle).unwrap().events().conn_interval(),
            Duration::from_micros(7_500)
        );

        let mut req = ConnectionParamReq::new();
        req.set_conn_interval(Duration::from_micros(30_000), Duration::from_micros(30_000));
        req.set_slave_latency(2);

        let rsp = controller
            .on_control_pdu(handle, &ControlPdu::ConnectionParamReq(req))
            .unwrap();
        // The request is staged for host approval; no response goes out yet.
        assert!(rsp.is_none());
        assert!(controller.acquire_conn_update_mutex(ConnHandle(1)).is_err());

        let approve_rsp = controller
            .connection_mut(handle)
            .unwrap()
            .approve_connection_param_update()
            .unwrap();
        assert!(matches!(approve_rsp, ControlPdu::ConnectionParamRsp(_)));
        // instant = event_count(0) + latency(2) + 6 = 8, so the mutex stays held until then.
        assert!(controller.acquire_conn_update_mutex(ConnHandle(1)).is_err());

        for _ in 0..8 {
            controller.connection_mut(handle).unwrap().advance_event();
            controller.poll_instants();
        }

        assert_eq!(
            controller.connection(handle).unwrap().events().conn_interval(),
            Duration::from_micros(30_000)
        );
        assert!(!controller.connection(handle).unwrap().outer().is_active());
        // `poll_instants` released the mutex once the update applied; another connection can
        // now acquire it.
        assert!(controller.acquire_conn_update_mutex(ConnHandle(1)).is_ok());
    }

    /// S6: while connection A holds the connection-update mutex mid-procedure, a
    /// `CONNECTION_PARAM_REQ` from connection B is rejected with `LL_REJECT_IND_EXT` carrying
    /// the different-transaction-collision error code, and A is left untouched.
    #[test]
    fn conn_param_req_collision_rejects_second_connection() {
        let data = sample_connect_request();
        let mut controller = new_controller(2);
        let anchor = Instant::from_raw_micros(0);
        let handle_a = controller.create_connection(&data, anchor).unwrap();
        let handle_b = controller.create_connection(&data, anchor).unwrap();
        assert_ne!(handle_a, handle_b);

        let mut req_a = ConnectionParamReq::new();
        req_a.set_conn_interval(Duration::from_micros(30_000), Duration::from_micros(30_000));
        controller
            .on_control_pdu(handle_a, &ControlPdu::ConnectionParamReq(req_a))
            .unwrap();
        assert!(controller.connection(handle_a).unwrap().outer().is_active());

        let req_b = ConnectionParamReq::new();
        let rsp_b = controller
            .on_control_pdu(handle_b, &ControlPdu::ConnectionParamReq(req_b))
            .unwrap();
        match rsp_b {
            Some(ControlPdu::RejectIndExt(reject)) => {
                assert_eq!(reject.error_code(), crate::link::llcp_engine::REJECT_DIFFERENT_TRANSACTION_COLLISION);
            }
            other => panic!("unexpected response: {:?}", other),
        }
        // B never started its own procedure; A is untouched and still holds the mutex.
        assert!(!controller.connection(handle_b).unwrap().outer().is_active());
        assert!(controller.connection(handle_a).unwrap().outer().is_active());
    }
}
