//! The minimal advertising-channel PDU surface needed to establish a connection.
//!
//! Scan request/response content, `AD_STRUCTURE` payloads, and legacy/extended advertising PDU
//! variants beyond `CONNECT_REQ` are out of scope for this crate; see the crate-level
//! documentation for the rationale. This module only covers enough of the advertising channel
//! PDU header and the `CONNECT_REQ` payload (`LLData`) to hand a freshly created connection its
//! starting parameters.

use crate::{
    bytes::{ByteReader, FromBytes},
    link::device_address::{AddressKind, DeviceAddress},
    phy::ChannelMap,
    time::Duration,
    Error,
};

/// PDU type field of an advertising channel PDU header (`spec.md` §6).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PduType {
    AdvInd,
    AdvDirectInd,
    AdvNonconnInd,
    ScanReq,
    ScanRsp,
    AdvScanInd,
    ConnectReq,
    Other(u8),
}

impl From<u8> for PduType {
    fn from(raw: u8) -> Self {
        match raw & 0x0F {
            0x0 => PduType::AdvInd,
            0x1 => PduType::AdvDirectInd,
            0x2 => PduType::AdvNonconnInd,
            0x3 => PduType::ScanReq,
            0x4 => PduType::ScanRsp,
            0x6 => PduType::AdvScanInd,
            0x5 => PduType::ConnectReq,
            other => PduType::Other(other),
        }
    }
}

/// 16-bit advertising channel PDU header.
#[derive(Debug, Copy, Clone)]
pub struct Header {
    pdu_type: PduType,
    tx_add_random: bool,
    rx_add_random: bool,
    payload_length: u8,
}

impl Header {
    pub fn pdu_type(&self) -> PduType {
        self.pdu_type
    }

    pub fn payload_length(&self) -> u8 {
        self.payload_length
    }

    pub fn advertiser_address_kind(&self) -> AddressKind {
        if self.tx_add_random {
            AddressKind::Random
        } else {
            AddressKind::Public
        }
    }

    pub fn initiator_address_kind(&self) -> AddressKind {
        if self.rx_add_random {
            AddressKind::Random
        } else {
            AddressKind::Public
        }
    }
}

impl<'a> FromBytes<'a> for Header {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let raw = bytes.read_u16_le()?;
        Ok(Header {
            pdu_type: PduType::from((raw & 0x0F) as u8),
            tx_add_random: raw & (1 << 6) != 0,
            rx_add_random: raw & (1 << 7) != 0,
            payload_length: ((raw >> 8) & 0x3F) as u8,
        })
    }
}

/// `LLData` carried in a `CONNECT_REQ` advertising channel PDU, used to set up the new
/// connection's parameters.
#[derive(Debug, Copy, Clone)]
pub struct ConnectRequestData {
    init_addr: DeviceAddress,
    adv_addr: DeviceAddress,
    access_address: u32,
    crc_init: u32,
    win_size: u8,
    win_offset: u16,
    interval: u16,
    latency: u16,
    timeout: u16,
    channel_map: ChannelMap,
    hop: u8,
    sca: u8,
}

impl ConnectRequestData {
    /// Parses `InitA`, `AdvA` and `LLData` out of a `CONNECT_REQ` payload.
    ///
    /// `header` provides the address-kind bits (`TxAdd`/`RxAdd`) needed to interpret the two
    /// 6-byte addresses at the front of the payload.
    pub fn parse(header: &Header, payload: &[u8]) -> Result<Self, Error> {
        let mut bytes = ByteReader::new(payload);
        let init_addr = bytes.read_array::<[u8; 6]>()?;
        let adv_addr = bytes.read_array::<[u8; 6]>()?;
        let access_address = bytes.read_u32_le()?;
        let crc_init_lo = bytes.read_array::<[u8; 3]>()?;
        let crc_init = u32::from(crc_init_lo[0])
            | (u32::from(crc_init_lo[1]) << 8)
            | (u32::from(crc_init_lo[2]) << 16);
        let win_size = bytes.read_u8()?;
        let win_offset = bytes.read_u16_le()?;
        let interval = bytes.read_u16_le()?;
        let latency = bytes.read_u16_le()?;
        let timeout = bytes.read_u16_le()?;
        let map_raw = bytes.read_array::<[u8; 5]>()?;
        let hop_sca = bytes.read_u8()?;

        Ok(Self {
            init_addr: DeviceAddress::new(init_addr, header.initiator_address_kind()),
            adv_addr: DeviceAddress::new(adv_addr, header.advertiser_address_kind()),
            access_address,
            crc_init,
            win_size,
            win_offset,
            interval,
            latency,
            timeout,
            channel_map: ChannelMap::from_raw(map_raw),
            hop: hop_sca & 0x1F,
            sca: (hop_sca >> 5) & 0x07,
        })
    }

    pub fn initiator_address(&self) -> &DeviceAddress {
        &self.init_addr
    }

    pub fn advertiser_address(&self) -> &DeviceAddress {
        &self.adv_addr
    }

    pub fn access_address(&self) -> u32 {
        self.access_address
    }

    pub fn crc_init(&self) -> u32 {
        self.crc_init
    }

    /// Size of the transmit window for the first data channel PDU.
    pub fn win_size(&self) -> Duration {
        Duration::from_micros(u32::from(self.win_size) * 1_250)
    }

    /// Offset of the transmit window from the reference point (end of `CONNECT_REQ`'s RX).
    pub fn win_offset(&self) -> Duration {
        Duration::from_micros(u32::from(self.win_offset) * 1_250)
    }

    /// Latest instant at which the first data channel PDU can be expected.
    pub fn end_of_tx_window(&self) -> Duration {
        self.win_offset() + self.win_size()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_micros(u32::from(self.interval) * 1_250)
    }

    pub fn latency(&self) -> u16 {
        self.latency
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(u32::from(self.timeout) * 10)
    }

    pub fn channel_map(&self) -> &ChannelMap {
        &self.channel_map
    }

    pub fn hop(&self) -> u8 {
        self.hop
    }

    /// Index into the standard sleep-clock-accuracy ppm lookup table
    /// `{500, 250, 150, 100, 75, 50, 30, 20}`.
    pub fn sca(&self) -> u8 {
        self.sca
    }
}

/// The standard SCA ppm lookup table, indexed by the 3-bit `sca` field carried in
/// `CONNECT_REQ`.
pub const SCA_PPM_TABLE: [u16; 8] = [500, 250, 150, 100, 75, 50, 30, 20];

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> [u8; 34] {
        let mut buf = [0u8; 34];
        buf[0..6].copy_from_slice(&[1, 2, 3, 4, 5, 6]); // InitA
        buf[6..12].copy_from_slice(&[0x5A, 0x92, 0x04, 0x26, 0xC6, 0x88]); // AdvA
        buf[12..16].copy_from_slice(&0x1234_5678u32.to_le_bytes()); // AA
        buf[16..19].copy_from_slice(&[0x01, 0x02, 0x03]); // CRCInit
        buf[19] = 6; // WinSize
        buf[20..22].copy_from_slice(&2u16.to_le_bytes()); // WinOffset
        buf[22..24].copy_from_slice(&6u16.to_le_bytes()); // Interval
        buf[24..26].copy_from_slice(&0u16.to_le_bytes()); // Latency
        buf[26..28].copy_from_slice(&100u16.to_le_bytes()); // Timeout
        buf[28..33].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF, 0x1F]); // ChM (all 37 used)
        buf[33] = 5 | (3 << 5); // Hop=5, SCA=3
        buf
    }

    #[test]
    fn parses_connect_req() {
        let header = Header {
            pdu_type: PduType::ConnectReq,
            tx_add_random: false,
            rx_add_random: false,
            payload_length: 34,
        };
        let data = ConnectRequestData::parse(&header, &sample_payload()).unwrap();
        assert_eq!(data.access_address(), 0x1234_5678);
        assert_eq!(data.crc_init(), 0x03_02_01);
        assert_eq!(data.hop(), 5);
        assert_eq!(data.sca(), 3);
        assert_eq!(data.channel_map().num_used_channels(), 37);
    }
}
