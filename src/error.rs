use core::fmt;

/// Errors returned by the Link-Layer core.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Packet specified an invalid length value or was too short.
    ///
    /// This indicates a protocol violation, so the connection should be considered lost (if one
    /// is currently established).
    InvalidLength,

    /// Invalid value supplied for field.
    InvalidValue,

    /// Unexpectedly reached EOF while reading or writing data.
    ///
    /// Returned when the application tries to fit too much data into a PDU or other fixed-size
    /// buffer, and also when reaching EOF prematurely while reading data from a buffer.
    Eof,

    /// Parsing didn't consume the entire buffer.
    IncompleteParse,

    /// No connection exists for the given handle.
    UnknownHandle,

    /// An LL Control Procedure of the same outer type is already in progress on this connection.
    ProcedureAlreadyActive,

    /// The global connection-parameter-update mutex is held by a different connection.
    ConnUpdateMutexBusy,

    /// A pool (RX, TX, or connection) has no free nodes/slots left.
    OutOfMemory,

    /// A requested value is outside the range allowed by the Bluetooth Core spec.
    ValueOutOfRange,
}

impl Error {
    /// Maps this error onto the closest standard HCI error code.
    ///
    /// This is provided for callers that bridge this core to a real HCI transport; HCI command
    /// parsing itself is out of scope for this crate.
    pub fn to_hci_status(self) -> u8 {
        match self {
            Error::UnknownHandle => 0x02,         // Unknown Connection Identifier
            Error::ProcedureAlreadyActive => 0x1A, // Unsupported Remote Feature / LMP collision-ish
            Error::ConnUpdateMutexBusy => 0x21,    // Different Transaction Collision
            Error::ValueOutOfRange => 0x12,        // Invalid HCI Command Parameters
            Error::OutOfMemory => 0x07,            // Memory Capacity Exceeded
            Error::InvalidLength
            | Error::InvalidValue
            | Error::Eof
            | Error::IncompleteParse => 0x12,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::InvalidLength => "invalid length value specified",
            Error::InvalidValue => "invalid value for field",
            Error::Eof => "end of buffer",
            Error::IncompleteParse => "excess data in buffer",
            Error::UnknownHandle => "unknown connection handle",
            Error::ProcedureAlreadyActive => "LL control procedure already active",
            Error::ConnUpdateMutexBusy => "conn_upd mutex held by another connection",
            Error::OutOfMemory => "pool exhausted",
            Error::ValueOutOfRange => "value out of allowed range",
        })
    }
}

/// Standard Bluetooth HCI reason/error codes used when tearing down a connection.
///
/// Only the subset actually emitted by this controller core is listed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum TerminateReason {
    AuthenticationFailure = 0x05,
    SupervisionTimeout = 0x08,
    RemoteUserTerminated = 0x13,
    RemoteLowResources = 0x14,
    RemotePowerOff = 0x15,
    LocalHostTerminated = 0x16,
    UnsupportedRemoteFeature = 0x1A,
    PairingWithUnitKeyNotSupported = 0x29,
    DifferentTransactionCollision = 0x2A,
    ConnectionFailedToEstablish = 0x3E,
    MicFailure = 0x3D,
    LlResponseTimeout = 0x22,
}

impl TerminateReason {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Maps a peer-supplied `TERMINATE_IND` reason onto the reason the host observes.
    ///
    /// The Core spec requires remapping `0x13` (remote user terminated, a value that is only
    /// meaningful when *we* terminate) to `0x16` when the *peer* used it against us.
    pub fn remap_peer_reason(raw: u8) -> u8 {
        if raw == TerminateReason::RemoteUserTerminated as u8 {
            TerminateReason::LocalHostTerminated as u8
        } else {
            raw
        }
    }
}
