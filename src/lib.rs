//! A Bluetooth Low Energy Link-Layer controller.
//!
//! Implements the connection-event scheduling, LLCP procedure engine and channel selection of
//! the BLE Link Layer, targeting the Bluetooth Core Specification v5.1. Like its ancestor, this
//! crate is runtime and hardware-agnostic: it needs no RTOS, and the only hardware-facing pieces
//! are the traits in [`config`] and [`link::Transmitter`], which a platform implements once per
//! supported radio.
//!
//! # Using the stack
//!
//! Implement [`config::Config`] for a type that wires up your platform's [`time::Timer`],
//! [`link::Transmitter`], [`link::queue::PacketQueue`], [`config::Rng`] and [`config::BlockCipher`],
//! then drive a [`link::Controller<C>`] from your radio's interrupt handler and a periodic
//! scheduler tick ([`ticker`], [`scheduler`]).

#![no_std]

#[macro_use]
mod log;
#[macro_use]
mod utils;

pub mod bytes;
pub mod config;
pub mod crypto;
mod error;
pub mod link;
pub mod phy;
pub mod scheduler;
pub mod ticker;
pub mod time;

pub use self::error::{Error, TerminateReason};

use self::link::llcp::VersionNumber;

/// Version of the Bluetooth Core Specification implemented by this controller.
pub const BLUETOOTH_VERSION: VersionNumber = VersionNumber::V5_1;
