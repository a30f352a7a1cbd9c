//! # Voltage Modbus Server
//!
//! An async Modbus server (slave) library supporting RTU over serial links
//! and MBAP over TCP, built on Tokio.
//!
//! The protocol engine is transport-agnostic: both transports decode frames
//! into [`Pdu`]s, the server validates each request against the
//! per-function-code rules of the Modbus application protocol, dispatches it
//! to a user-supplied [`RequestHandler`] and writes back a conformant
//! response or exception.
//!
//! ## Features
//!
//! - **RTU framing**: length inference from the function code, CRC-16
//!   validation, inter-frame delay handling, shared-bus unit ID filtering
//! - **Modbus TCP**: MBAP header validation and transaction ID echo
//! - **Bounded concurrency**: one worker per TCP client, capped by
//!   `max_clients`; one dedicated worker per RTU link
//! - **Handler seam**: a single synchronous trait covering all four data
//!   tables, with [`RegisterBank`] as a ready-made in-memory implementation
//!
//! ## Supported function codes
//!
//! | Code | Function |
//! |------|----------|
//! | 0x01 | Read Coils |
//! | 0x02 | Read Discrete Inputs |
//! | 0x03 | Read Holding Registers |
//! | 0x04 | Read Input Registers |
//! | 0x05 | Write Single Coil |
//! | 0x06 | Write Single Register |
//! | 0x0F | Write Multiple Coils |
//! | 0x10 | Write Multiple Registers |
//!
//! Anything else is answered with an Illegal Function exception.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_modbus_server::{ModbusResult, ModbusServer, RegisterBank, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let bank = Arc::new(RegisterBank::new());
//!     bank.set_holding_register(0, 0x1234);
//!
//!     let conf = ServerConfig {
//!         url: "tcp://0.0.0.0:502".to_string(),
//!         ..Default::default()
//!     };
//!     let server = ModbusServer::new(conf, bank)?;
//!     server.start().await?;
//!
//!     // serve until the process is told to exit
//!     std::future::pending::<()>().await;
//!     server.stop().await
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Error types and exception code mapping
pub mod error;

/// Modbus protocol constants
pub mod constants;

/// Modbus CRC-16 engine
pub mod crc;

/// Big-endian word codec and coil bit packing
pub mod codec;

/// Transport-independent PDU type
pub mod pdu;

/// RTU and TCP transports
pub mod transport;

/// In-memory register bank handler
pub mod bank;

/// Server engine and lifecycle
pub mod server;

// ============================================================================
// Re-exports for convenience
// ============================================================================

pub use bank::RegisterBank;
pub use constants::*;
pub use crc::Crc16;
pub use error::{ModbusError, ModbusResult};
pub use pdu::Pdu;
pub use server::{ModbusServer, Parity, RequestHandler, ServerConfig, ServerStats};
pub use transport::{RtuTransport, TcpTransport, Transport};
