//! Error types and Modbus exception code mapping.
//!
//! `ModbusError` covers configuration, framing, protocol and handler-level
//! failures. Handler errors are translated into one-byte Modbus exception
//! codes via [`ModbusError::exception_code`] before going on the wire.

use thiserror::Error;

use crate::constants::{
    EX_GATEWAY_PATH_UNAVAILABLE, EX_GATEWAY_TARGET_FAILED_TO_RESPOND, EX_ILLEGAL_DATA_ADDRESS,
    EX_ILLEGAL_DATA_VALUE, EX_ILLEGAL_FUNCTION, EX_SERVER_DEVICE_BUSY, EX_SERVER_DEVICE_FAILURE,
};

/// Result type used throughout the library.
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Modbus server error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModbusError {
    /// Invalid or incomplete server configuration
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// The link yielded fewer bytes than the frame required
    #[error("short frame")]
    ShortFrame,

    /// RTU frame CRC mismatch
    #[error("bad CRC")]
    BadCrc,

    /// Malformed frame or PDU
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Function code not supported by the server
    #[error("illegal function")]
    IllegalFunction,

    /// Register or coil address out of range
    #[error("illegal data address")]
    IllegalDataAddress,

    /// Request field value not allowed by the protocol
    #[error("illegal data value")]
    IllegalDataValue,

    /// The handler failed or broke its contract
    #[error("server device failure")]
    ServerDeviceFailure,

    /// The device is busy processing another command
    #[error("server device busy")]
    ServerDeviceBusy,

    /// No path to the gateway target
    #[error("gateway path unavailable")]
    GatewayPathUnavailable,

    /// The gateway target did not answer
    #[error("gateway target device failed to respond")]
    GatewayTargetDeviceFailedToRespond,

    /// An I/O deadline expired
    #[error("request timed out")]
    Timeout,

    /// Underlying link failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl ModbusError {
    /// Modbus exception code for this error, as carried in the one-byte
    /// payload of an exception response. Errors without a standard mapping
    /// collapse to Server Device Failure.
    pub fn exception_code(&self) -> u8 {
        match self {
            ModbusError::IllegalFunction => EX_ILLEGAL_FUNCTION,
            ModbusError::IllegalDataAddress => EX_ILLEGAL_DATA_ADDRESS,
            ModbusError::IllegalDataValue => EX_ILLEGAL_DATA_VALUE,
            ModbusError::ServerDeviceBusy => EX_SERVER_DEVICE_BUSY,
            ModbusError::GatewayPathUnavailable => EX_GATEWAY_PATH_UNAVAILABLE,
            ModbusError::GatewayTargetDeviceFailedToRespond => EX_GATEWAY_TARGET_FAILED_TO_RESPOND,
            _ => EX_SERVER_DEVICE_FAILURE,
        }
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => ModbusError::ShortFrame,
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ModbusError::Timeout,
            _ => ModbusError::Io(err.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ModbusError::Timeout
    }
}
