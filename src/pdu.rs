//! Transport-independent protocol data unit.

use crate::constants::EXCEPTION_BIT;

/// A Modbus PDU together with the unit ID it is addressed to.
///
/// Transports produce one per decoded frame; the server consumes it and
/// builds a fresh one for the response. For read replies the payload starts
/// with the byte count; for write requests it carries the full application
/// data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub unit_id: u8,
    pub function_code: u8,
    pub payload: Vec<u8>,
}

impl Pdu {
    /// Create a PDU from its parts.
    pub fn new(unit_id: u8, function_code: u8, payload: Vec<u8>) -> Self {
        Self {
            unit_id,
            function_code,
            payload,
        }
    }

    /// Build an exception response for `function_code` carrying
    /// `exception_code` as its single payload byte.
    pub fn exception(unit_id: u8, function_code: u8, exception_code: u8) -> Self {
        Self {
            unit_id,
            function_code: function_code | EXCEPTION_BIT,
            payload: vec![exception_code],
        }
    }

    /// Whether the exception bit is set on the function code.
    pub fn is_exception(&self) -> bool {
        self.function_code & EXCEPTION_BIT != 0
    }

    /// The exception code of an exception response, if any.
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() {
            self.payload.first().copied()
        } else {
            None
        }
    }
}
