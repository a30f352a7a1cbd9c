//! Modbus protocol constants from the official specification.
//!
//! Frame size limits are inherited from the RS485 ADU limit of 256 bytes;
//! per-function quantity limits are derived from the resulting maximum PDU
//! size of 253 bytes.

// ============================================================================
// Frame size constants
// ============================================================================

/// Maximum RTU ADU length: unit ID (1) + PDU (253) + CRC (2).
pub const MAX_RTU_FRAME_LEN: usize = 256;

/// CRC trailer length on RTU frames.
pub const CRC_LEN: usize = 2;

/// MBAP header length for TCP.
/// Transaction ID (2) + Protocol ID (2) + Length (2) + Unit ID (1).
pub const MBAP_HEADER_LEN: usize = 7;

/// Minimum value of the MBAP length field: unit ID + function code.
pub const MIN_MBAP_LENGTH: usize = 2;

/// Maximum value of the MBAP length field: unit ID (1) + max PDU (253).
pub const MAX_MBAP_LENGTH: usize = 254;

/// Maximum TCP ADU length: MBAP header + function code + payload.
pub const MAX_TCP_FRAME_LEN: usize = MBAP_HEADER_LEN - 1 + MAX_MBAP_LENGTH;

// ============================================================================
// Quantity limits
// ============================================================================

/// Maximum coils per FC01/FC02 read.
/// The response packs one coil per bit: 1 + 1 + ceil(N / 8) <= 253.
pub const MAX_READ_COILS: u16 = 2000;

/// Maximum coils per FC15 write (0x7B0).
pub const MAX_WRITE_COILS: u16 = 1968;

/// Maximum registers per FC03/FC04 read.
/// The response carries two bytes per register: 1 + 1 + 2 * N <= 253.
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum registers per FC16 write: 1 + 2 + 2 + 1 + 2 * N <= 253.
pub const MAX_WRITE_REGISTERS: u16 = 123;

// ============================================================================
// Function codes
// ============================================================================

/// Read Coils (FC01)
pub const FC_READ_COILS: u8 = 0x01;

/// Read Discrete Inputs (FC02)
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Read Input Registers (FC04)
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

/// Write Single Coil (FC05)
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Write Multiple Coils (FC15)
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;

/// Write Multiple Registers (FC16)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Mask Write Register (FC22). Only present in the RTU response length
/// table; the server does not dispatch it.
pub const FC_MASK_WRITE_REGISTER: u8 = 0x16;

/// Bit set on the function code of an exception response.
pub const EXCEPTION_BIT: u8 = 0x80;

// ============================================================================
// Exception codes
// ============================================================================

/// Illegal Function (0x01)
pub const EX_ILLEGAL_FUNCTION: u8 = 0x01;

/// Illegal Data Address (0x02)
pub const EX_ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// Illegal Data Value (0x03)
pub const EX_ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Server Device Failure (0x04)
pub const EX_SERVER_DEVICE_FAILURE: u8 = 0x04;

/// Server Device Busy (0x06)
pub const EX_SERVER_DEVICE_BUSY: u8 = 0x06;

/// Gateway Path Unavailable (0x0A)
pub const EX_GATEWAY_PATH_UNAVAILABLE: u8 = 0x0A;

/// Gateway Target Device Failed To Respond (0x0B)
pub const EX_GATEWAY_TARGET_FAILED_TO_RESPOND: u8 = 0x0B;

// ============================================================================
// Field values
// ============================================================================

/// FC05 value field for switching a coil on.
pub const COIL_ON: u16 = 0xFF00;

/// FC05 value field for switching a coil off.
pub const COIL_OFF: u16 = 0x0000;
