//! Transport layer: RTU framing over serial links and MBAP over TCP.
//!
//! Both transports expose the same capability set through [`Transport`]:
//! read a decoded request PDU, write a response PDU, close the link. The
//! server engine is written against the trait and stays framing-agnostic.

use async_trait::async_trait;

use crate::error::ModbusResult;
use crate::pdu::Pdu;

pub mod rtu;
pub mod tcp;

pub use rtu::RtuTransport;
pub use tcp::TcpTransport;

/// A framed request/response channel to one Modbus client or bus.
#[async_trait]
pub trait Transport: Send {
    /// Read the next complete request frame and decode it into a PDU.
    async fn read_request(&mut self) -> ModbusResult<Pdu>;

    /// Encode `res` into a frame and write it to the link.
    async fn write_response(&mut self, res: &Pdu) -> ModbusResult<()>;

    /// Shut the underlying link down.
    async fn close(&mut self) -> ModbusResult<()>;
}
