//! Modbus TCP transport (MBAP framing).
//!
//! Every frame opens with the 7-byte MBAP header. The length field counts
//! the bytes from the unit ID onward, so a request body is always
//! `length - 1` bytes of function code plus payload. The transaction ID of
//! the last request read is retained and echoed on the next response, which
//! is all MBAP requires of a server processing requests in order.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

use crate::constants::{MAX_MBAP_LENGTH, MBAP_HEADER_LEN, MIN_MBAP_LENGTH};
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::Pdu;
use crate::transport::Transport;

/// MBAP transport over a TCP stream.
///
/// Generic over the stream so tests can run against an in-memory duplex
/// pipe.
pub struct TcpTransport<S> {
    stream: S,
    timeout: Duration,
    transaction_id: u16,
}

impl<S> TcpTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Create a transport over `stream`.
    pub fn new(stream: S, timeout: Duration) -> Self {
        Self {
            stream,
            timeout,
            transaction_id: 0,
        }
    }

    async fn read_frame(&mut self) -> ModbusResult<Pdu> {
        let mut header = [0u8; MBAP_HEADER_LEN];
        self.stream.read_exact(&mut header).await?;

        let transaction_id = u16::from_be_bytes([header[0], header[1]]);
        let protocol_id = u16::from_be_bytes([header[2], header[3]]);
        let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
        let unit_id = header[6];

        if protocol_id != 0 {
            return Err(ModbusError::ProtocolError(format!(
                "unexpected protocol id {protocol_id}"
            )));
        }
        if !(MIN_MBAP_LENGTH..=MAX_MBAP_LENGTH).contains(&length) {
            return Err(ModbusError::ProtocolError(format!(
                "MBAP length {length} out of range"
            )));
        }

        // function code plus payload
        let mut body = vec![0u8; length - 1];
        self.stream.read_exact(&mut body).await?;

        self.transaction_id = transaction_id;

        let function_code = body[0];
        let payload = body.split_off(1);
        debug!(
            "read MBAP request: txn={:04X}, unit={}, fc=0x{:02X}, payload={} bytes",
            transaction_id,
            unit_id,
            function_code,
            payload.len()
        );
        Ok(Pdu::new(unit_id, function_code, payload))
    }
}

#[async_trait]
impl<S> Transport for TcpTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_request(&mut self) -> ModbusResult<Pdu> {
        match timeout(self.timeout, self.read_frame()).await {
            Ok(result) => result,
            Err(_) => Err(ModbusError::Timeout),
        }
    }

    async fn write_response(&mut self, res: &Pdu) -> ModbusResult<()> {
        let length = 2 + res.payload.len();
        if length > MAX_MBAP_LENGTH {
            return Err(ModbusError::ProtocolError(format!(
                "MBAP length {length} out of range"
            )));
        }

        let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + 1 + res.payload.len());
        frame.extend_from_slice(&self.transaction_id.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        frame.extend_from_slice(&(length as u16).to_be_bytes());
        frame.push(res.unit_id);
        frame.push(res.function_code);
        frame.extend_from_slice(&res.payload);

        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(link: tokio::io::DuplexStream) -> TcpTransport<tokio::io::DuplexStream> {
        TcpTransport::new(link, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_read_request_decodes_mbap_frame() {
        let (link, mut peer) = tokio::io::duplex(64);
        let mut tt = transport(link);

        peer.write_all(&[
            0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02,
        ])
        .await
        .unwrap();

        let req = tt.read_request().await.unwrap();
        assert_eq!(req.unit_id, 0x01);
        assert_eq!(req.function_code, 0x03);
        assert_eq!(req.payload, vec![0x00, 0x00, 0x00, 0x02]);
    }

    #[tokio::test]
    async fn test_write_response_echoes_transaction_id() {
        let (link, mut peer) = tokio::io::duplex(64);
        let mut tt = transport(link);

        peer.write_all(&[
            0xAB, 0xCD, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02,
        ])
        .await
        .unwrap();
        let req = tt.read_request().await.unwrap();

        let res = Pdu::new(req.unit_id, req.function_code, vec![0x04, 0x12, 0x34, 0x56, 0x78]);
        tt.write_response(&res).await.unwrap();

        let mut written = vec![0u8; 13];
        peer.read_exact(&mut written).await.unwrap();
        assert_eq!(
            written,
            vec![0xAB, 0xCD, 0x00, 0x00, 0x00, 0x07, 0x01, 0x03, 0x04, 0x12, 0x34, 0x56, 0x78]
        );
    }

    #[tokio::test]
    async fn test_read_request_rejects_protocol_id() {
        let (link, mut peer) = tokio::io::duplex(64);
        let mut tt = transport(link);

        peer.write_all(&[
            0x00, 0x01, 0x00, 0x01, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02,
        ])
        .await
        .unwrap();

        assert!(matches!(
            tt.read_request().await,
            Err(ModbusError::ProtocolError(_))
        ));
    }

    #[tokio::test]
    async fn test_read_request_rejects_out_of_range_length() {
        let (link, mut peer) = tokio::io::duplex(64);
        let mut tt = transport(link);

        // length 1 cannot even carry a function code
        peer.write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01])
            .await
            .unwrap();
        assert!(matches!(
            tt.read_request().await,
            Err(ModbusError::ProtocolError(_))
        ));

        let (link, mut peer) = tokio::io::duplex(64);
        let mut tt = transport(link);

        // length 255 exceeds the MBAP maximum of 254
        peer.write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0xFF, 0x01])
            .await
            .unwrap();
        assert!(matches!(
            tt.read_request().await,
            Err(ModbusError::ProtocolError(_))
        ));
    }

    #[tokio::test]
    async fn test_read_request_short_body() {
        let (link, mut peer) = tokio::io::duplex(64);
        let mut tt = transport(link);

        peer.write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03])
            .await
            .unwrap();
        drop(peer);

        assert_eq!(tt.read_request().await, Err(ModbusError::ShortFrame));
    }

    #[tokio::test]
    async fn test_write_response_rejects_oversize_payload() {
        let (link, _peer) = tokio::io::duplex(64);
        let mut tt = transport(link);

        let res = Pdu::new(0x01, 0x03, vec![0u8; 253]);
        assert!(matches!(
            tt.write_response(&res).await,
            Err(ModbusError::ProtocolError(_))
        ));
    }
}
