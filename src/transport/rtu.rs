//! Modbus RTU transport.
//!
//! RTU frames carry no length prefix. The reader infers the remaining frame
//! length from the function code (and, for read replies and multi-write
//! requests, a byte-count field), then validates the trailing CRC-16. Writes
//! are followed by the mandatory inter-frame silent period of 3.5 character
//! times.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::constants::{
    CRC_LEN, EXCEPTION_BIT, FC_MASK_WRITE_REGISTER, FC_READ_COILS, FC_READ_DISCRETE_INPUTS,
    FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS, FC_WRITE_MULTIPLE_COILS,
    FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER,
    MAX_RTU_FRAME_LEN,
};
use crate::crc::Crc16;
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::Pdu;
use crate::transport::Transport;

/// Fixed inter-frame delay for speeds of 19200 baud and above.
const FAST_INTER_FRAME_DELAY: Duration = Duration::from_micros(1750);

/// Deadline for the startup receive-buffer flush.
const DISCARD_DEADLINE: Duration = Duration::from_millis(1);

/// RTU transport over a serial byte link.
///
/// Generic over the link so the serial driver stays an external collaborator
/// and tests can run against an in-memory duplex pipe.
pub struct RtuTransport<L> {
    link: L,
    speed: u32,
    timeout: Duration,
}

impl<L> RtuTransport<L>
where
    L: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Create a transport over `link` running at `speed` baud.
    pub fn new(link: L, speed: u32, timeout: Duration) -> Self {
        Self {
            link,
            speed,
            timeout,
        }
    }

    /// Inter-frame gap: 3.5 character times at the configured speed, with
    /// the fixed 1750 us value mandated for 19200 baud and above (or when
    /// the speed is unspecified).
    fn inter_frame_delay(&self) -> Duration {
        if self.speed == 0 || self.speed >= 19_200 {
            FAST_INTER_FRAME_DELAY
        } else {
            Duration::from_micros(u64::from(38_500_000 / self.speed))
        }
    }

    /// Client role: send `req` and read the matching response, observing the
    /// inter-frame gap in between. The whole exchange runs under one
    /// deadline.
    pub async fn execute_request(&mut self, req: &Pdu) -> ModbusResult<Pdu> {
        let timeout_dur = self.timeout;
        let exchange = async {
            let frame = assemble_frame(req)?;
            self.link.write_all(&frame).await?;
            self.link.flush().await?;
            tokio::time::sleep(self.inter_frame_delay()).await;
            self.read_frame(false).await
        };
        match timeout(timeout_dur, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ModbusError::Timeout),
        }
    }

    /// Drop stale bytes sitting in the receive buffer. Best effort, bounded
    /// by a 1 ms deadline; errors are ignored.
    pub async fn discard(&mut self) {
        let mut sink = [0u8; 1024];
        let _ = timeout(DISCARD_DEADLINE, self.link.read(&mut sink)).await;
    }

    /// Read one frame, inferring its length from the function code.
    ///
    /// The first three bytes are always unit ID, function code and one more
    /// byte that doubles as the byte count on read replies. Requests size
    /// themselves differently from responses, so the caller states which
    /// side of the exchange it expects.
    async fn read_frame(&mut self, is_request: bool) -> ModbusResult<Pdu> {
        let mut buf = [0u8; MAX_RTU_FRAME_LEN];

        self.link.read_exact(&mut buf[..3]).await?;

        let function_code = buf[1];
        let mut header_len = 3;

        // bytes still to read after the inferred header, CRC included
        let bytes_needed = if is_request {
            match function_code {
                FC_READ_COILS
                | FC_READ_DISCRETE_INPUTS
                | FC_READ_HOLDING_REGISTERS
                | FC_READ_INPUT_REGISTERS
                | FC_WRITE_SINGLE_COIL
                | FC_WRITE_SINGLE_REGISTER => 3 + CRC_LEN,
                FC_WRITE_MULTIPLE_COILS | FC_WRITE_MULTIPLE_REGISTERS => {
                    // the byte count sits behind the address and quantity
                    // words; read up to it before sizing the remainder
                    self.link.read_exact(&mut buf[3..7]).await?;
                    header_len = 7;
                    usize::from(buf[6]) + CRC_LEN
                }
                fc => {
                    return Err(ModbusError::ProtocolError(format!(
                        "cannot size request with function code 0x{fc:02X}"
                    )))
                }
            }
        } else {
            expected_response_len(function_code, buf[2])? + CRC_LEN
        };

        let frame_len = header_len + bytes_needed;
        if frame_len > MAX_RTU_FRAME_LEN {
            return Err(ModbusError::ProtocolError(format!(
                "frame length {frame_len} exceeds {MAX_RTU_FRAME_LEN} bytes"
            )));
        }

        self.link.read_exact(&mut buf[header_len..frame_len]).await?;

        let mut crc = Crc16::new();
        crc.update(&buf[..frame_len - CRC_LEN]);
        if !crc.matches(buf[frame_len - CRC_LEN], buf[frame_len - 1]) {
            return Err(ModbusError::BadCrc);
        }

        Ok(Pdu::new(
            buf[0],
            function_code,
            buf[2..frame_len - CRC_LEN].to_vec(),
        ))
    }
}

#[async_trait]
impl<L> Transport for RtuTransport<L>
where
    L: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_request(&mut self) -> ModbusResult<Pdu> {
        match timeout(self.timeout, self.read_frame(true)).await {
            Ok(result) => result,
            Err(_) => Err(ModbusError::Timeout),
        }
    }

    async fn write_response(&mut self, res: &Pdu) -> ModbusResult<()> {
        let frame = assemble_frame(res)?;
        self.link.write_all(&frame).await?;
        self.link.flush().await?;
        // half-duplex bus: observe the silent period before releasing the line
        tokio::time::sleep(self.inter_frame_delay()).await;
        Ok(())
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.link.shutdown().await?;
        Ok(())
    }
}

/// Serialize `pdu` as an RTU ADU with the CRC appended.
fn assemble_frame(pdu: &Pdu) -> ModbusResult<Vec<u8>> {
    let frame_len = 2 + pdu.payload.len() + CRC_LEN;
    if frame_len > MAX_RTU_FRAME_LEN {
        return Err(ModbusError::ProtocolError(format!(
            "frame length {frame_len} exceeds {MAX_RTU_FRAME_LEN} bytes"
        )));
    }

    let mut frame = Vec::with_capacity(frame_len);
    frame.push(pdu.unit_id);
    frame.push(pdu.function_code);
    frame.extend_from_slice(&pdu.payload);

    let mut crc = Crc16::new();
    crc.update(&frame);
    frame.extend_from_slice(&crc.value());

    Ok(frame)
}

/// Expected payload length of an RTU response beyond the three header bytes,
/// excluding the CRC. Read replies size themselves with the byte-count field
/// passed as `count_hint`; exception responses carry nothing beyond the
/// header.
pub(crate) fn expected_response_len(function_code: u8, count_hint: u8) -> ModbusResult<usize> {
    match function_code {
        FC_READ_COILS | FC_READ_DISCRETE_INPUTS | FC_READ_HOLDING_REGISTERS
        | FC_READ_INPUT_REGISTERS => Ok(usize::from(count_hint)),
        FC_WRITE_SINGLE_COIL | FC_WRITE_SINGLE_REGISTER | FC_WRITE_MULTIPLE_COILS
        | FC_WRITE_MULTIPLE_REGISTERS => Ok(3),
        FC_MASK_WRITE_REGISTER => Ok(5),
        fc if fc & EXCEPTION_BIT != 0 && is_length_table_function(fc & !EXCEPTION_BIT) => Ok(0),
        fc => Err(ModbusError::ProtocolError(format!(
            "unexpected response code 0x{fc:02X}"
        ))),
    }
}

/// Whether `function_code` has an entry in the response length table.
fn is_length_table_function(function_code: u8) -> bool {
    matches!(
        function_code,
        FC_READ_COILS
            | FC_READ_DISCRETE_INPUTS
            | FC_READ_HOLDING_REGISTERS
            | FC_READ_INPUT_REGISTERS
            | FC_WRITE_SINGLE_COIL
            | FC_WRITE_SINGLE_REGISTER
            | FC_WRITE_MULTIPLE_COILS
            | FC_WRITE_MULTIPLE_REGISTERS
            | FC_MASK_WRITE_REGISTER
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::checksum;

    /// Append the CRC in wire order.
    fn push_crc(frame: &mut Vec<u8>) {
        let crc = checksum(frame);
        frame.push((crc & 0xFF) as u8);
        frame.push((crc >> 8) as u8);
    }

    fn transport(
        link: tokio::io::DuplexStream,
        speed: u32,
    ) -> RtuTransport<tokio::io::DuplexStream> {
        RtuTransport::new(link, speed, Duration::from_secs(1))
    }

    #[test]
    fn test_inter_frame_delay() {
        let (link, _peer) = tokio::io::duplex(16);
        let rt = transport(link, 9600);
        assert_eq!(rt.inter_frame_delay(), Duration::from_micros(4010));

        let (link, _peer) = tokio::io::duplex(16);
        let rt = transport(link, 19200);
        assert_eq!(rt.inter_frame_delay(), Duration::from_micros(1750));

        let (link, _peer) = tokio::io::duplex(16);
        let rt = transport(link, 0);
        assert_eq!(rt.inter_frame_delay(), Duration::from_micros(1750));
    }

    #[test]
    fn test_expected_response_len() {
        // read replies follow the byte count
        assert_eq!(expected_response_len(0x03, 0x04).unwrap(), 4);
        assert_eq!(expected_response_len(0x01, 0x01).unwrap(), 1);
        // write replies are fixed
        assert_eq!(expected_response_len(0x05, 0x00).unwrap(), 3);
        assert_eq!(expected_response_len(0x10, 0x00).unwrap(), 3);
        // mask write register
        assert_eq!(expected_response_len(0x16, 0x00).unwrap(), 5);
        // exceptions carry only the code, already read as the third byte
        assert_eq!(expected_response_len(0x83, 0x02).unwrap(), 0);
        assert_eq!(expected_response_len(0x96, 0x01).unwrap(), 0);
        // unknown codes cannot be sized
        assert!(expected_response_len(0x42, 0x00).is_err());
        assert!(expected_response_len(0xC2, 0x00).is_err());
    }

    #[tokio::test]
    async fn test_read_fixed_length_request() {
        let (link, mut peer) = tokio::io::duplex(64);
        let mut rt = transport(link, 19200);

        let mut frame = vec![0x11, 0x03, 0x00, 0x6B, 0x00, 0x03];
        push_crc(&mut frame);
        peer.write_all(&frame).await.unwrap();

        let req = rt.read_request().await.unwrap();
        assert_eq!(req.unit_id, 0x11);
        assert_eq!(req.function_code, 0x03);
        assert_eq!(req.payload, vec![0x00, 0x6B, 0x00, 0x03]);
    }

    #[tokio::test]
    async fn test_read_write_multiple_request_follows_byte_count() {
        let (link, mut peer) = tokio::io::duplex(64);
        let mut rt = transport(link, 19200);

        let mut frame = vec![
            0x01, 0x10, 0x00, 0x10, 0x00, 0x02, 0x04, 0xAA, 0xAA, 0xBB, 0xBB,
        ];
        push_crc(&mut frame);
        peer.write_all(&frame).await.unwrap();

        let req = rt.read_request().await.unwrap();
        assert_eq!(req.function_code, 0x10);
        assert_eq!(
            req.payload,
            vec![0x00, 0x10, 0x00, 0x02, 0x04, 0xAA, 0xAA, 0xBB, 0xBB]
        );
    }

    #[tokio::test]
    async fn test_read_request_rejects_bad_crc() {
        let (link, mut peer) = tokio::io::duplex(64);
        let mut rt = transport(link, 19200);

        let mut frame = vec![0x11, 0x03, 0x00, 0x00, 0x00, 0x01];
        push_crc(&mut frame);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        peer.write_all(&frame).await.unwrap();

        assert_eq!(rt.read_request().await, Err(ModbusError::BadCrc));
    }

    #[tokio::test]
    async fn test_read_request_short_frame() {
        let (link, mut peer) = tokio::io::duplex(64);
        let mut rt = transport(link, 19200);

        peer.write_all(&[0x11, 0x03, 0x00]).await.unwrap();
        drop(peer);

        assert_eq!(rt.read_request().await, Err(ModbusError::ShortFrame));
    }

    #[tokio::test]
    async fn test_read_request_unknown_function_code() {
        let (link, mut peer) = tokio::io::duplex(64);
        let mut rt = transport(link, 19200);

        peer.write_all(&[0x11, 0x42, 0x00]).await.unwrap();

        assert!(matches!(
            rt.read_request().await,
            Err(ModbusError::ProtocolError(_))
        ));
    }

    #[tokio::test]
    async fn test_read_request_rejects_oversize_frame() {
        let (link, mut peer) = tokio::io::duplex(512);
        let mut rt = transport(link, 19200);

        // byte count of 250 would push the frame past 256 bytes
        peer.write_all(&[0x01, 0x0F, 0x00, 0x00, 0x07, 0xD0, 0xFA])
            .await
            .unwrap();

        assert!(matches!(
            rt.read_request().await,
            Err(ModbusError::ProtocolError(_))
        ));
    }

    #[tokio::test]
    async fn test_read_request_times_out_on_idle_link() {
        let (link, _peer) = tokio::io::duplex(16);
        let mut rt = RtuTransport::new(link, 19200, Duration::from_millis(20));

        assert_eq!(rt.read_request().await, Err(ModbusError::Timeout));
    }

    #[tokio::test]
    async fn test_write_response_appends_crc() {
        let (link, mut peer) = tokio::io::duplex(64);
        let mut rt = transport(link, 19200);

        let res = Pdu::new(0x11, 0x03, vec![0x02, 0x00, 0x0A]);
        rt.write_response(&res).await.unwrap();

        let mut expected = vec![0x11, 0x03, 0x02, 0x00, 0x0A];
        push_crc(&mut expected);
        let mut written = vec![0u8; expected.len()];
        peer.read_exact(&mut written).await.unwrap();
        assert_eq!(written, expected);
    }

    #[tokio::test]
    async fn test_execute_request_round_trip() {
        let (link, mut peer) = tokio::io::duplex(64);
        let mut rt = transport(link, 19200);

        let responder = tokio::spawn(async move {
            let mut request = vec![0u8; 8];
            peer.read_exact(&mut request).await.unwrap();

            let mut response = vec![0x11, 0x03, 0x02, 0x00, 0x0A];
            push_crc(&mut response);
            peer.write_all(&response).await.unwrap();
            request
        });

        let req = Pdu::new(0x11, 0x03, vec![0x00, 0x00, 0x00, 0x01]);
        let res = rt.execute_request(&req).await.unwrap();
        assert_eq!(res.unit_id, 0x11);
        assert_eq!(res.function_code, 0x03);
        assert_eq!(res.payload, vec![0x02, 0x00, 0x0A]);

        let mut expected = vec![0x11, 0x03, 0x00, 0x00, 0x00, 0x01];
        push_crc(&mut expected);
        assert_eq!(responder.await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_execute_request_reads_exception_response() {
        let (link, mut peer) = tokio::io::duplex(64);
        let mut rt = transport(link, 19200);

        let responder = tokio::spawn(async move {
            let mut request = vec![0u8; 8];
            peer.read_exact(&mut request).await.unwrap();

            let mut response = vec![0x11, 0x83, 0x02];
            push_crc(&mut response);
            peer.write_all(&response).await.unwrap();
        });

        let req = Pdu::new(0x11, 0x03, vec![0xFF, 0xFF, 0x00, 0x02]);
        let res = rt.execute_request(&req).await.unwrap();
        assert!(res.is_exception());
        assert_eq!(res.exception_code(), Some(0x02));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_discard_eats_stale_bytes() {
        let (link, mut peer) = tokio::io::duplex(2048);
        let mut rt = transport(link, 19200);

        peer.write_all(&[0xFF; 16]).await.unwrap();
        rt.discard().await;

        // the next frame parses cleanly
        let mut frame = vec![0x11, 0x03, 0x00, 0x00, 0x00, 0x01];
        push_crc(&mut frame);
        peer.write_all(&frame).await.unwrap();

        let req = rt.read_request().await.unwrap();
        assert_eq!(req.unit_id, 0x11);
    }
}
