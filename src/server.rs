//! Modbus server engine and lifecycle.
//!
//! [`ModbusServer`] owns the configuration and the serving tasks: a single
//! worker over an RTU serial link, or a TCP accept loop spawning one worker
//! per client connection, bounded by `max_clients`. Each worker reads
//! requests from its transport, validates them against the per-function-code
//! rules of the Modbus application protocol, invokes the user-supplied
//! [`RequestHandler`] and writes back a conformant response or exception.
//!
//! Within one transport, requests are processed strictly in arrival order.
//! Across TCP connections there is no ordering; the handler is the
//! serialization point for shared state.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::codec;
use crate::constants::{
    COIL_OFF, COIL_ON, EX_ILLEGAL_DATA_VALUE, FC_READ_COILS, FC_READ_DISCRETE_INPUTS,
    FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS, FC_WRITE_MULTIPLE_COILS,
    FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER, MAX_READ_COILS,
    MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::Pdu;
use crate::transport::{RtuTransport, TcpTransport, Transport};

/// Default I/O timeout on RTU links.
const DEFAULT_RTU_TIMEOUT: Duration = Duration::from_secs(30);

/// Default I/O timeout on TCP connections.
const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(120);

/// Default TCP client connection limit.
const DEFAULT_MAX_CLIENTS: usize = 10;

/// Serial parity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Server configuration.
///
/// The URL scheme selects the transport: `rtu://<device path>` or
/// `tcp://<host:port>`. Zero-valued fields take transport-specific defaults
/// when the server is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Transport URL.
    pub url: String,
    /// RTU baud rate; 0 selects 9600.
    pub speed: u32,
    /// RTU data bits; 0 selects 8.
    pub data_bits: u8,
    /// RTU parity.
    pub parity: Parity,
    /// RTU stop bits; 0 selects 2 with no parity, 1 otherwise.
    pub stop_bits: u8,
    /// Per-operation I/O timeout; defaults to 30 s on RTU, 120 s on TCP.
    pub timeout: Option<Duration>,
    /// Maximum concurrent TCP clients; 0 selects 10.
    pub max_clients: usize,
    /// Unit IDs answered on a shared RTU bus; must not be empty for RTU.
    pub accepted_unit_ids: Vec<u8>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            speed: 0,
            data_bits: 0,
            parity: Parity::None,
            stop_bits: 0,
            timeout: None,
            max_clients: 0,
            accepted_unit_ids: Vec::new(),
        }
    }
}

/// Application-level request handler supplied by the embedder.
///
/// Handlers are invoked concurrently when the server accepts multiple TCP
/// clients and must be internally synchronized; the server never wraps the
/// call in a lock. Reads must return exactly `quantity` items, anything else
/// is answered with a Server Device Failure exception. Errors map to Modbus
/// exception codes via [`ModbusError::exception_code`].
pub trait RequestHandler: Send + Sync {
    /// Coil access (FC 0x01, 0x05, 0x0F). For writes `args` carries the coil
    /// values and the returned vector is ignored.
    fn handle_coils(
        &self,
        unit_id: u8,
        addr: u16,
        quantity: u16,
        is_write: bool,
        args: &[bool],
    ) -> ModbusResult<Vec<bool>>;

    /// Discrete input reads (FC 0x02).
    fn handle_discrete_inputs(
        &self,
        unit_id: u8,
        addr: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>>;

    /// Holding register access (FC 0x03, 0x06, 0x10). For writes `args`
    /// carries the register values and the returned vector is ignored.
    fn handle_holding_registers(
        &self,
        unit_id: u8,
        addr: u16,
        quantity: u16,
        is_write: bool,
        args: &[u16],
    ) -> ModbusResult<Vec<u16>>;

    /// Input register reads (FC 0x04).
    fn handle_input_registers(
        &self,
        unit_id: u8,
        addr: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>>;
}

/// Transport family selected by the configuration URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportKind {
    Rtu,
    Tcp,
}

/// Snapshot of server counters.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    /// Requests accepted for processing.
    pub total_requests: u64,
    /// Responses written without an exception code.
    pub successful_responses: u64,
    /// Exception responses written.
    pub error_responses: u64,
    /// Currently connected TCP clients.
    pub connected_clients: usize,
}

#[derive(Debug, Default)]
struct StatsInner {
    total_requests: AtomicU64,
    successful_responses: AtomicU64,
    error_responses: AtomicU64,
}

/// A live TCP client connection tracked by the server.
struct ClientConn {
    id: u64,
    peer: SocketAddr,
    shutdown: Arc<Notify>,
}

#[derive(Default)]
struct ServerState {
    started: bool,
    /// Signals the accept loop (TCP) or the transport worker (RTU).
    shutdown: Option<Arc<Notify>>,
    clients: Vec<ClientConn>,
}

/// Modbus server over a single RTU link or a TCP listener.
///
/// Created stopped; [`start`](Self::start) and [`stop`](Self::stop) are
/// idempotent. Stopping signals every task and relies on the workers to
/// notice and unwind, so the client list drains shortly after `stop`
/// returns.
pub struct ModbusServer {
    conf: ServerConfig,
    /// Device path (RTU) or bind address (TCP), scheme stripped.
    address: String,
    kind: TransportKind,
    handler: Arc<dyn RequestHandler>,
    state: Arc<Mutex<ServerState>>,
    stats: Arc<StatsInner>,
}

impl ModbusServer {
    /// Validate `conf`, apply transport defaults and build a stopped server.
    pub fn new(mut conf: ServerConfig, handler: Arc<dyn RequestHandler>) -> ModbusResult<Self> {
        let (kind, address) = if let Some(device) = conf.url.strip_prefix("rtu://") {
            let address = device.to_string();
            if conf.speed == 0 {
                conf.speed = 9600;
            }
            if conf.data_bits == 0 {
                conf.data_bits = 8;
            }
            if conf.stop_bits == 0 {
                conf.stop_bits = if conf.parity == Parity::None { 2 } else { 1 };
            }
            if conf.timeout.is_none() {
                conf.timeout = Some(DEFAULT_RTU_TIMEOUT);
            }
            if conf.accepted_unit_ids.is_empty() {
                error!("at least one unit id must be configured with the RTU transport");
                return Err(ModbusError::ConfigurationError(
                    "no accepted unit ids configured".to_string(),
                ));
            }
            (TransportKind::Rtu, address)
        } else if let Some(addr) = conf.url.strip_prefix("tcp://") {
            let address = addr.to_string();
            if conf.timeout.is_none() {
                conf.timeout = Some(DEFAULT_TCP_TIMEOUT);
            }
            if conf.max_clients == 0 {
                conf.max_clients = DEFAULT_MAX_CLIENTS;
            }
            (TransportKind::Tcp, address)
        } else {
            return Err(ModbusError::ConfigurationError(format!(
                "unsupported URL scheme in {:?}",
                conf.url
            )));
        };

        Ok(Self {
            conf,
            address,
            kind,
            handler,
            state: Arc::new(Mutex::new(ServerState::default())),
            stats: Arc::new(StatsInner::default()),
        })
    }

    /// Start serving. Idempotent: calling on a running server is a no-op.
    pub async fn start(&self) -> ModbusResult<()> {
        let mut state = self.state.lock().await;
        if state.started {
            return Ok(());
        }

        let shutdown = Arc::new(Notify::new());

        match self.kind {
            TransportKind::Rtu => {
                let builder = tokio_serial::new(&self.address, self.conf.speed)
                    .data_bits(data_bits_from(self.conf.data_bits))
                    .parity(parity_from(self.conf.parity))
                    .stop_bits(stop_bits_from(self.conf.stop_bits));
                let port = tokio_serial::SerialStream::open(&builder).map_err(|e| {
                    ModbusError::Io(format!("failed to open {}: {e}", self.address))
                })?;

                let mut transport = RtuTransport::new(port, self.conf.speed, self.io_timeout());
                let dispatcher = self.dispatcher();
                let worker_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    // drop stale serial data before serving
                    transport.discard().await;
                    dispatcher.run(transport, worker_shutdown).await;
                });
                info!("modbus RTU server listening on {}", self.address);
            }
            TransportKind::Tcp => {
                let listener = TcpListener::bind(&self.address).await.map_err(|e| {
                    ModbusError::Io(format!("failed to bind {}: {e}", self.address))
                })?;
                self.spawn_accept_loop(listener, shutdown.clone());
                info!("modbus TCP server listening on {}", self.address);
            }
        }

        state.shutdown = Some(shutdown);
        state.started = true;
        Ok(())
    }

    /// Stop serving. No grace period: every task is signalled and the
    /// workers unwind as soon as their current operation returns.
    pub async fn stop(&self) -> ModbusResult<()> {
        let mut state = self.state.lock().await;
        if !state.started {
            return Ok(());
        }
        state.started = false;

        if let Some(shutdown) = state.shutdown.take() {
            shutdown.notify_one();
        }
        for client in &state.clients {
            client.shutdown.notify_one();
        }

        info!("modbus server on {} stopped", self.address);
        Ok(())
    }

    /// Whether the server is currently started.
    pub async fn is_running(&self) -> bool {
        self.state.lock().await.started
    }

    /// Snapshot of the request counters and connection count.
    pub async fn stats(&self) -> ServerStats {
        let state = self.state.lock().await;
        ServerStats {
            total_requests: self.stats.total_requests.load(Ordering::Relaxed),
            successful_responses: self.stats.successful_responses.load(Ordering::Relaxed),
            error_responses: self.stats.error_responses.load(Ordering::Relaxed),
            connected_clients: state.clients.len(),
        }
    }

    fn io_timeout(&self) -> Duration {
        self.conf.timeout.unwrap_or(DEFAULT_TCP_TIMEOUT)
    }

    fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            kind: self.kind,
            handler: self.handler.clone(),
            accepted_unit_ids: self.conf.accepted_unit_ids.clone(),
            stats: self.stats.clone(),
        }
    }

    fn spawn_accept_loop(&self, listener: TcpListener, shutdown: Arc<Notify>) {
        let state = self.state.clone();
        let dispatcher = self.dispatcher();
        let max_clients = self.conf.max_clients;
        let io_timeout = self.io_timeout();

        tokio::spawn(async move {
            let mut next_id: u64 = 0;
            loop {
                let (stream, peer) = tokio::select! {
                    biased;
                    _ = shutdown.notified() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("failed to accept client connection: {e}");
                            continue;
                        }
                    },
                };

                let client_shutdown = Arc::new(Notify::new());
                let accepted = {
                    let mut state = state.lock().await;
                    if state.clients.len() < max_clients {
                        next_id += 1;
                        state.clients.push(ClientConn {
                            id: next_id,
                            peer,
                            shutdown: client_shutdown.clone(),
                        });
                        true
                    } else {
                        false
                    }
                };

                if accepted {
                    let dispatcher = dispatcher.clone();
                    let state = state.clone();
                    let id = next_id;
                    tokio::spawn(async move {
                        debug!("serving TCP client {peer}");
                        let transport = TcpTransport::new(stream, io_timeout);
                        dispatcher.run(transport, client_shutdown).await;

                        let mut state = state.lock().await;
                        if let Some(pos) = state.clients.iter().position(|c| c.id == id) {
                            state.clients.swap_remove(pos);
                        }
                        debug!("TCP client {peer} disconnected");
                    });
                } else {
                    warn!("max number of concurrent connections reached, rejecting {peer}");
                    drop(stream);
                }
            }
        });
    }
}

/// Per-worker request dispatcher: the transport-agnostic protocol engine.
#[derive(Clone)]
struct Dispatcher {
    kind: TransportKind,
    handler: Arc<dyn RequestHandler>,
    accepted_unit_ids: Vec<u8>,
    stats: Arc<StatsInner>,
}

impl Dispatcher {
    /// Serve `transport` until it fails (TCP), a protocol error tears the
    /// link down, or `shutdown` is signalled.
    async fn run<T: Transport>(&self, mut transport: T, shutdown: Arc<Notify>) {
        loop {
            let req = tokio::select! {
                biased;
                _ = shutdown.notified() => break,
                read = transport.read_request() => match read {
                    Ok(req) => req,
                    Err(err) => match self.kind {
                        TransportKind::Rtu
                            if matches!(
                                err,
                                ModbusError::ShortFrame
                                    | ModbusError::BadCrc
                                    | ModbusError::Timeout
                            ) =>
                        {
                            // skippable on a shared serial bus
                            warn!("skipping RTU frame: {err}");
                            continue;
                        }
                        TransportKind::Rtu => {
                            warn!("RTU link failed: {err}");
                            break;
                        }
                        TransportKind::Tcp => {
                            debug!("closing TCP connection: {err}");
                            break;
                        }
                    },
                },
            };

            // shared-bus rule: stay silent unless the request targets one of
            // our unit ids. TCP endpoints are already uniquely addressed, so
            // every unit id is passed through to the handler.
            if self.kind == TransportKind::Rtu && !self.accepted_unit_ids.contains(&req.unit_id) {
                continue;
            }

            self.stats.total_requests.fetch_add(1, Ordering::Relaxed);

            let res = match self.process(&req) {
                Ok(res) => res,
                Err(err) => match self.kind {
                    // a malformed PDU after successful framing poisons the
                    // half-duplex exchange; close the link without replying
                    TransportKind::Rtu => {
                        warn!("protocol error, closing link: {err}");
                        break;
                    }
                    TransportKind::Tcp => {
                        warn!("protocol error: {err}");
                        Pdu::exception(req.unit_id, req.function_code, EX_ILLEGAL_DATA_VALUE)
                    }
                },
            };

            if res.is_exception() {
                self.stats.error_responses.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats.successful_responses.fetch_add(1, Ordering::Relaxed);
            }

            if let Err(err) = transport.write_response(&res).await {
                warn!("failed to write response: {err}");
            }
        }

        if let Err(err) = transport.close().await {
            debug!("error closing transport: {err}");
        }
    }

    /// Validate `req`, invoke the handler and assemble the response PDU.
    ///
    /// Handler and addressing failures come back as exception responses;
    /// only engine-level protocol violations surface as errors, so the
    /// caller can apply the per-transport teardown policy.
    fn process(&self, req: &Pdu) -> ModbusResult<Pdu> {
        match self.dispatch(req) {
            Ok(res) => Ok(res),
            Err(err @ ModbusError::ProtocolError(_)) => Err(err),
            Err(err) => Ok(Pdu::exception(
                req.unit_id,
                req.function_code,
                err.exception_code(),
            )),
        }
    }

    fn dispatch(&self, req: &Pdu) -> ModbusResult<Pdu> {
        match req.function_code {
            FC_READ_COILS | FC_READ_DISCRETE_INPUTS => self.read_bits(req),
            FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => self.read_registers(req),
            FC_WRITE_SINGLE_COIL => self.write_single_coil(req),
            FC_WRITE_SINGLE_REGISTER => self.write_single_register(req),
            FC_WRITE_MULTIPLE_COILS => self.write_multiple_coils(req),
            FC_WRITE_MULTIPLE_REGISTERS => self.write_multiple_registers(req),
            fc => {
                debug!("unknown function code 0x{fc:02X}");
                Err(ModbusError::IllegalFunction)
            }
        }
    }

    /// FC01 / FC02.
    fn read_bits(&self, req: &Pdu) -> ModbusResult<Pdu> {
        let (addr, quantity) = decode_read_request(&req.payload, MAX_READ_COILS)?;

        let bits = if req.function_code == FC_READ_COILS {
            self.handler
                .handle_coils(req.unit_id, addr, quantity, false, &[])?
        } else {
            self.handler
                .handle_discrete_inputs(req.unit_id, addr, quantity)?
        };
        if bits.len() != usize::from(quantity) {
            error!("handler returned {} coils, expected {}", bits.len(), quantity);
            return Err(ModbusError::ServerDeviceFailure);
        }

        let mut payload = vec![codec::packed_len(quantity) as u8];
        payload.extend_from_slice(&codec::pack_bools(&bits));
        Ok(Pdu::new(req.unit_id, req.function_code, payload))
    }

    /// FC03 / FC04.
    fn read_registers(&self, req: &Pdu) -> ModbusResult<Pdu> {
        let (addr, quantity) = decode_read_request(&req.payload, MAX_READ_REGISTERS)?;

        let regs = if req.function_code == FC_READ_HOLDING_REGISTERS {
            self.handler
                .handle_holding_registers(req.unit_id, addr, quantity, false, &[])?
        } else {
            self.handler
                .handle_input_registers(req.unit_id, addr, quantity)?
        };
        if regs.len() != usize::from(quantity) {
            error!(
                "handler returned {} 16-bit values, expected {}",
                regs.len(),
                quantity
            );
            return Err(ModbusError::ServerDeviceFailure);
        }

        let mut payload = vec![(regs.len() * 2) as u8];
        payload.extend_from_slice(&codec::u16s_to_bytes(&regs));
        Ok(Pdu::new(req.unit_id, req.function_code, payload))
    }

    /// FC05. The value field only admits 0xFF00 and 0x0000; the response
    /// echoes the request.
    fn write_single_coil(&self, req: &Pdu) -> ModbusResult<Pdu> {
        if req.payload.len() != 4 {
            return Err(ModbusError::ProtocolError(format!(
                "unexpected payload length {}",
                req.payload.len()
            )));
        }

        let addr = codec::bytes_to_u16(&req.payload[0..2]);
        let value = codec::bytes_to_u16(&req.payload[2..4]);
        if value != COIL_ON && value != COIL_OFF {
            return Err(ModbusError::ProtocolError(format!(
                "invalid coil value 0x{value:04X}"
            )));
        }

        self.handler
            .handle_coils(req.unit_id, addr, 1, true, &[value == COIL_ON])?;

        Ok(Pdu::new(req.unit_id, req.function_code, req.payload.clone()))
    }

    /// FC06. The response echoes the request.
    fn write_single_register(&self, req: &Pdu) -> ModbusResult<Pdu> {
        if req.payload.len() != 4 {
            return Err(ModbusError::ProtocolError(format!(
                "unexpected payload length {}",
                req.payload.len()
            )));
        }

        let addr = codec::bytes_to_u16(&req.payload[0..2]);
        let value = codec::bytes_to_u16(&req.payload[2..4]);

        self.handler
            .handle_holding_registers(req.unit_id, addr, 1, true, &[value])?;

        Ok(Pdu::new(req.unit_id, req.function_code, req.payload.clone()))
    }

    /// FC15. The byte count must match the quantity; the response echoes
    /// address and quantity.
    fn write_multiple_coils(&self, req: &Pdu) -> ModbusResult<Pdu> {
        if req.payload.len() < 6 {
            return Err(ModbusError::ProtocolError(format!(
                "unexpected payload length {}",
                req.payload.len()
            )));
        }

        let addr = codec::bytes_to_u16(&req.payload[0..2]);
        let quantity = codec::bytes_to_u16(&req.payload[2..4]);
        if quantity == 0 || quantity > MAX_WRITE_COILS {
            return Err(ModbusError::ProtocolError(format!(
                "quantity {quantity} out of range"
            )));
        }
        check_addr_range(addr, quantity)?;

        let byte_count = codec::packed_len(quantity);
        if usize::from(req.payload[4]) != byte_count || req.payload.len() - 5 != byte_count {
            return Err(ModbusError::ProtocolError(format!(
                "byte count {} does not match quantity {quantity}",
                req.payload[4]
            )));
        }

        let coils = codec::unpack_bools(quantity, &req.payload[5..]);
        self.handler
            .handle_coils(req.unit_id, addr, quantity, true, &coils)?;

        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&codec::u16_to_bytes(addr));
        payload.extend_from_slice(&codec::u16_to_bytes(quantity));
        Ok(Pdu::new(req.unit_id, req.function_code, payload))
    }

    /// FC16. The byte count must be twice the quantity; the response echoes
    /// address and quantity.
    fn write_multiple_registers(&self, req: &Pdu) -> ModbusResult<Pdu> {
        if req.payload.len() < 6 {
            return Err(ModbusError::ProtocolError(format!(
                "unexpected payload length {}",
                req.payload.len()
            )));
        }

        let addr = codec::bytes_to_u16(&req.payload[0..2]);
        let quantity = codec::bytes_to_u16(&req.payload[2..4]);
        if quantity == 0 || quantity > MAX_WRITE_REGISTERS {
            return Err(ModbusError::ProtocolError(format!(
                "quantity {quantity} out of range"
            )));
        }
        check_addr_range(addr, quantity)?;

        let byte_count = usize::from(quantity) * 2;
        if usize::from(req.payload[4]) != byte_count || req.payload.len() - 5 != byte_count {
            return Err(ModbusError::ProtocolError(format!(
                "byte count {} does not match quantity {quantity}",
                req.payload[4]
            )));
        }

        let values = codec::bytes_to_u16s(&req.payload[5..]);
        self.handler
            .handle_holding_registers(req.unit_id, addr, quantity, true, &values)?;

        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&codec::u16_to_bytes(addr));
        payload.extend_from_slice(&codec::u16_to_bytes(quantity));
        Ok(Pdu::new(req.unit_id, req.function_code, payload))
    }
}

/// Decode and validate the address and quantity words of a read request.
fn decode_read_request(payload: &[u8], max_quantity: u16) -> ModbusResult<(u16, u16)> {
    if payload.len() != 4 {
        return Err(ModbusError::ProtocolError(format!(
            "unexpected payload length {}",
            payload.len()
        )));
    }

    let addr = codec::bytes_to_u16(&payload[0..2]);
    let quantity = codec::bytes_to_u16(&payload[2..4]);
    if quantity == 0 || quantity > max_quantity {
        return Err(ModbusError::ProtocolError(format!(
            "quantity {quantity} out of range"
        )));
    }
    check_addr_range(addr, quantity)?;

    Ok((addr, quantity))
}

/// The last touched address must stay within the 16-bit space.
fn check_addr_range(addr: u16, quantity: u16) -> ModbusResult<()> {
    if u32::from(addr) + u32::from(quantity) - 1 > 0xFFFF {
        return Err(ModbusError::IllegalDataAddress);
    }
    Ok(())
}

fn data_bits_from(bits: u8) -> tokio_serial::DataBits {
    match bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    }
}

fn parity_from(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    }
}

fn stop_bits_from(bits: u8) -> tokio_serial::StopBits {
    match bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    }
}
