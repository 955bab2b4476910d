//! Modbus slave with an in-memory register bank
//!
//! The bank holds the four tables at full 0..=65535 addressing and serves
//! function codes 1-6, 15 and 16. One reader-writer lock guards the bank;
//! handlers take it for the duration of one request and never suspend while
//! holding it. Requests for a unit id other than the configured one are
//! answered with an Illegal Function exception; broadcast writes (unit 0)
//! are applied without a response.

use std::net::SocketAddr;
use std::sync::RwLock;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gridflux_comlink::{LinkError, Result};

use super::connection::ModbusConnection;
use super::constants::{
    MAX_MBAP_LENGTH, MAX_READ_BITS, MAX_READ_REGISTERS, MAX_WRITE_BITS, MAX_WRITE_REGISTERS,
    MBAP_HEADER_LEN,
};
use super::frame::{decode_rtu, encode_mbap, encode_rtu};
use super::pdu::ModbusPdu;
use super::types::{ExceptionCode, SerialConfig};

const TABLE_SIZE: usize = 65_536;

/// Holding addresses that reject writes (the clock pair kept by the
/// background tick)
const READ_ONLY_HOLDING: std::ops::Range<u16> = 0..2;

struct BankInner {
    coils: Vec<bool>,
    discrete: Vec<bool>,
    input: Vec<u16>,
    holding: Vec<u16>,
}

/// The four Modbus tables behind one reader-writer lock
pub struct RegisterBank {
    unit_id: u8,
    inner: RwLock<BankInner>,
}

impl RegisterBank {
    pub fn new(unit_id: u8) -> Self {
        Self {
            unit_id,
            inner: RwLock::new(BankInner {
                coils: vec![false; TABLE_SIZE],
                discrete: vec![false; TABLE_SIZE],
                input: vec![0; TABLE_SIZE],
                holding: vec![0; TABLE_SIZE],
            }),
        }
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    // ========================================================================
    // Direct access for the owning worker and for tests
    // ========================================================================

    pub fn set_holding(&self, address: u16, values: &[u16]) {
        let mut bank = self.inner.write().expect("bank lock");
        for (i, &v) in values.iter().enumerate() {
            if let Some(slot) = bank.holding.get_mut(usize::from(address) + i) {
                *slot = v;
            }
        }
    }

    pub fn set_input(&self, address: u16, values: &[u16]) {
        let mut bank = self.inner.write().expect("bank lock");
        for (i, &v) in values.iter().enumerate() {
            if let Some(slot) = bank.input.get_mut(usize::from(address) + i) {
                *slot = v;
            }
        }
    }

    pub fn set_coils(&self, address: u16, values: &[bool]) {
        let mut bank = self.inner.write().expect("bank lock");
        for (i, &v) in values.iter().enumerate() {
            if let Some(slot) = bank.coils.get_mut(usize::from(address) + i) {
                *slot = v;
            }
        }
    }

    pub fn set_discrete(&self, address: u16, values: &[bool]) {
        let mut bank = self.inner.write().expect("bank lock");
        for (i, &v) in values.iter().enumerate() {
            if let Some(slot) = bank.discrete.get_mut(usize::from(address) + i) {
                *slot = v;
            }
        }
    }

    pub fn holding(&self, address: u16) -> u16 {
        self.inner.read().expect("bank lock").holding[usize::from(address)]
    }

    pub fn coil(&self, address: u16) -> bool {
        self.inner.read().expect("bank lock").coils[usize::from(address)]
    }

    /// Advance the uptime input-register pair and the unix-timestamp holding
    /// pair; called by the owning worker once per second
    pub fn tick_clock(&self, uptime_secs: u32, unix_time: u32) {
        let mut bank = self.inner.write().expect("bank lock");
        bank.input[0] = (uptime_secs >> 16) as u16;
        bank.input[1] = uptime_secs as u16;
        bank.holding[0] = (unix_time >> 16) as u16;
        bank.holding[1] = unix_time as u16;
    }

    // ========================================================================
    // Request handling
    // ========================================================================

    /// Serve one request PDU; `None` means no response goes on the wire
    pub fn handle_request(&self, unit_id: u8, request: &ModbusPdu) -> Option<ModbusPdu> {
        let function = request.function_code()?;

        if unit_id == 0 {
            // Broadcast: apply writes silently, never answer reads
            if matches!(function, 5 | 6 | 15 | 16) {
                let _ = self.execute(function, request);
            }
            return None;
        }
        if unit_id != self.unit_id {
            debug!(unit_id, own = self.unit_id, "request for foreign unit id");
            return Some(ModbusPdu::exception_response(
                function,
                ExceptionCode::IllegalFunction,
            ));
        }

        Some(match self.execute(function, request) {
            Ok(response) => response,
            Err(code) => ModbusPdu::exception_response(function, code),
        })
    }

    fn execute(
        &self,
        function: u8,
        request: &ModbusPdu,
    ) -> std::result::Result<ModbusPdu, ExceptionCode> {
        match function {
            1 | 2 => {
                let (address, quantity) = request
                    .request_range()
                    .map_err(|_| ExceptionCode::IllegalDataValue)?;
                if quantity == 0 || quantity > MAX_READ_BITS {
                    return Err(ExceptionCode::IllegalDataValue);
                }
                check_range(address, quantity)?;
                let bank = self.inner.read().expect("bank lock");
                let table = if function == 1 { &bank.coils } else { &bank.discrete };
                let bits =
                    &table[usize::from(address)..usize::from(address) + usize::from(quantity)];
                ModbusPdu::bits_response(function, bits)
                    .map_err(|_| ExceptionCode::SlaveDeviceFailure)
            }
            3 | 4 => {
                let (address, quantity) = request
                    .request_range()
                    .map_err(|_| ExceptionCode::IllegalDataValue)?;
                if quantity == 0 || quantity > MAX_READ_REGISTERS {
                    return Err(ExceptionCode::IllegalDataValue);
                }
                check_range(address, quantity)?;
                let bank = self.inner.read().expect("bank lock");
                let table = if function == 3 { &bank.holding } else { &bank.input };
                let words =
                    &table[usize::from(address)..usize::from(address) + usize::from(quantity)];
                ModbusPdu::registers_response(function, words)
                    .map_err(|_| ExceptionCode::SlaveDeviceFailure)
            }
            5 => {
                let (address, raw) = request
                    .request_write_single()
                    .map_err(|_| ExceptionCode::IllegalDataValue)?;
                let value = match raw {
                    0xFF00 => true,
                    0x0000 => false,
                    _ => return Err(ExceptionCode::IllegalDataValue),
                };
                check_range(address, 1)?;
                self.inner.write().expect("bank lock").coils[usize::from(address)] = value;
                ModbusPdu::echo_response(5, address, raw)
                    .map_err(|_| ExceptionCode::SlaveDeviceFailure)
            }
            6 => {
                let (address, value) = request
                    .request_write_single()
                    .map_err(|_| ExceptionCode::IllegalDataValue)?;
                check_range(address, 1)?;
                check_writable_holding(address, 1)?;
                self.inner.write().expect("bank lock").holding[usize::from(address)] = value;
                ModbusPdu::echo_response(6, address, value)
                    .map_err(|_| ExceptionCode::SlaveDeviceFailure)
            }
            15 => {
                let (address, quantity) = request
                    .request_range()
                    .map_err(|_| ExceptionCode::IllegalDataValue)?;
                if quantity == 0 || quantity > MAX_WRITE_BITS {
                    return Err(ExceptionCode::IllegalDataValue);
                }
                check_range(address, quantity)?;
                let values = request
                    .request_coil_values()
                    .map_err(|_| ExceptionCode::IllegalDataValue)?;
                {
                    let mut bank = self.inner.write().expect("bank lock");
                    for (i, &v) in values.iter().enumerate() {
                        bank.coils[usize::from(address) + i] = v;
                    }
                }
                ModbusPdu::write_ack_response(15, address, quantity)
                    .map_err(|_| ExceptionCode::SlaveDeviceFailure)
            }
            16 => {
                let (address, quantity) = request
                    .request_range()
                    .map_err(|_| ExceptionCode::IllegalDataValue)?;
                if quantity == 0 || quantity > MAX_WRITE_REGISTERS {
                    return Err(ExceptionCode::IllegalDataValue);
                }
                check_range(address, quantity)?;
                check_writable_holding(address, quantity)?;
                let values = request
                    .request_register_values()
                    .map_err(|_| ExceptionCode::IllegalDataValue)?;
                {
                    let mut bank = self.inner.write().expect("bank lock");
                    for (i, &v) in values.iter().enumerate() {
                        bank.holding[usize::from(address) + i] = v;
                    }
                }
                ModbusPdu::write_ack_response(16, address, quantity)
                    .map_err(|_| ExceptionCode::SlaveDeviceFailure)
            }
            _ => Err(ExceptionCode::IllegalFunction),
        }
    }
}

fn check_range(address: u16, quantity: u16) -> std::result::Result<(), ExceptionCode> {
    if usize::from(address) + usize::from(quantity) > TABLE_SIZE {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok(())
}

fn check_writable_holding(address: u16, quantity: u16) -> std::result::Result<(), ExceptionCode> {
    let end = address.saturating_add(quantity);
    if address < READ_ONLY_HOLDING.end && end > READ_ONLY_HOLDING.start {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok(())
}

// ============================================================================
// TCP server
// ============================================================================

/// Modbus TCP slave: accepts clients and serves the shared bank
pub struct ModbusTcpServer {
    listener: TcpListener,
    bank: std::sync::Arc<RegisterBank>,
}

impl ModbusTcpServer {
    /// Bind the listener so that port conflicts surface at open time
    pub async fn bind(addr: &str, bank: std::sync::Arc<RegisterBank>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| LinkError::connection(format!("bind {addr}: {e}")))?;
        info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "Modbus TCP slave listening");
        Ok(Self { listener, bank })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| LinkError::io(e.to_string()))
    }

    /// Accept loop; one task per client, all scoped to `cancel`
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, peer)) => {
                    debug!(%peer, "client connected");
                    let bank = self.bank.clone();
                    let conn_cancel = cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = serve_tcp_client(socket, bank, conn_cancel).await {
                            debug!(%peer, error = %e, "client session ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        debug!("Modbus TCP slave stopped");
    }
}

async fn serve_tcp_client(
    mut socket: TcpStream,
    bank: std::sync::Arc<RegisterBank>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let mut header = [0u8; MBAP_HEADER_LEN];
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = socket.read_exact(&mut header) => {
                read.map_err(|e| LinkError::connection(format!("read header: {e}")))?;
            }
        }

        let transaction_id = u16::from_be_bytes([header[0], header[1]]);
        let protocol_id = u16::from_be_bytes([header[2], header[3]]);
        let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
        let unit_id = header[6];

        if protocol_id != 0 || length == 0 || length > MAX_MBAP_LENGTH {
            return Err(LinkError::protocol("malformed MBAP header"));
        }

        let mut body = vec![0u8; length - 1];
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = socket.read_exact(&mut body) => {
                read.map_err(|e| LinkError::connection(format!("read body: {e}")))?;
            }
        }

        let request = ModbusPdu::from_slice(&body)?;
        if let Some(response) = bank.handle_request(unit_id, &request) {
            let frame = encode_mbap(transaction_id, unit_id, &response);
            socket
                .write_all(&frame)
                .await
                .map_err(|e| LinkError::io(format!("write response: {e}")))?;
        }
    }
}

// ============================================================================
// RTU server
// ============================================================================

/// Modbus RTU slave on a serial line
pub struct ModbusRtuServer {
    serial: SerialConfig,
    bank: std::sync::Arc<RegisterBank>,
}

impl ModbusRtuServer {
    pub fn new(serial: SerialConfig, bank: std::sync::Arc<RegisterBank>) -> Self {
        Self { serial, bank }
    }

    /// Serve the line until cancelled
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut conn = ModbusConnection::connect_rtu(&self.serial).await?;
        info!(device = %self.serial.device, "Modbus RTU slave on line");

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                // A quiet bus is normal; wait in long slices so cancellation
                // stays responsive
                frame = conn.recv_frame(Duration::from_secs(3600)) => frame,
            };

            let raw = match frame {
                Ok(raw) => raw,
                Err(LinkError::Timeout(_)) => continue,
                Err(e) => return Err(e),
            };

            let (unit_id, request) = match decode_rtu(&raw) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!(error = %e, "dropping malformed RTU frame");
                    continue;
                }
            };

            if let Some(response) = self.bank.handle_request(unit_id, &request) {
                let frame = encode_rtu(unit_id, &response);
                conn.send(&frame, Duration::from_secs(1)).await?;
            }
        }

        conn.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank() -> RegisterBank {
        RegisterBank::new(1)
    }

    #[test]
    fn test_read_holding() {
        let bank = bank();
        bank.set_holding(100, &[0x1234, 0x5678]);

        let request = ModbusPdu::read_request(3, 100, 2).unwrap();
        let response = bank.handle_request(1, &request).unwrap();
        assert_eq!(
            response.parse_registers_response(3, 2).unwrap(),
            vec![0x1234, 0x5678]
        );
    }

    #[test]
    fn test_read_coils() {
        let bank = bank();
        bank.set_coils(8, &[true, false, true]);

        let request = ModbusPdu::read_request(1, 8, 3).unwrap();
        let response = bank.handle_request(1, &request).unwrap();
        assert_eq!(
            response.parse_bits_response(1, 3).unwrap(),
            vec![true, false, true]
        );
    }

    #[test]
    fn test_read_past_end_is_illegal_address() {
        let bank = bank();
        let request = ModbusPdu::read_request(4, 0xFFFF, 2).unwrap();
        let response = bank.handle_request(1, &request).unwrap();
        assert!(response.is_exception());
        assert_eq!(response.exception_code(), Some(0x02));
    }

    #[test]
    fn test_foreign_unit_id_is_illegal_function() {
        let bank = bank();
        let request = ModbusPdu::read_request(3, 0, 1).unwrap();
        let response = bank.handle_request(9, &request).unwrap();
        assert!(response.is_exception());
        assert_eq!(response.exception_code(), Some(0x01));
    }

    #[test]
    fn test_broadcast_write_no_response() {
        let bank = bank();
        let request = ModbusPdu::write_single_coil(5, true).unwrap();
        assert!(bank.handle_request(0, &request).is_none());
        assert!(bank.coil(5));

        // Broadcast reads are ignored outright
        let read = ModbusPdu::read_request(1, 5, 1).unwrap();
        assert!(bank.handle_request(0, &read).is_none());
    }

    #[test]
    fn test_write_single_register() {
        let bank = bank();
        let request = ModbusPdu::write_single_register(200, 0xBEEF).unwrap();
        let response = bank.handle_request(1, &request).unwrap();
        assert!(!response.is_exception());
        assert_eq!(bank.holding(200), 0xBEEF);
    }

    #[test]
    fn test_write_coil_rejects_bad_value() {
        let bank = bank();
        let request = ModbusPdu::from_slice(&[0x05, 0x00, 0x05, 0x12, 0x34]).unwrap();
        let response = bank.handle_request(1, &request).unwrap();
        assert_eq!(response.exception_code(), Some(0x03));
    }

    #[test]
    fn test_write_multiple_registers() {
        let bank = bank();
        let request = ModbusPdu::write_multiple_registers(50, &[1, 2, 3]).unwrap();
        let response = bank.handle_request(1, &request).unwrap();
        assert!(!response.is_exception());
        assert_eq!(bank.holding(50), 1);
        assert_eq!(bank.holding(52), 3);
    }

    #[test]
    fn test_clock_registers_are_read_only() {
        let bank = bank();
        bank.tick_clock(7, 1_700_000_000);

        let request = ModbusPdu::write_single_register(0, 42).unwrap();
        let response = bank.handle_request(1, &request).unwrap();
        assert_eq!(response.exception_code(), Some(0x02));

        let request = ModbusPdu::write_multiple_registers(0, &[1, 2]).unwrap();
        let response = bank.handle_request(1, &request).unwrap();
        assert_eq!(response.exception_code(), Some(0x02));

        // A write beyond the protected pair still lands
        let request = ModbusPdu::write_single_register(2, 42).unwrap();
        let response = bank.handle_request(1, &request).unwrap();
        assert!(!response.is_exception());
    }

    #[test]
    fn test_tick_clock_updates_tables() {
        let bank = bank();
        bank.tick_clock(0x0001_0002, 0x0003_0004);

        let request = ModbusPdu::read_request(4, 0, 2).unwrap();
        let response = bank.handle_request(1, &request).unwrap();
        assert_eq!(
            response.parse_registers_response(4, 2).unwrap(),
            vec![0x0001, 0x0002]
        );

        let request = ModbusPdu::read_request(3, 0, 2).unwrap();
        let response = bank.handle_request(1, &request).unwrap();
        assert_eq!(
            response.parse_registers_response(3, 2).unwrap(),
            vec![0x0003, 0x0004]
        );
    }

    #[test]
    fn test_unknown_function_code() {
        let bank = bank();
        let request = ModbusPdu::from_slice(&[0x2B, 0x00]).unwrap();
        let response = bank.handle_request(1, &request).unwrap();
        assert_eq!(response.exception_code(), Some(0x01));
    }

    #[tokio::test]
    async fn test_tcp_server_serves_and_cancels() {
        let bank = std::sync::Arc::new(RegisterBank::new(1));
        bank.set_holding(10, &[0xAAAA]);

        let server = ModbusTcpServer::bind("127.0.0.1:0", bank).await.unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server.run(cancel.clone()));

        let mut socket = TcpStream::connect(addr).await.unwrap();
        let request = ModbusPdu::read_request(3, 10, 1).unwrap();
        let frame = encode_mbap(7, 1, &request);
        socket.write_all(&frame).await.unwrap();

        let mut response = vec![0u8; MBAP_HEADER_LEN + 4];
        socket.read_exact(&mut response).await.unwrap();
        assert_eq!(u16::from_be_bytes([response[0], response[1]]), 7);
        assert_eq!(&response[MBAP_HEADER_LEN..], &[0x03, 0x02, 0xAA, 0xAA]);

        cancel.cancel();
        handle.await.unwrap();
    }
}
