//! Modbus master
//!
//! Drives one transport, one request at a time. The owning worker decides
//! when to open, read and close; the master enforces the per-request
//! deadline, the retry policy for timeouts and framing errors, and the
//! inter-command gap that slow slaves need between transactions.
//!
//! State machine: `IDLE → OPENING → OPEN → (request⇄response)* → CLOSING →
//! IDLE`. Opening failure falls back to `IDLE`; only `IDLE` accepts another
//! open.

use tokio::time::Instant;
use tracing::{debug, warn};

use gridflux_comlink::{LinkError, Result};

use super::connection::ModbusConnection;
use super::frame::{FrameCodec, FrameMode};
use super::pdu::ModbusPdu;
use super::types::{MasterConfig, MasterEndpoint, RegKind, RegisterBlock};

/// Lifecycle state of a master
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Idle,
    Opening,
    Open,
    Closing,
}

/// Raw traffic counters, snapshot-copyable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// A single-flight Modbus master over TCP or RTU
pub struct ModbusMaster {
    config: MasterConfig,
    framer: FrameCodec,
    conn: Option<ModbusConnection>,
    state: MasterState,
    last_transaction: Option<Instant>,
    stats: LinkStats,
}

impl ModbusMaster {
    pub fn new(config: MasterConfig) -> Self {
        let mode = match config.endpoint {
            MasterEndpoint::Tcp { .. } => FrameMode::Tcp,
            MasterEndpoint::Rtu(_) => FrameMode::Rtu,
        };
        Self {
            config,
            framer: FrameCodec::new(mode),
            conn: None,
            state: MasterState::Idle,
            last_transaction: None,
            stats: LinkStats::default(),
        }
    }

    pub fn state(&self) -> MasterState {
        self.state
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    /// Open the transport; the backup endpoint is tried when the primary
    /// cannot be reached
    pub async fn open(&mut self) -> Result<()> {
        if self.state != MasterState::Idle {
            return Err(LinkError::protocol(format!(
                "open in state {:?}",
                self.state
            )));
        }
        self.state = MasterState::Opening;

        let result = match &self.config.endpoint {
            MasterEndpoint::Tcp { primary, backup } => {
                match ModbusConnection::connect_tcp(&primary.host, primary.port, self.config.timeout)
                    .await
                {
                    Ok(conn) => Ok(conn),
                    Err(primary_err) => match backup {
                        Some(backup) => {
                            warn!(%primary_err, backup = %backup, "primary endpoint down, trying backup");
                            ModbusConnection::connect_tcp(
                                &backup.host,
                                backup.port,
                                self.config.timeout,
                            )
                            .await
                        }
                        None => Err(primary_err),
                    },
                }
            }
            MasterEndpoint::Rtu(serial) => ModbusConnection::connect_rtu(serial).await,
        };

        match result {
            Ok(conn) => {
                self.conn = Some(conn);
                self.state = MasterState::Open;
                Ok(())
            }
            Err(e) => {
                self.state = MasterState::Idle;
                Err(e)
            }
        }
    }

    /// Close the transport and return to IDLE; safe to call repeatedly
    pub async fn close(&mut self) {
        if self.state == MasterState::Idle {
            return;
        }
        self.state = MasterState::Closing;
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
        self.framer.abort_pending();
        self.state = MasterState::Idle;
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Read `quantity` entries from one of the four tables
    pub async fn read(
        &mut self,
        unit_id: u8,
        kind: RegKind,
        address: u16,
        quantity: u16,
    ) -> Result<RegisterBlock> {
        let function = kind.read_function();
        let request = ModbusPdu::read_request(function, address, quantity)?;
        let response = self.transact(unit_id, request).await?;
        if kind.is_bit_kind() {
            Ok(RegisterBlock::Bits(
                response.parse_bits_response(function, quantity)?,
            ))
        } else {
            Ok(RegisterBlock::Words(
                response.parse_registers_response(function, quantity)?,
            ))
        }
    }

    pub async fn read_words(
        &mut self,
        unit_id: u8,
        kind: RegKind,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u16>> {
        match self.read(unit_id, kind, address, quantity).await? {
            RegisterBlock::Words(words) => Ok(words),
            RegisterBlock::Bits(_) => Err(LinkError::KindMismatch {
                want: "registers",
                got: "coils",
            }),
        }
    }

    pub async fn read_bits(
        &mut self,
        unit_id: u8,
        kind: RegKind,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>> {
        match self.read(unit_id, kind, address, quantity).await? {
            RegisterBlock::Bits(bits) => Ok(bits),
            RegisterBlock::Words(_) => Err(LinkError::KindMismatch {
                want: "coils",
                got: "registers",
            }),
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// FC 5
    pub async fn write_coil(&mut self, unit_id: u8, address: u16, value: bool) -> Result<()> {
        let request = ModbusPdu::write_single_coil(address, value)?;
        self.transact(unit_id, request).await.map(|_| ())
    }

    /// FC 6
    pub async fn write_register(&mut self, unit_id: u8, address: u16, value: u16) -> Result<()> {
        let request = ModbusPdu::write_single_register(address, value)?;
        self.transact(unit_id, request).await.map(|_| ())
    }

    /// FC 15
    pub async fn write_coils(&mut self, unit_id: u8, address: u16, values: &[bool]) -> Result<()> {
        let request = ModbusPdu::write_multiple_coils(address, values)?;
        self.transact(unit_id, request).await.map(|_| ())
    }

    /// FC 16
    pub async fn write_registers(
        &mut self,
        unit_id: u8,
        address: u16,
        values: &[u16],
    ) -> Result<()> {
        let request = ModbusPdu::write_multiple_registers(address, values)?;
        self.transact(unit_id, request).await.map(|_| ())
    }

    // ========================================================================
    // Transaction core
    // ========================================================================

    /// Run one request/response exchange with retry and the send gap
    async fn transact(&mut self, unit_id: u8, request: ModbusPdu) -> Result<ModbusPdu> {
        if self.state != MasterState::Open {
            return Err(LinkError::NotConnected);
        }

        self.enforce_send_gap().await;

        let mut attempt = 0u32;
        let result = loop {
            match self.transact_once(unit_id, &request).await {
                Ok(response) => break Ok(response),
                Err(e) if e.is_retryable() && attempt < self.config.retry_max => {
                    attempt += 1;
                    debug!(
                        unit_id,
                        function_code = request.function_code().unwrap_or(0),
                        attempt,
                        error = %e,
                        "retrying request"
                    );
                    self.framer.abort_pending();
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => break Err(e),
            }
        };

        self.last_transaction = Some(Instant::now());
        result
    }

    async fn transact_once(&mut self, unit_id: u8, request: &ModbusPdu) -> Result<ModbusPdu> {
        let deadline = self.config.timeout;
        let conn = self.conn.as_mut().ok_or(LinkError::NotConnected)?;

        let frame = self.framer.build_request(unit_id, request);
        conn.send(&frame, deadline).await?;
        self.stats.bytes_sent += frame.len() as u64;

        let raw = conn.recv_frame(deadline).await?;
        self.stats.bytes_received += raw.len() as u64;

        let (_, response) = self.framer.parse_response(&raw)?;
        if response.is_exception() {
            return Err(LinkError::exception(
                response.function_code().unwrap_or(0),
                response.exception_code().unwrap_or(0),
            ));
        }
        Ok(response)
    }

    /// Honour the fixed inter-command gap after the previous transaction
    async fn enforce_send_gap(&mut self) {
        if let Some(last) = self.last_transaction {
            let elapsed = last.elapsed();
            if elapsed < self.config.send_interval {
                tokio::time::sleep(self.config.send_interval - elapsed).await;
            }
        }
    }
}

impl std::fmt::Debug for ModbusMaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusMaster")
            .field("endpoint", &self.config.endpoint.display_name())
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish()
    }
}
