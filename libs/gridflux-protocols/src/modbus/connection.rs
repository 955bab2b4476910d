//! Modbus connection I/O
//!
//! One type for both transports. The connection owns its socket or serial
//! line, exposes send/receive with a per-call deadline, and reports a
//! read-closed peer as an error on the next operation. It never retries;
//! retry policy belongs to the client above it.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use gridflux_comlink::{LinkError, Result};

use super::constants::{MAX_MBAP_LENGTH, MBAP_HEADER_LEN, RESPONSE_BUFFER_SIZE, RTU_CHAR_BITS};
use super::types::{Parity, SerialConfig};

/// An open Modbus transport
#[derive(Debug)]
pub enum ModbusConnection {
    Tcp(TcpStream),
    Rtu {
        port: SerialStream,
        /// 3.5 character times at the configured baud rate
        inter_frame_silence: Duration,
    },
}

impl ModbusConnection {
    /// Open a TCP connection
    pub async fn connect_tcp(host: &str, port: u16, deadline: Duration) -> Result<Self> {
        let addr = format!("{host}:{port}");
        debug!(%addr, "TCP connecting");

        match timeout(deadline, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY: {}", e);
                }
                info!(%addr, "TCP connected");
                Ok(ModbusConnection::Tcp(stream))
            }
            Ok(Err(e)) => Err(LinkError::connection(format!(
                "failed to connect to {addr}: {e}"
            ))),
            Err(_) => Err(LinkError::timeout(format!("connection to {addr} timed out"))),
        }
    }

    /// Open a serial line
    pub async fn connect_rtu(serial: &SerialConfig) -> Result<Self> {
        debug!(device = %serial.device, baud = serial.baud, "RTU opening");

        let parity = match serial.parity {
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::None => tokio_serial::Parity::None,
        };
        let data_bits = match serial.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match serial.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        let port = tokio_serial::new(&serial.device, serial.baud)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .open_native_async()
            .map_err(|e| {
                LinkError::connection(format!(
                    "failed to open serial port {}: {e}",
                    serial.device
                ))
            })?;

        info!(device = %serial.device, "RTU opened");
        Ok(ModbusConnection::Rtu {
            port,
            inter_frame_silence: inter_frame_silence(serial.baud),
        })
    }

    /// Send one complete frame
    pub async fn send(&mut self, data: &[u8], deadline: Duration) -> Result<()> {
        match self {
            ModbusConnection::Tcp(stream) => {
                timeout(deadline, stream.write_all(data))
                    .await
                    .map_err(|_| LinkError::timeout("TCP send timeout"))?
                    .map_err(|e| LinkError::io(format!("TCP send error: {e}")))?;
            }
            ModbusConnection::Rtu { port, .. } => {
                timeout(deadline, async {
                    port.write_all(data).await?;
                    port.flush().await
                })
                .await
                .map_err(|_| LinkError::timeout("serial send timeout"))?
                .map_err(|e| LinkError::io(format!("serial send error: {e}")))?;
            }
        }
        debug!(bytes = data.len(), "TX");
        Ok(())
    }

    /// Receive one complete frame
    ///
    /// TCP reads the MBAP header, validates the length field and reads the
    /// remainder. RTU accumulates bytes until the line has been silent for
    /// 3.5 character times.
    pub async fn recv_frame(&mut self, deadline: Duration) -> Result<Vec<u8>> {
        match self {
            ModbusConnection::Tcp(stream) => {
                let mut header = [0u8; MBAP_HEADER_LEN];
                timeout(deadline, stream.read_exact(&mut header))
                    .await
                    .map_err(|_| LinkError::timeout("TCP header read timeout"))?
                    .map_err(map_read_closed)?;

                let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
                if length == 0 || length > MAX_MBAP_LENGTH {
                    return Err(LinkError::protocol(format!(
                        "invalid MBAP length: {length}"
                    )));
                }

                let mut frame = vec![0u8; MBAP_HEADER_LEN + length];
                frame[..MBAP_HEADER_LEN].copy_from_slice(&header);
                timeout(deadline, stream.read_exact(&mut frame[MBAP_HEADER_LEN..]))
                    .await
                    .map_err(|_| LinkError::timeout("TCP body read timeout"))?
                    .map_err(map_read_closed)?;

                debug!(bytes = frame.len(), "RX");
                Ok(frame)
            }
            ModbusConnection::Rtu {
                port,
                inter_frame_silence,
            } => {
                let silence = *inter_frame_silence;
                let mut buffer = [0u8; RESPONSE_BUFFER_SIZE];
                let mut total = 0usize;
                let started = tokio::time::Instant::now();

                loop {
                    let remaining = deadline.saturating_sub(started.elapsed());
                    if remaining.is_zero() {
                        if total >= 4 {
                            break;
                        }
                        return Err(LinkError::timeout("RTU frame read timeout"));
                    }

                    // The first byte may take until the deadline; once the
                    // frame has started, its end is 3.5 chars of silence
                    let slice_timeout = if total == 0 { remaining } else { silence };

                    match timeout(slice_timeout, port.read(&mut buffer[total..])).await {
                        Ok(Ok(0)) => {
                            return Err(LinkError::connection("serial line closed"));
                        }
                        Ok(Ok(n)) => {
                            total += n;
                            if total >= buffer.len() {
                                return Err(LinkError::protocol("RTU frame exceeds buffer"));
                            }
                        }
                        Ok(Err(e)) => {
                            return Err(LinkError::io(format!("serial read error: {e}")));
                        }
                        Err(_) if total >= 4 => break,
                        Err(_) if total > 0 => {
                            warn!(bytes = total, "discarding RTU fragment");
                            return Err(LinkError::protocol("RTU fragment shorter than a frame"));
                        }
                        Err(_) => {
                            return Err(LinkError::timeout("RTU frame read timeout"));
                        }
                    }
                }

                debug!(bytes = total, "RX");
                Ok(buffer[..total].to_vec())
            }
        }
    }

    /// Close the connection, releasing the socket or the line
    pub async fn close(&mut self) {
        if let ModbusConnection::Tcp(stream) = self {
            let _ = stream.shutdown().await;
        }
        // The serial handle is released on drop
    }
}

/// A peer that closed its read side surfaces as UnexpectedEof
fn map_read_closed(e: std::io::Error) -> LinkError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        LinkError::connection("peer closed the connection")
    } else {
        LinkError::io(format!("read error: {e}"))
    }
}

/// 3.5 character times, floored at 1.75 ms per the RTU specification
fn inter_frame_silence(baud: u32) -> Duration {
    if baud == 0 || baud > 19_200 {
        return Duration::from_micros(1_750);
    }
    let micros = (u64::from(RTU_CHAR_BITS) * 3_500_000 / u64::from(baud)).max(1_750);
    Duration::from_micros(micros)
}
