//! USBtin / SLCAN Serial Transport
//!
//! The USBtin adapter speaks the Lawicel SLCAN ASCII protocol over a virtual
//! serial port:
//!
//! ```text
//! C\r                close channel
//! S<n>\r             select bitrate (S1 = 20 kbit/s, the Elster bus rate)
//! O\r                open channel
//! tIIIL<data>\r      standard frame, 3 hex id digits, length digit, data hex
//! TIIIIIIIIL<data>\r extended frame, 8 hex id digits
//! \r / z\r / Z\r     command or transmit acknowledged
//! \a                 command rejected
//! ```

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::traits::{FrameTransport, TransportError, TransportStats};
use crate::protocols::can::CanFrame;

const BELL: u8 = 0x07;
const MAX_LINE_LEN: usize = 64;

/// SLCAN transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlcanConfig {
    /// Transport name for identification
    pub name: String,
    /// Serial device, e.g. `/dev/ttyACM0`
    pub port: String,
    /// Serial baud rate (ignored by CDC-ACM adapters but required by the driver)
    pub baud_rate: u32,
    /// CAN bitrate in kbit/s
    pub bitrate_kbps: u32,
    /// Serial write timeout
    pub write_timeout: Duration,
}

impl Default for SlcanConfig {
    fn default() -> Self {
        Self {
            name: "USBtin".to_string(),
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 115_200,
            bitrate_kbps: 20,
            write_timeout: Duration::from_millis(500),
        }
    }
}

/// Map a bitrate in kbit/s to the SLCAN `S` command digit
pub fn bitrate_code(kbps: u32) -> Option<char> {
    match kbps {
        10 => Some('0'),
        20 => Some('1'),
        50 => Some('2'),
        100 => Some('3'),
        125 => Some('4'),
        250 => Some('5'),
        500 => Some('6'),
        800 => Some('7'),
        1000 => Some('8'),
        _ => None,
    }
}

/// Commands that bring the adapter from any state to an open channel
pub fn init_commands(bitrate_kbps: u32) -> Result<Vec<String>, TransportError> {
    let code = bitrate_code(bitrate_kbps).ok_or_else(|| {
        TransportError::ConfigError(format!("Unsupported CAN bitrate {} kbit/s", bitrate_kbps))
    })?;
    Ok(vec![
        "C\r".to_string(),
        format!("S{}\r", code),
        "O\r".to_string(),
    ])
}

/// Render a frame as one SLCAN transmit command
pub fn encode_frame(frame: &CanFrame) -> String {
    let mut line = if frame.is_extended() {
        format!("T{:08X}{}", frame.id(), frame.dlc())
    } else {
        format!("t{:03X}{}", frame.id(), frame.dlc())
    };
    for byte in frame.data() {
        line.push_str(&format!("{:02X}", byte));
    }
    line.push('\r');
    line
}

/// Something the adapter sent us
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlcanEvent {
    /// Received bus frame
    Frame(CanFrame),
    /// Command or transmission acknowledged
    Ack,
    /// Command rejected (BEL)
    Rejected,
}

fn hex_value(text: &[u8]) -> Result<u32, TransportError> {
    let text = std::str::from_utf8(text)
        .map_err(|_| TransportError::ProtocolError("non-ASCII SLCAN line".to_string()))?;
    u32::from_str_radix(text, 16)
        .map_err(|_| TransportError::ProtocolError(format!("invalid hex '{}'", text)))
}

fn parse_data_frame(line: &[u8], id_digits: usize) -> Result<CanFrame, TransportError> {
    let header = 1 + id_digits + 1;
    if line.len() < header {
        return Err(TransportError::ProtocolError(format!(
            "truncated frame line ({} chars)",
            line.len()
        )));
    }

    let id = hex_value(&line[1..1 + id_digits])?;
    let len = hex_value(&line[header - 1..header])? as usize;
    let data_end = header + len * 2;
    // anything after the data is an optional adapter timestamp
    if len > 8 || line.len() < data_end {
        return Err(TransportError::ProtocolError(format!(
            "bad data length {} in frame line",
            len
        )));
    }

    let mut data = [0u8; 8];
    for (i, byte) in data.iter_mut().take(len).enumerate() {
        let start = header + i * 2;
        *byte = hex_value(&line[start..start + 2])? as u8;
    }

    if id_digits == 3 {
        CanFrame::new_standard(id as u16, &data[..len])
    } else {
        CanFrame::new_extended(id, &data[..len])
    }
}

/// Parse one CR-terminated line (without the terminator)
///
/// `Ok(None)` means the line is valid but carries nothing the gateway needs
/// (version replies, remote frames, status flags).
pub fn parse_line(line: &[u8]) -> Result<Option<SlcanEvent>, TransportError> {
    match line.first() {
        None | Some(b'z') | Some(b'Z') => Ok(Some(SlcanEvent::Ack)),
        Some(b't') => parse_data_frame(line, 3).map(|f| Some(SlcanEvent::Frame(f))),
        Some(b'T') => parse_data_frame(line, 8).map(|f| Some(SlcanEvent::Frame(f))),
        Some(_) => Ok(None),
    }
}

/// Line codec for the SLCAN serial stream
#[derive(Debug, Default)]
pub struct SlcanCodec;

impl Decoder for SlcanCodec {
    type Item = SlcanEvent;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<SlcanEvent>, TransportError> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == b'\r' || *b == BELL) else {
                if src.len() > MAX_LINE_LEN {
                    warn!("Discarding {} bytes of unterminated SLCAN input", src.len());
                    src.clear();
                }
                return Ok(None);
            };

            let line = src.split_to(pos + 1);
            if line[pos] == BELL {
                return Ok(Some(SlcanEvent::Rejected));
            }

            match parse_line(&line[..pos]) {
                Ok(Some(event)) => return Ok(Some(event)),
                Ok(None) => continue,
                Err(e) => {
                    warn!("Ignoring SLCAN line: {}", e);
                    continue;
                },
            }
        }
    }
}

impl Encoder<CanFrame> for SlcanCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: CanFrame, dst: &mut BytesMut) -> Result<(), TransportError> {
        dst.put_slice(encode_frame(&frame).as_bytes());
        Ok(())
    }
}

/// USBtin transport: frames in via a reader task, frames out via `send`
pub struct SlcanTransport {
    config: SlcanConfig,
    writer: tokio::sync::Mutex<FramedWrite<WriteHalf<SerialStream>, SlcanCodec>>,
    stats: Arc<Mutex<TransportStats>>,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl SlcanTransport {
    /// Open the serial port, initialise the adapter and start forwarding frames
    pub async fn open(
        config: SlcanConfig,
        inbound: mpsc::Sender<CanFrame>,
        cancel: CancellationToken,
    ) -> Result<Self, TransportError> {
        let commands = init_commands(config.bitrate_kbps)?;

        debug!("Opening serial port: {}", config.port);
        let mut port = tokio_serial::new(&config.port, config.baud_rate)
            .timeout(config.write_timeout)
            .open_native_async()
            .map_err(|e| {
                TransportError::ConnectionFailed(format!(
                    "Failed to open serial port {}: {e}",
                    config.port
                ))
            })?;

        #[cfg(unix)]
        port.set_exclusive(false).map_err(|e| {
            TransportError::IoError(format!("Failed to set exclusive mode: {e}"))
        })?;

        for command in &commands {
            port.write_all(command.as_bytes()).await?;
        }
        port.flush().await?;

        let (read_half, write_half) = tokio::io::split(port);
        let stats = Arc::new(Mutex::new(TransportStats::default()));
        let open = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(read_loop(
            FramedRead::new(read_half, SlcanCodec),
            inbound,
            Arc::clone(&stats),
            Arc::clone(&open),
            cancel,
        ));

        info!(
            "Opened {} on {} at {} kbit/s",
            config.name, config.port, config.bitrate_kbps
        );

        Ok(Self {
            writer: tokio::sync::Mutex::new(FramedWrite::new(write_half, SlcanCodec)),
            config,
            stats,
            open,
            reader,
        })
    }

    /// Close the CAN channel and stop the reader
    pub async fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let port = writer.get_mut();
        if let Err(e) = port.write_all(b"C\r").await {
            debug!("Close command not delivered: {}", e);
        }
        self.reader.abort();
        info!("Closed {}", self.config.port);
    }
}

impl fmt::Debug for SlcanTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlcanTransport")
            .field("config", &self.config)
            .field("open", &self.open.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Drop for SlcanTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    mut frames: FramedRead<ReadHalf<SerialStream>, SlcanCodec>,
    inbound: mpsc::Sender<CanFrame>,
    stats: Arc<Mutex<TransportStats>>,
    open: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = frames.next() => match next {
                Some(Ok(SlcanEvent::Frame(frame))) => {
                    stats.lock().record_received();
                    debug!("SLCAN rx {}", frame);
                    if inbound.send(frame).await.is_err() {
                        debug!("Frame receiver dropped, stopping SLCAN reader");
                        break;
                    }
                },
                Some(Ok(SlcanEvent::Ack)) => {},
                Some(Ok(SlcanEvent::Rejected)) => {
                    stats.lock().record_receive_error();
                    warn!("USBtin rejected a command");
                },
                Some(Err(e)) => {
                    stats.lock().record_receive_error();
                    error!("Serial read failed: {}", e);
                    break;
                },
                None => {
                    warn!("Serial port closed");
                    break;
                },
            },
        }
    }
    open.store(false, Ordering::Release);
}

#[async_trait]
impl FrameTransport for SlcanTransport {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(TransportError::NotOpen);
        }

        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(self.config.write_timeout, writer.send(*frame)).await {
            Ok(Ok(())) => {
                self.stats.lock().record_sent();
                debug!("SLCAN tx {}", frame);
                Ok(())
            },
            Ok(Err(e)) => {
                self.stats.lock().record_send_error();
                error!("Failed to send frame {}: {}", frame, e);
                Err(TransportError::SendFailed(e.to_string()))
            },
            Err(_) => {
                self.stats.lock().record_send_error();
                Err(TransportError::SendFailed(format!(
                    "write timed out after {:?}",
                    self.config.write_timeout
                )))
            },
        }
    }

    fn stats(&self) -> TransportStats {
        self.stats.lock().clone()
    }
}
