//! pkt-line framing.
//!
//! Each packet is four lowercase hex digits giving the total length
//! (prefix included) followed by the payload. `0000` is a flush packet.

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload a single packet can carry
pub const MAX_PAYLOAD: usize = 65516;

/// Number of `have` lines sent before each flush
pub const HAVE_BATCH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Data(Vec<u8>),
    Flush,
}

impl Packet {
    /// A text line; a trailing newline is added
    pub fn line(text: impl AsRef<str>) -> Self {
        let mut data = text.as_ref().as_bytes().to_vec();
        data.push(b'\n');
        Packet::Data(data)
    }

    /// Payload text with the trailing newline removed, if this is a data packet
    pub fn text(&self) -> Option<String> {
        match self {
            Packet::Data(data) => {
                let data = data.strip_suffix(b"\n").unwrap_or(&data[..]);
                Some(String::from_utf8_lossy(data).into_owned())
            }
            Packet::Flush => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Packet::Flush => Ok(b"0000".to_vec()),
            Packet::Data(data) => {
                if data.len() > MAX_PAYLOAD {
                    return Err(SyncError::protocol(format!(
                        "packet payload of {} bytes exceeds {}",
                        data.len(),
                        MAX_PAYLOAD
                    )));
                }
                let mut out = format!("{:04x}", data.len() + 4).into_bytes();
                out.extend_from_slice(data);
                Ok(out)
            }
        }
    }
}

/// Split a large payload (a pack) into data packets
pub fn chunk(data: &[u8]) -> Vec<Packet> {
    data.chunks(MAX_PAYLOAD).map(|c| Packet::Data(c.to_vec())).collect()
}

/// Decode one packet from the front of `buf`, returning it and the bytes consumed.
/// `Ok(None)` means more input is needed.
pub fn decode(buf: &[u8]) -> Result<Option<(Packet, usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = parse_len(&buf[..4])?;
    if len == 0 {
        return Ok(Some((Packet::Flush, 4)));
    }
    if buf.len() < len {
        return Ok(None);
    }
    Ok(Some((Packet::Data(buf[4..len].to_vec()), len)))
}

fn parse_len(prefix: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(prefix).map_err(|_| SyncError::protocol("non-ascii pkt-line length"))?;
    let len = usize::from_str_radix(text, 16)
        .map_err(|_| SyncError::protocol(format!("bad pkt-line length {:?}", text)))?;
    match len {
        0 => Ok(0),
        1..=4 => Err(SyncError::protocol(format!("reserved pkt-line length {}", len))),
        _ if len - 4 > MAX_PAYLOAD => Err(SyncError::protocol(format!("pkt-line length {} too large", len))),
        _ => Ok(len),
    }
}

/// A bidirectional packet channel to a peer.
///
/// Streaming transports write straight through; request/response
/// transports buffer writes until the next read.
#[async_trait]
pub trait PacketIo: Send {
    async fn read_packet(&mut self) -> Result<Packet>;
    async fn write_packet(&mut self, packet: &Packet) -> Result<()>;
    /// Push buffered output to the peer
    async fn flush(&mut self) -> Result<()>;

    /// Read data packets up to the next flush
    async fn read_until_flush(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        loop {
            match self.read_packet().await? {
                Packet::Data(data) => out.push(data),
                Packet::Flush => return Ok(out),
            }
        }
    }

    async fn write_lines(&mut self, lines: &[String]) -> Result<()> {
        for line in lines {
            self.write_packet(&Packet::line(line)).await?;
        }
        self.write_packet(&Packet::Flush).await
    }
}

fn hangup(e: std::io::Error) -> SyncError {
    SyncError::Transport(format!("connection lost: {}", e))
}

/// Packet channel over a byte stream pair
pub struct PacketStream<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> PacketStream<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

#[async_trait]
impl<R, W> PacketIo for PacketStream<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn read_packet(&mut self) -> Result<Packet> {
        let mut prefix = [0u8; 4];
        self.reader.read_exact(&mut prefix).await.map_err(hangup)?;
        let len = parse_len(&prefix)?;
        if len == 0 {
            return Ok(Packet::Flush);
        }
        let mut payload = vec![0u8; len - 4];
        self.reader.read_exact(&mut payload).await.map_err(hangup)?;
        Ok(Packet::Data(payload))
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        self.writer.write_all(&packet.encode()?).await.map_err(hangup)
    }

    async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await.map_err(hangup)
    }
}
