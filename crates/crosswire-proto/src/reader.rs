//! Packet readers: one for stream transports, one for datagrams.
//!
//! The stream reader consumes exactly one packet from an async byte stream:
//! type/flag byte, bounded length varint, then exactly `length` body bytes.
//! The datagram reader parses a whole datagram that was already read from
//! the socket, checking the `0x51 0x70` preamble first.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    error::FrameError,
    header::{FixedHeader, Protocol, UDP_PREAMBLE},
    packets::Packet,
    varint::MAX_VARINT_28,
};

async fn read_exact_or_short<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(FrameError::ShortRead { wanted: buf.len(), got: filled });
        }
        filled += n;
    }
    Ok(())
}

async fn read_varint_stream<R>(
    reader: &mut R,
    max_bytes: usize,
    raw: &mut Vec<u8>,
) -> Result<u64, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut value = 0u64;
    let mut shift = 0u32;
    let mut byte = [0u8; 1];

    for _ in 0..max_bytes {
        reader.read_exact(&mut byte).await?;
        raw.push(byte[0]);
        value |= u64::from(byte[0] & 0x7F) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
    Err(FrameError::VarintOverflow { max: max_bytes })
}

/// Read one complete packet from a stream transport (TCP or TLS).
///
/// `auto_crypt` is the connection's payload-crypt policy, applied to command
/// packets. Unknown message types and malformed headers abort without
/// consuming the rest of the stream state.
pub async fn read_stream_packet<R>(reader: &mut R, auto_crypt: bool) -> Result<Packet, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut first = [0u8; 1];
    reader.read_exact(&mut first).await?;
    let (message_type, flag) = FixedHeader::split_type_flag(first[0])?;

    let mut raw = vec![first[0]];
    let length = read_varint_stream(reader, MAX_VARINT_28, &mut raw).await?;

    let header = FixedHeader { message_type, flag, length, protocol: Protocol::Tcp, raw };

    let mut body = vec![0u8; length as usize];
    read_exact_or_short(reader, &mut body).await?;

    let mut packet = Packet::from_header(header, auto_crypt);
    packet.unpack_body(&body)?;
    Ok(packet)
}

/// Parse one complete packet from a datagram.
///
/// The whole datagram must already be in memory (the socket layer reads up
/// to [`crate::MAX_DATAGRAM`] bytes). Bytes past the declared length are
/// ignored. `auto_crypt` defaults to on for datagram peers; pass the
/// connection's policy where one exists.
pub fn read_datagram_packet(datagram: &[u8], auto_crypt: bool) -> Result<Packet, FrameError> {
    if datagram.len() < 3 {
        return Err(FrameError::ShortRead { wanted: 3, got: datagram.len() });
    }
    let preamble = [datagram[0], datagram[1]];
    if preamble != UDP_PREAMBLE {
        return Err(FrameError::PreambleMismatch { found: preamble });
    }

    let (mut header, used) = FixedHeader::unpack(datagram[2], &datagram[3..])?;
    header.protocol = Protocol::Udp;

    let mut raw = UDP_PREAMBLE.to_vec();
    raw.append(&mut header.raw);
    header.raw = raw;

    let body_start = 3 + used;
    let wanted = header.length as usize;
    let rest = &datagram[body_start..];
    if rest.len() < wanted {
        return Err(FrameError::ShortRead { wanted, got: rest.len() });
    }

    let mut packet = Packet::from_header(header, auto_crypt);
    packet.unpack_body(&rest[..wanted])?;
    Ok(packet)
}
