//! Audio/video frame packet.
//!
//! Variable header layout:
//!
//! ```text
//! (i_frame << 7) | av_format : 1B | enc_type : 1B |
//! av_channel:varint | av_seq:varint | timestamp:varint(≤9B) | enc_length:varint
//! ```
//!
//! Unlike command packets, media frames default to auto-crypt **off**: the
//! capture pipeline usually owns frame encryption. The per-packet key is
//! derived from `(av_seq, timestamp, av_channel)` when auto-crypt is on.

use crosswire_crypto::{CipherSuite, DERIVED_LEN, decrypt, encrypt, media_key};

use crate::{
    error::FrameError,
    header::{FixedHeader, MessageType},
    packets::{check_field, take_u8, take_varint},
    varint::{MAX_VARINT_28, MAX_VARINT_64, encode_varint},
};

/// Media payload formats. Video formats occupy the low ids, audio formats
/// the sparse tens used by the wire dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum AvFormat {
    H264 = 1,
    H265 = 2,
    Mpeg = 3,
    Mjpeg = 4,
    G711a = 21,
    Ulaw = 31,
    G711u = 41,
    Opus = 51,
    Adpcm = 61,
    G721 = 71,
    G723 = 81,
    G726 = 91,
    Aac = 101,
    Speex = 111,
    Pcm = 121,
}

impl AvFormat {
    /// Parse a wire format id.
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(Self::H264),
            2 => Ok(Self::H265),
            3 => Ok(Self::Mpeg),
            4 => Ok(Self::Mjpeg),
            21 => Ok(Self::G711a),
            31 => Ok(Self::Ulaw),
            41 => Ok(Self::G711u),
            51 => Ok(Self::Opus),
            61 => Ok(Self::Adpcm),
            71 => Ok(Self::G721),
            81 => Ok(Self::G723),
            91 => Ok(Self::G726),
            101 => Ok(Self::Aac),
            111 => Ok(Self::Speex),
            121 => Ok(Self::Pcm),
            other => Err(FrameError::InvalidField { field: "av_format", value: other }),
        }
    }

    /// Wire id of this format; always fits the 7 available bits.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Audio/video frame packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvPacket {
    /// Fixed header.
    pub header: FixedHeader,
    /// Whether pack/unpack runs payload AES automatically. Defaults to off.
    pub auto_crypt: bool,
    /// True when this frame is a key frame.
    pub i_frame: bool,
    /// Media format of the payload.
    pub format: AvFormat,
    /// Payload cipher suite.
    pub suite: CipherSuite,
    /// Channel number within the stream.
    pub av_channel: u64,
    /// Frame sequence number.
    pub av_seq: u64,
    /// Media timestamp; at most 63 bits (9-byte varint on the wire).
    pub timestamp: u64,
    /// Length of the encrypted span; zero means the whole payload.
    pub enc_length: u64,
    /// Variable-header bytes as emitted or consumed, for diagnostics.
    pub var_header: Vec<u8>,
    /// Plaintext payload.
    pub payload: Vec<u8>,
    /// Payload bytes exactly as they appeared on the wire.
    pub raw_payload: Vec<u8>,
}

impl AvPacket {
    /// New media frame of the given format.
    pub fn new(format: AvFormat) -> Self {
        let mut packet = Self::with_header(FixedHeader::new(MessageType::Av));
        packet.format = format;
        packet
    }

    pub(crate) fn with_header(header: FixedHeader) -> Self {
        Self {
            header,
            auto_crypt: false,
            i_frame: false,
            format: AvFormat::H264,
            suite: CipherSuite::None,
            av_channel: 0,
            av_seq: 0,
            timestamp: 0,
            enc_length: 0,
            var_header: Vec::new(),
            payload: Vec::new(),
            raw_payload: Vec::new(),
        }
    }

    /// Key/IV material derived from this frame's header fields.
    pub fn derived_key(&self) -> [u8; DERIVED_LEN] {
        media_key(self.av_seq, self.timestamp, self.av_channel)
    }

    /// Encode the packet.
    pub fn pack(&mut self) -> Result<Vec<u8>, FrameError> {
        check_field("av_channel", self.av_channel)?;
        check_field("av_seq", self.av_seq)?;
        check_field("enc_length", self.enc_length)?;

        let mut var = Vec::with_capacity(16);
        var.push((u8::from(self.i_frame) << 7) | self.format.as_u8());
        var.push(self.suite.as_u8());
        encode_varint(self.av_channel, &mut var);
        encode_varint(self.av_seq, &mut var);
        encode_varint(self.timestamp, &mut var);
        encode_varint(self.enc_length, &mut var);

        let body = if !self.payload.is_empty() && self.auto_crypt {
            let key = self.derived_key();
            encrypt(self.suite, &key, &key, &self.payload)?
        } else {
            self.payload.clone()
        };

        self.header.length = (var.len() + body.len()) as u64;
        let mut out = self.header.pack()?;
        out.extend_from_slice(&var);
        out.extend_from_slice(&body);
        self.var_header = var;
        Ok(out)
    }

    /// Decode the body into this packet.
    pub fn unpack(&mut self, body: &[u8]) -> Result<(), FrameError> {
        let mut offset = 0;

        let packed = take_u8(body, &mut offset)?;
        self.i_frame = packed >> 7 == 1;
        self.format = AvFormat::from_u8(packed & 0x7F)?;

        let suite = take_u8(body, &mut offset)?;
        self.suite = CipherSuite::from_u8(suite)
            .map_err(|_| FrameError::InvalidField { field: "enc_type", value: suite })?;

        self.av_channel = take_varint(body, &mut offset, MAX_VARINT_28)?;
        self.av_seq = take_varint(body, &mut offset, MAX_VARINT_28)?;
        self.timestamp = take_varint(body, &mut offset, MAX_VARINT_64)?;
        self.enc_length = take_varint(body, &mut offset, MAX_VARINT_28)?;

        self.var_header = body[..offset].to_vec();
        self.raw_payload = body[offset..].to_vec();

        self.payload = if !self.raw_payload.is_empty() && self.auto_crypt {
            let key = self.derived_key();
            decrypt(self.suite, &key, &key, &self.raw_payload)?
        } else {
            self.raw_payload.clone()
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AvPacket {
        let mut av = AvPacket::new(AvFormat::H265);
        av.i_frame = true;
        av.av_channel = 2;
        av.av_seq = 5;
        av.timestamp = 1000;
        av.payload = vec![0xDE, 0xAD, 0xBE, 0xEF];
        av
    }

    #[test]
    fn round_trip_without_crypt() {
        let mut av = sample();
        let wire = av.pack().unwrap();

        let mut parsed = AvPacket::with_header(av.header.clone());
        parsed.unpack(&wire[2..]).unwrap();
        assert!(parsed.i_frame);
        assert_eq!(parsed.format, AvFormat::H265);
        assert_eq!(parsed.av_channel, 2);
        assert_eq!(parsed.av_seq, 5);
        assert_eq!(parsed.timestamp, 1000);
        assert_eq!(parsed.payload, av.payload);
        assert_eq!(parsed.raw_payload, av.payload, "auto-crypt defaults off for media");
    }

    #[test]
    fn auto_crypt_round_trip() {
        let mut av = sample();
        av.auto_crypt = true;
        av.suite = CipherSuite::Aes128Cfb;
        let wire = av.pack().unwrap();

        let body = &wire[2..];
        assert_ne!(&body[body.len() - 4..], &av.payload[..]);

        let mut parsed = AvPacket::with_header(av.header.clone());
        parsed.auto_crypt = true;
        parsed.unpack(body).unwrap();
        assert_eq!(parsed.payload, av.payload);
    }

    #[test]
    fn large_timestamp_uses_wide_varint() {
        let mut av = sample();
        av.timestamp = (1 << 63) - 1;
        let wire = av.pack().unwrap();

        let mut parsed = AvPacket::with_header(av.header.clone());
        parsed.unpack(&wire[2..]).unwrap();
        assert_eq!(parsed.timestamp, (1 << 63) - 1);
    }

    #[test]
    fn i_frame_bit_packs_high() {
        let mut av = sample();
        let wire = av.pack().unwrap();
        assert_eq!(wire[2], 0x80 | AvFormat::H265.as_u8());
    }

    #[test]
    fn unknown_format_rejected() {
        let mut av = sample();
        av.payload.clear();
        let wire = av.pack().unwrap();

        let mut body = wire[2..].to_vec();
        body[0] = 0x7F; // no such format

        let mut parsed = AvPacket::with_header(av.header.clone());
        assert_eq!(
            parsed.unpack(&body),
            Err(FrameError::InvalidField { field: "av_format", value: 0x7F })
        );
    }

    #[test]
    fn channel_overflow_rejected() {
        let mut av = sample();
        av.av_channel = u64::from(u32::MAX);
        assert!(matches!(
            av.pack(),
            Err(FrameError::FieldOverflow { field: "av_channel", .. })
        ));
    }
}
