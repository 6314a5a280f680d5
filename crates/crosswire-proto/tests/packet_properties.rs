//! Property-based tests for packet encoding/decoding.
//!
//! Verifies round-trip identity for every packet family over arbitrary
//! field values and payloads, for both stream and datagram framing, and the
//! on-wire ciphertext property for auto-crypted command packets.

use crosswire_proto::{
    AvFormat, AvPacket, CipherSuite, CmdPacket, CustomerPacket, FilePacket, MAX_FIELD_VALUE,
    MessageType, Packet, Protocol, RpcKind, read_datagram_packet, read_stream_packet,
};
use proptest::prelude::*;

fn arbitrary_suite() -> impl Strategy<Value = CipherSuite> {
    prop_oneof![
        Just(CipherSuite::None),
        Just(CipherSuite::Aes128Cbc),
        Just(CipherSuite::Aes192Cbc),
        Just(CipherSuite::Aes256Cbc),
        Just(CipherSuite::Aes128Cfb),
        Just(CipherSuite::Aes192Cfb),
        Just(CipherSuite::Aes256Cfb),
    ]
}

fn arbitrary_format() -> impl Strategy<Value = AvFormat> {
    prop_oneof![
        Just(AvFormat::H264),
        Just(AvFormat::H265),
        Just(AvFormat::Mjpeg),
        Just(AvFormat::G711a),
        Just(AvFormat::Opus),
        Just(AvFormat::Aac),
        Just(AvFormat::Pcm),
    ]
}

fn arbitrary_cmd() -> impl Strategy<Value = CmdPacket> {
    (
        0..=MAX_FIELD_VALUE,
        0..=MAX_FIELD_VALUE,
        0..=MAX_FIELD_VALUE,
        arbitrary_suite(),
        any::<bool>(),
        prop::collection::vec(any::<u8>(), 0..512),
        any::<bool>(),
    )
        .prop_map(|(cmd_seq, cmd_id, code, suite, response, payload, json)| {
            let message_type = if json { MessageType::CmdJson } else { MessageType::CmdBinary };
            let mut cmd = CmdPacket::new(message_type);
            cmd.cmd_seq = cmd_seq;
            cmd.cmd_id = cmd_id;
            cmd.suite = suite;
            cmd.payload = payload;
            if response {
                cmd.rpc_kind = RpcKind::Response;
                cmd.code = code;
            }
            cmd
        })
}

fn arbitrary_av() -> impl Strategy<Value = AvPacket> {
    (
        any::<bool>(),
        arbitrary_format(),
        0..=MAX_FIELD_VALUE,
        0..=MAX_FIELD_VALUE,
        // timestamps are bounded by the 9-byte varint decode width
        0..(1u64 << 63),
        prop::collection::vec(any::<u8>(), 0..512),
    )
        .prop_map(|(i_frame, format, av_channel, av_seq, timestamp, payload)| {
            let mut av = AvPacket::new(format);
            av.i_frame = i_frame;
            av.av_channel = av_channel;
            av.av_seq = av_seq;
            av.timestamp = timestamp;
            av.payload = payload;
            av
        })
}

proptest! {
    #[test]
    fn cmd_stream_round_trip(mut cmd in arbitrary_cmd()) {
        let wire = cmd.pack().expect("pack");

        let rt = tokio::runtime::Builder::new_current_thread().build().expect("rt");
        let packet = rt
            .block_on(read_stream_packet(&mut &wire[..], true))
            .expect("decode");

        let Packet::Cmd(parsed) = packet else { panic!("expected CMD") };
        prop_assert_eq!(parsed.cmd_seq, cmd.cmd_seq);
        prop_assert_eq!(parsed.cmd_id, cmd.cmd_id);
        prop_assert_eq!(parsed.rpc_kind, cmd.rpc_kind);
        prop_assert_eq!(parsed.code, cmd.code);
        prop_assert_eq!(parsed.suite, cmd.suite);
        prop_assert_eq!(&parsed.payload, &cmd.payload);
    }

    #[test]
    fn cmd_wire_payload_is_ciphertext(mut cmd in arbitrary_cmd()) {
        prop_assume!(!cmd.payload.is_empty());
        prop_assume!(cmd.suite != CipherSuite::None);

        let wire = cmd.pack().expect("pack");
        let body = &wire[wire.len() - cmd.header.length as usize..];
        let on_wire_payload = &body[cmd.var_header.len()..];
        prop_assert_ne!(on_wire_payload, &cmd.payload[..]);
    }

    #[test]
    fn cmd_datagram_round_trip(mut cmd in arbitrary_cmd()) {
        // stay inside a single datagram
        prop_assume!(cmd.payload.len() <= 1024);
        cmd.header.protocol = Protocol::Udp;
        let wire = cmd.pack().expect("pack");
        prop_assert_eq!(&wire[..2], &[0x51, 0x70][..]);

        let packet = read_datagram_packet(&wire, true).expect("decode");
        let Packet::Cmd(parsed) = packet else { panic!("expected CMD") };
        prop_assert_eq!(&parsed.payload, &cmd.payload);
        prop_assert_eq!(parsed.header.protocol, Protocol::Udp);
    }

    #[test]
    fn av_stream_round_trip(mut av in arbitrary_av()) {
        let wire = av.pack().expect("pack");

        let rt = tokio::runtime::Builder::new_current_thread().build().expect("rt");
        let packet = rt
            .block_on(read_stream_packet(&mut &wire[..], false))
            .expect("decode");

        let Packet::Av(parsed) = packet else { panic!("expected AV") };
        prop_assert_eq!(parsed.i_frame, av.i_frame);
        prop_assert_eq!(parsed.format, av.format);
        prop_assert_eq!(parsed.av_channel, av.av_channel);
        prop_assert_eq!(parsed.av_seq, av.av_seq);
        prop_assert_eq!(parsed.timestamp, av.timestamp);
        prop_assert_eq!(&parsed.payload, &av.payload);
    }

    #[test]
    fn file_stream_round_trip(
        file_id in 0..(1u64 << 63),
        offset in 0..(1u64 << 63),
        encrypt_type in any::<u8>(),
        payload in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let mut chunk = FilePacket::new(file_id, offset);
        chunk.encrypt_type = encrypt_type;
        chunk.payload = payload.clone();
        let wire = chunk.pack().expect("pack");

        let rt = tokio::runtime::Builder::new_current_thread().build().expect("rt");
        let packet = rt
            .block_on(read_stream_packet(&mut &wire[..], true))
            .expect("decode");

        let Packet::File(parsed) = packet else { panic!("expected FILE") };
        prop_assert_eq!(parsed.file_id, file_id);
        prop_assert_eq!(parsed.offset, offset);
        prop_assert_eq!(parsed.encrypt_type, encrypt_type);
        prop_assert_eq!(&parsed.payload, &payload);
    }

    #[test]
    fn customer_round_trip(payload in prop::collection::vec(any::<u8>(), 0..1024)) {
        let mut packet = CustomerPacket::new(payload.clone());
        let wire = packet.pack().expect("pack");

        let rt = tokio::runtime::Builder::new_current_thread().build().expect("rt");
        let parsed = rt
            .block_on(read_stream_packet(&mut &wire[..], true))
            .expect("decode");

        let Packet::Customer(parsed) = parsed else { panic!("expected CUSTOMER") };
        prop_assert_eq!(&parsed.payload, &payload);
    }

    #[test]
    fn garbage_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = read_datagram_packet(&bytes, true);

        let rt = tokio::runtime::Builder::new_current_thread().build().expect("rt");
        let _ = rt.block_on(read_stream_packet(&mut &bytes[..], true));
    }
}
