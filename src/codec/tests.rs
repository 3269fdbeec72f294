//! MQTT Codec Tests

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;
use test_case::test_case;

use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, EncodeError, Packet, PubAck, Publish, QoS,
    SubAck, Subscribe,
};

fn encode_packet(packet: &Packet) -> BytesMut {
    let mut buf = BytesMut::new();
    Encoder::new().encode(packet, &mut buf).unwrap();
    buf
}

fn decode_packet(buf: &[u8]) -> Result<Packet, DecodeError> {
    match Decoder::new().decode(buf)? {
        Some((packet, consumed)) => {
            assert_eq!(consumed, buf.len());
            Ok(packet)
        }
        None => Err(DecodeError::InsufficientData),
    }
}

// ============================================================================
// CONNECT
// ============================================================================

#[test]
fn test_connect_wire_format() {
    let packet = Packet::Connect(Box::new(Connect {
        client_id: "c1".to_string(),
        clean_session: true,
        keep_alive: 60,
        username: None,
        password: None,
    }));

    let encoded = encode_packet(&packet);
    assert_eq!(
        &encoded[..],
        &[
            0x10, 14, // fixed header
            0x00, 0x04, b'M', b'Q', b'T', b'T', // protocol name
            0x04, // level
            0x02, // clean session
            0x00, 0x3C, // keep alive
            0x00, 0x02, b'c', b'1', // client id
        ]
    );
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_connect_with_credentials() {
    let packet = Packet::Connect(Box::new(Connect {
        client_id: "edge".to_string(),
        clean_session: false,
        keep_alive: 30,
        username: Some("remoteclient".to_string()),
        password: Some(Bytes::from_static(b"secret")),
    }));

    let encoded = encode_packet(&packet);
    // username + password flags, no clean session
    assert_eq!(encoded[9], 0xC0);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_connect_password_without_username_is_dropped() {
    let packet = Packet::Connect(Box::new(Connect {
        client_id: "edge".to_string(),
        password: Some(Bytes::from_static(b"secret")),
        ..Default::default()
    }));

    let encoded = encode_packet(&packet);
    assert_eq!(encoded[9] & 0xC0, 0);

    match decode_packet(&encoded).unwrap() {
        Packet::Connect(connect) => assert!(connect.password.is_none()),
        other => panic!("expected CONNECT, got {:?}", other),
    }
}

#[test]
fn test_connect_rejects_other_protocol_level() {
    let mut encoded = encode_packet(&Packet::Connect(Box::default()));
    encoded[8] = 5;
    assert_eq!(
        decode_packet(&encoded),
        Err(DecodeError::InvalidProtocolVersion(5))
    );
}

// ============================================================================
// CONNACK
// ============================================================================

#[test_case(ConnectReturnCode::Accepted, false ; "accepted")]
#[test_case(ConnectReturnCode::Accepted, true ; "accepted with session")]
#[test_case(ConnectReturnCode::BadUsernameOrPassword, false ; "bad credentials")]
#[test_case(ConnectReturnCode::NotAuthorized, false ; "not authorized")]
fn test_connack(return_code: ConnectReturnCode, session_present: bool) {
    let packet = Packet::ConnAck(ConnAck {
        session_present,
        return_code,
    });
    let encoded = encode_packet(&packet);
    assert_eq!(encoded.len(), 4);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_connack_invalid_return_code() {
    assert_eq!(
        decode_packet(&[0x20, 0x02, 0x00, 0x06]),
        Err(DecodeError::InvalidReturnCode(6))
    );
}

// ============================================================================
// PUBLISH / PUBACK
// ============================================================================

#[test]
fn test_publish_qos0_wire_format() {
    let packet = Packet::Publish(Publish::at_most_once("a/b", Bytes::from_static(b"hi")));
    let encoded = encode_packet(&packet);
    assert_eq!(
        &encoded[..],
        &[0x30, 7, 0x00, 0x03, b'a', b'/', b'b', b'h', b'i']
    );
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_publish_qos1_carries_packet_id() {
    let packet = Packet::Publish(Publish {
        dup: true,
        qos: QoS::AtLeastOnce,
        retain: true,
        topic: "H/42/state/response".to_string(),
        packet_id: Some(7),
        payload: Bytes::from_static(br#"{"uptime":null}"#),
    });
    let encoded = encode_packet(&packet);
    assert_eq!(encoded[0], 0x3B);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_publish_qos1_without_packet_id_fails() {
    let packet = Packet::Publish(Publish {
        qos: QoS::AtLeastOnce,
        ..Publish::at_most_once("a", Bytes::new())
    });
    let mut buf = BytesMut::new();
    assert_eq!(
        Encoder::new().encode(&packet, &mut buf),
        Err(EncodeError::MissingPacketId)
    );
}

#[test_case("" ; "empty")]
#[test_case("a/+" ; "single wildcard")]
#[test_case("a/#" ; "multi wildcard")]
fn test_publish_invalid_topic(topic: &str) {
    let packet = Packet::Publish(Publish::at_most_once(topic, Bytes::new()));
    let mut buf = BytesMut::new();
    assert_eq!(
        Encoder::new().encode(&packet, &mut buf),
        Err(EncodeError::InvalidTopicName)
    );
}

#[test]
fn test_publish_qos0_with_dup_rejected() {
    assert_eq!(
        decode_packet(&[0x38, 0x03, 0x00, 0x01, b'a']),
        Err(DecodeError::InvalidFlags)
    );
}

#[test]
fn test_puback() {
    let packet = Packet::PubAck(PubAck { packet_id: 0x1234 });
    let encoded = encode_packet(&packet);
    assert_eq!(&encoded[..], &[0x40, 0x02, 0x12, 0x34]);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

// ============================================================================
// SUBSCRIBE / SUBACK
// ============================================================================

#[test]
fn test_subscribe() {
    let packet = Packet::Subscribe(Subscribe {
        packet_id: 1,
        filters: vec![
            ("H/42/#".to_string(), QoS::AtMostOnce),
            ("coordinator/#".to_string(), QoS::AtLeastOnce),
        ],
    });
    let encoded = encode_packet(&packet);
    assert_eq!(encoded[0], 0x82);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_subscribe_without_filters_rejected() {
    assert_eq!(
        decode_packet(&[0x82, 0x02, 0x00, 0x01]),
        Err(DecodeError::MalformedPacket("SUBSCRIBE without topic filters"))
    );
}

#[test]
fn test_suback() {
    let packet = Packet::SubAck(SubAck {
        packet_id: 9,
        return_codes: vec![0x00, 0x01, 0x80],
    });
    let encoded = encode_packet(&packet);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);

    assert_eq!(
        decode_packet(&[0x90, 0x03, 0x00, 0x09, 0x03]),
        Err(DecodeError::InvalidReturnCode(3))
    );
}

// ============================================================================
// Fixed-size packets and framing
// ============================================================================

#[test_case(Packet::PingReq, 0xC0 ; "pingreq")]
#[test_case(Packet::PingResp, 0xD0 ; "pingresp")]
#[test_case(Packet::Disconnect, 0xE0 ; "disconnect")]
fn test_empty_packets(packet: Packet, first_byte: u8) {
    let encoded = encode_packet(&packet);
    assert_eq!(&encoded[..], &[first_byte, 0x00]);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_partial_packet_returns_none() {
    let encoded = encode_packet(&Packet::Publish(Publish::at_most_once(
        "a/b",
        Bytes::from_static(b"payload"),
    )));

    let decoder = Decoder::new();
    for end in 0..encoded.len() {
        assert_eq!(decoder.decode(&encoded[..end]).unwrap(), None);
    }
    assert!(decoder.decode(&encoded).unwrap().is_some());
}

#[test]
fn test_back_to_back_packets() {
    let mut buf = encode_packet(&Packet::PingResp);
    buf.extend_from_slice(&encode_packet(&Packet::PubAck(PubAck { packet_id: 3 })));

    let decoder = Decoder::new();
    let (first, consumed) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(first, Packet::PingResp);
    assert_eq!(consumed, 2);

    let (second, _) = decoder.decode(&buf[consumed..]).unwrap().unwrap();
    assert_eq!(second, Packet::PubAck(PubAck { packet_id: 3 }));
}

#[test]
fn test_packet_size_limit() {
    let encoded = encode_packet(&Packet::Publish(Publish::at_most_once(
        "a",
        Bytes::from(vec![0u8; 64]),
    )));
    let decoder = Decoder::new().with_max_packet_size(16);
    assert_eq!(decoder.decode(&encoded), Err(DecodeError::PacketTooLarge));
}

#[test]
fn test_unsupported_packet_type() {
    // PUBREC is outside the supported subset
    assert_eq!(
        decode_packet(&[0x50, 0x02, 0x00, 0x01]),
        Err(DecodeError::InvalidPacketType(5))
    );
}
