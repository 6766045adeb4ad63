use std::collections::HashMap;
use std::net::Ipv4Addr;

use lnsd_codec::announce::{Announce, FRAME_SIZE};
use lnsd_codec::control::{Message, decode, encode};
use lnsd_codec::stream::ByteStream;
use lnsd_codec::{Error, verify_ipv4};

fn control_roundtrip(message: Message) {
    let mut stream = ByteStream::from(encode(&message).unwrap());
    assert_eq!(decode(&mut stream).unwrap(), message);
    assert_eq!(stream.remaining(), 0);
}

fn addr(text: &str) -> Ipv4Addr {
    text.parse().unwrap()
}

#[test]
fn announce_roundtrip() {
    let frame = Announce::new("this-is-a-hostname").encode().unwrap();
    assert_eq!(frame.len(), FRAME_SIZE);

    let message = Announce::decode(&frame).unwrap();
    assert_eq!(message.hostname(), "this-is-a-hostname");
}

#[test]
fn announce_roundtrip_unpadded() {
    // A maximum-length hostname fills the tail, leaving no NUL at all.
    let longest = "x".repeat(FRAME_SIZE - 1);
    let frame = Announce::new(longest.clone()).encode().unwrap();

    assert_eq!(Announce::decode(&frame).unwrap().hostname(), longest);
}

#[test]
fn announce_rejects_bad_hostnames() {
    assert!(Announce::new("").encode().is_err());
    assert!(Announce::new("x".repeat(FRAME_SIZE * 2)).encode().is_err());
    assert!(Announce::new("unprintables: \u{7f}\u{0}").encode().is_err());
    assert!(Announce::new("with space").encode().is_err());
}

#[test]
fn announce_rejects_bad_frames() {
    let frame = Announce::new("fine").encode().unwrap();

    assert!(matches!(
        Announce::decode(&frame[..100]),
        Err(Error::InvalidFrameSize(100))
    ));

    let mut wrong_header = frame;
    wrong_header[0] = 0x02;
    assert!(matches!(
        Announce::decode(&wrong_header),
        Err(Error::InvalidHeader(0x02))
    ));

    let mut empty_name = Announce::new("fine").encode().unwrap();
    empty_name[1] = 0;
    assert!(Announce::decode(&empty_name).is_err());
}

#[test]
fn control_roundtrips() {
    control_roundtrip(Message::Host {
        hostname: Some("foo".into()),
    });
    control_roundtrip(Message::Host { hostname: None });
    control_roundtrip(Message::Ip {
        addrs: vec![addr("1.2.3.4"), addr("5.6.7.8")],
    });
    control_roundtrip(Message::Ip { addrs: vec![] });
    control_roundtrip(Message::GetAll);
    control_roundtrip(Message::Quit);
    control_roundtrip(Message::NameIpMapping {
        name_ips: HashMap::new(),
    });
    control_roundtrip(Message::NameIpMapping {
        name_ips: HashMap::from([
            ("a".to_string(), vec![addr("1.2.3.4"), addr("9.10.11.12")]),
            ("b".to_string(), vec![addr("5.6.7.8")]),
        ]),
    });
}

#[test]
fn control_encode_rejects_bad_hostnames() {
    for bad in ["", "two words", "\u{7f}"] {
        assert!(matches!(
            encode(&Message::Host {
                hostname: Some(bad.into())
            }),
            Err(Error::InvalidHostname)
        ));

        assert!(matches!(
            encode(&Message::NameIpMapping {
                name_ips: HashMap::from([(bad.to_string(), vec![addr("1.2.3.4")])]),
            }),
            Err(Error::InvalidHostname)
        ));
    }
}

#[test]
fn ipv4_validation() {
    assert_eq!(verify_ipv4("0.0.0.0").unwrap(), Ipv4Addr::UNSPECIFIED);

    for bad in ["255.256.257.258", "1.2.3", "1.2.3.4.5", "not-an-ip"] {
        assert!(matches!(verify_ipv4(bad), Err(Error::InvalidAddress)));
    }
}

#[test]
fn decode_flags_invalid_payloads() {
    // Structurally valid JSON carrying an invalid address is a validation
    // error, not a parse error: the server hangs up on those.
    let body = br#"{"type":"ip","ip_addrs":["999.0.0.1"]}"#;
    let mut bytes = (body.len() as u16).to_le_bytes().to_vec();
    bytes.extend_from_slice(body);

    assert!(matches!(
        decode(&mut ByteStream::from(bytes)),
        Err(Error::InvalidAddress)
    ));

    let body = br#"{"type":"name","hostname":"two words"}"#;
    let mut bytes = (body.len() as u16).to_le_bytes().to_vec();
    bytes.extend_from_slice(body);

    assert!(matches!(
        decode(&mut ByteStream::from(bytes)),
        Err(Error::InvalidHostname)
    ));
}

#[test]
fn decode_flags_unknown_type_as_json_error() {
    let body = br#"{"type":"bogus"}"#;
    let mut bytes = (body.len() as u16).to_le_bytes().to_vec();
    bytes.extend_from_slice(body);

    assert!(matches!(
        decode(&mut ByteStream::from(bytes)),
        Err(Error::Json(_))
    ));
}

#[test]
fn decode_reports_eof_without_consuming_via_transaction() {
    let bytes = encode(&Message::GetAll).unwrap();

    // Feed the frame one byte short; a transaction sees EOF and rolls back.
    let mut stream = ByteStream::from(&bytes[..bytes.len() - 1]);
    let mut txn = stream.begin();
    assert!(matches!(decode(txn.stream()), Err(Error::UnexpectedEof)));
    txn.abort();
    assert_eq!(stream.position(), 0);

    // The missing byte arrives and the same stream now parses.
    stream.push(&bytes[bytes.len() - 1..]);
    assert_eq!(decode(&mut stream).unwrap(), Message::GetAll);
}
