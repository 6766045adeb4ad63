use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use lnsd_codec::Error;
use lnsd_codec::socks::{
    Command, Greeting, METHOD_NO_AUTH, Reply, ReplyCode, Request, TargetAddr, UdpHeader,
};
use lnsd_codec::stream::ByteStream;

#[test]
fn greeting_decodes_offered_methods() {
    let mut stream = ByteStream::from(&[5u8, 2, 0x00, 0x02][..]);
    let greeting = Greeting::decode(&mut stream).unwrap();

    assert!(greeting.methods.contains(&METHOD_NO_AUTH));
    assert_eq!(greeting.methods.len(), 2);
}

#[test]
fn greeting_rejects_wrong_version() {
    let mut stream = ByteStream::from(&[4u8, 1, 0x00][..]);

    assert!(matches!(
        Greeting::decode(&mut stream),
        Err(Error::UnsupportedVersion(4))
    ));
}

#[test]
fn greeting_waits_for_all_methods() {
    let mut stream = ByteStream::from(&[5u8, 3, 0x00][..]);

    assert!(matches!(
        Greeting::decode(&mut stream),
        Err(Error::UnexpectedEof)
    ));
}

#[test]
fn request_with_ipv4_target() {
    let mut stream = ByteStream::from(&[5u8, 1, 0, 1, 10, 0, 0, 7, 0x1f, 0x90][..]);
    let request = Request::decode(&mut stream).unwrap();

    assert_eq!(request.command, Command::Connect);
    assert_eq!(request.addr, TargetAddr::Ipv4(Ipv4Addr::new(10, 0, 0, 7)));
    assert_eq!(request.port, 8080);
}

#[test]
fn request_with_ipv6_target_reads_sixteen_bytes() {
    let mut bytes = vec![5u8, 2, 0, 4];
    bytes.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
    bytes.extend_from_slice(&443u16.to_be_bytes());

    let request = Request::decode(&mut ByteStream::from(bytes)).unwrap();

    assert_eq!(request.command, Command::Bind);
    assert_eq!(request.addr, TargetAddr::Ipv6(Ipv6Addr::LOCALHOST));
    assert_eq!(request.port, 443);
}

#[test]
fn request_rejects_unknown_command_and_addr_type() {
    let mut stream = ByteStream::from(&[5u8, 9, 0, 1, 1, 2, 3, 4, 0, 80][..]);
    assert!(matches!(
        Request::decode(&mut stream),
        Err(Error::UnknownCommand(9))
    ));

    let mut stream = ByteStream::from(&[5u8, 1, 0, 2, 1, 2, 3, 4, 0, 80][..]);
    assert!(matches!(
        Request::decode(&mut stream),
        Err(Error::UnknownAddressType(2))
    ));
}

#[test]
fn request_decode_is_restartable_through_a_transaction() {
    let bytes = [5u8, 3, 0, 3, 4, b't', b'e', b's', b't', 0, 53];

    let mut stream = ByteStream::from(&bytes[..6]);
    let mut txn = stream.begin();
    assert!(matches!(
        Request::decode(txn.stream()),
        Err(Error::UnexpectedEof)
    ));
    txn.abort();
    assert_eq!(stream.position(), 0);

    stream.push(&bytes[6..]);
    let request = Request::decode(&mut stream).unwrap();
    assert_eq!(request.command, Command::UdpAssociate);
    assert_eq!(request.addr, TargetAddr::Domain("test".into()));
    assert_eq!(request.port, 53);
}

#[test]
fn reply_encoding() {
    let reply = Reply {
        code: ReplyCode::Succeeded,
        addr: SocketAddr::from((Ipv4Addr::new(192, 168, 1, 2), 1080)),
    };

    assert_eq!(
        reply.encode(),
        vec![5, 0, 0, 1, 192, 168, 1, 2, 0x04, 0x38]
    );

    // Error replies carry a zeroed address.
    assert_eq!(
        Reply::failure(ReplyCode::HostUnreachable).encode(),
        vec![5, 4, 0, 1, 0, 0, 0, 0, 0, 0]
    );
}

#[test]
fn udp_header_leaves_position_at_payload() {
    let mut bytes = vec![0u8, 0, 0, 1, 8, 8, 8, 8];
    bytes.extend_from_slice(&53u16.to_be_bytes());
    bytes.extend_from_slice(b"payload");

    let mut stream = ByteStream::from(bytes);
    let header = UdpHeader::decode(&mut stream).unwrap();

    assert_eq!(header.frag, 0);
    assert_eq!(header.addr, TargetAddr::Ipv4(Ipv4Addr::new(8, 8, 8, 8)));
    assert_eq!(header.port, 53);
    assert_eq!(stream.read(stream.remaining()), b"payload");
}
