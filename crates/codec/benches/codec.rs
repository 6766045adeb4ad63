use criterion::{Criterion, criterion_group, criterion_main};

use lnsd_codec::announce::Announce;
use lnsd_codec::control::{Message, decode, encode};
use lnsd_codec::stream::ByteStream;

fn announce(c: &mut Criterion) {
    let message = Announce::new("workbench");
    let frame = message.encode().unwrap();

    c.bench_function("announce_encode", |b| {
        b.iter(|| message.encode().unwrap())
    });

    c.bench_function("announce_decode", |b| {
        b.iter(|| Announce::decode(&frame).unwrap())
    });
}

fn control(c: &mut Criterion) {
    let message = Message::Ip {
        addrs: vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()],
    };
    let bytes = encode(&message).unwrap();

    c.bench_function("control_encode", |b| b.iter(|| encode(&message).unwrap()));

    c.bench_function("control_decode", |b| {
        b.iter(|| {
            let mut stream = ByteStream::from(bytes.clone());
            decode(&mut stream).unwrap()
        })
    });
}

criterion_group!(codec, announce, control);
criterion_main!(codec);
