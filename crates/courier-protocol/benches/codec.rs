//! Codec benchmarks for courier-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use courier_protocol::{codec, Frame, Message, Target};

fn sample_deliver(text_len: usize) -> Frame {
    Frame::deliver(Message {
        id: 1_234_567,
        target: Target::group("team:general"),
        from: "alice".to_string(),
        text: "x".repeat(text_len),
        created_at: 1_700_000_000_000,
    })
}

fn bench_encode_send(c: &mut Criterion) {
    let frame = Frame::send_direct(1, "bob", "x".repeat(64));

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("send_direct_64B", |b| {
        b.iter(|| codec::encode(black_box(&frame)))
    });
    group.finish();
}

fn bench_decode_deliver(c: &mut Criterion) {
    let frame = sample_deliver(64);
    let encoded = codec::encode(&frame).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("deliver_64B", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let frame = sample_deliver(256);

    c.bench_function("roundtrip_deliver_256B", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&frame)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_send,
    bench_decode_deliver,
    bench_roundtrip
);
criterion_main!(benches);
