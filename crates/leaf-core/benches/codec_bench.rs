//! Benchmarks for relay frame encoding and decoding

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use leaf_core::{DEFAULT_MAX_FRAME_SIZE, MAX_DATA_PAYLOAD, RelayMessage, read_frame};

fn data_message(size: usize) -> RelayMessage {
    RelayMessage::Data {
        stream_id: 42,
        payload: vec![0xAA; size],
    }
}

fn bench_encode_sizes(c: &mut Criterion) {
    let sizes: Vec<(usize, &str)> = vec![
        (64, "64_bytes"),
        (1024, "1024_bytes"),
        (16 * 1024, "16k_bytes"),
        (MAX_DATA_PAYLOAD, "64k_bytes"),
    ];

    let mut group = c.benchmark_group("frame_encode_by_size");

    for (size, name) in sizes {
        let message = data_message(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(name, |b| {
            b.iter(|| black_box(&message).encode_frame(DEFAULT_MAX_FRAME_SIZE))
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let frame = data_message(MAX_DATA_PAYLOAD)
        .encode_frame(DEFAULT_MAX_FRAME_SIZE)
        .unwrap();

    let mut group = c.benchmark_group("frame_decode");
    group.throughput(Throughput::Bytes(frame.len() as u64));

    group.bench_function("read_frame_64k", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let mut reader = black_box(frame.as_slice());
                read_frame(&mut reader, DEFAULT_MAX_FRAME_SIZE).await
            })
        })
    });

    let ping = RelayMessage::Ping { nonce: 7 }.to_bytes().unwrap();
    group.bench_function("from_bytes_ping", |b| {
        b.iter(|| RelayMessage::from_bytes(black_box(&ping)))
    });

    group.finish();
}

fn bench_hello(c: &mut Criterion) {
    c.bench_function("hello_with_partner_header", |b| {
        b.iter(|| {
            RelayMessage::hello(
                black_box("0.1.0"),
                black_box("0123456789abcdef0123456789abcdef"),
                black_box(Some("acme")),
            )
            .encode_frame(DEFAULT_MAX_FRAME_SIZE)
        })
    });
}

criterion_group!(benches, bench_encode_sizes, bench_decode, bench_hello);
criterion_main!(benches);
