//! Benchmarks for the checksum engine and device codecs.
//!
//! Run with:
//! ```sh
//! cargo bench --bench codec_bench
//! ```

use bytes::{Bytes, BytesMut};
use carpark_protocol::checksum::{crc16_ccitt, crc16_x25};
use carpark_protocol::framer::decode_all;
use carpark_protocol::{
    AntennaCodec, AntennaCommand, AntennaFrame, KsmCodec, KsmFrame, LcscCodec, LcscFrame,
};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use tokio_util::codec::Encoder;

fn antenna_frame(len: usize) -> AntennaFrame {
    AntennaFrame {
        // include DLE bytes so escaping is exercised
        data: Bytes::from((0..len).map(|i| (i % 32) as u8).collect::<Vec<_>>()),
        ..AntennaCommand::ForceGetIu.to_frame(0x80, 0x01, 1)
    }
}

fn bench_checksums(c: &mut Criterion) {
    let mut group = c.benchmark_group("checksum");

    for size in [16usize, 256, 1024] {
        let data: Vec<u8> = (0..size).map(|i| i as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("crc16_x25", size), &data, |b, data| {
            b.iter(|| black_box(crc16_x25(black_box(data))));
        });
        group.bench_with_input(BenchmarkId::new("crc16_ccitt", size), &data, |b, data| {
            b.iter(|| black_box(crc16_ccitt(black_box(data))));
        });
    }

    group.finish();
}

fn bench_antenna(c: &mut Criterion) {
    let mut group = c.benchmark_group("antenna");
    group.throughput(Throughput::Elements(1));

    let frame = antenna_frame(64);
    group.bench_function("encode", |b| {
        b.iter(|| {
            let mut codec = AntennaCodec::default();
            let mut buffer = BytesMut::new();
            codec.encode(black_box(frame.clone()), &mut buffer).unwrap();
            black_box(buffer);
        });
    });

    let mut encoded = BytesMut::new();
    AntennaCodec::default()
        .encode(frame.clone(), &mut encoded)
        .unwrap();
    let encoded = encoded.freeze();
    group.bench_function("decode", |b| {
        b.iter(|| {
            let mut codec = AntennaCodec::default();
            let mut buffer = BytesMut::from(&encoded[..]);
            black_box(decode_all(&mut codec, &mut buffer).unwrap());
        });
    });

    group.finish();
}

fn bench_ksm_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("ksm");
    group.throughput(Throughput::Elements(1));

    let frame = KsmFrame {
        kind: b'P',
        cm: b'3',
        pm: b'0',
        data: Bytes::from_static(b"00ABCDEFGHIJKLMNOP"),
    };
    let mut encoded = BytesMut::new();
    KsmCodec::default().encode(frame, &mut encoded).unwrap();
    let encoded = encoded.freeze();

    group.bench_function("decode", |b| {
        b.iter(|| {
            let mut codec = KsmCodec::default();
            let mut buffer = BytesMut::from(&encoded[..]);
            black_box(decode_all(&mut codec, &mut buffer).unwrap());
        });
    });

    group.finish();
}

/// Decoding a stream of back-to-back LCSC chunk acknowledgements.
fn bench_lcsc_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("lcsc_stream");

    for count in [1usize, 10, 100] {
        let mut stream = BytesMut::new();
        let mut codec = LcscCodec::default();
        for seq in 0..count {
            let frame = LcscFrame {
                response: true,
                kind: 0x31,
                payload: Bytes::from(vec![seq as u8, 0x00]),
            };
            codec.encode(frame, &mut stream).unwrap();
        }
        let stream = stream.freeze();
        group.throughput(Throughput::Elements(count as u64));

        group.bench_with_input(BenchmarkId::from_parameter(count), &stream, |b, stream| {
            b.iter(|| {
                let mut codec = LcscCodec::default();
                let mut buffer = BytesMut::from(&stream[..]);
                black_box(decode_all(&mut codec, &mut buffer).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_checksums,
    bench_antenna,
    bench_ksm_decode,
    bench_lcsc_stream,
);

criterion_main!(benches);
