//! Codec benchmarks
//!
//! Run with: cargo bench

use bytes::BytesMut;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use wsgate::Message;
use wsgate::emulated::codec::{EmulatedDecoder, encode_message};
use wsgate::frame::{FrameParser, OpCode, encode_frame};
use wsgate::mask::apply_mask;
use wsgate::utf8::validate_utf8;

fn bench_mask(c: &mut Criterion) {
    let mut group = c.benchmark_group("mask");

    for size in [64, 1024, 16384, 65536] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("apply_mask", size), &size, |b, &size| {
            let mut data = vec![0x42u8; size];
            let mask = [0x37, 0xfa, 0x21, 0x3d];
            b.iter(|| apply_mask(black_box(&mut data), black_box(mask)));
        });
    }

    group.finish();
}

fn bench_utf8(c: &mut Criterion) {
    let mut group = c.benchmark_group("utf8");

    for size in [64, 1024, 16384] {
        let text = "héllo wörld ".repeat(size / 14 + 1);
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_with_input(BenchmarkId::new("validate", size), &text, |b, text| {
            b.iter(|| validate_utf8(black_box(text.as_bytes())));
        });
    }

    group.finish();
}

/// Server-to-client frames: unmasked
fn bench_native_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("native_parse");

    for size in [16, 125, 1024, 65536] {
        let mut frame = BytesMut::new();
        encode_frame(&mut frame, OpCode::Binary, &vec![7u8; size], true, None);
        group.throughput(Throughput::Bytes(frame.len() as u64));

        group.bench_with_input(BenchmarkId::new("binary", size), &frame, |b, frame| {
            let mut parser = FrameParser::new(1024 * 1024, false);
            b.iter(|| {
                let mut buf = frame.clone();
                parser.parse(black_box(&mut buf)).unwrap()
            });
        });
    }

    group.finish();
}

/// Client-to-server frames: masked
fn bench_native_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("native_encode");

    for size in [16, 125, 1024, 65536] {
        let payload = vec![7u8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("masked", size), &payload, |b, payload| {
            let mut buf = BytesMut::with_capacity(size + 14);
            b.iter(|| {
                buf.clear();
                encode_frame(
                    &mut buf,
                    OpCode::Binary,
                    black_box(payload),
                    true,
                    Some([1, 2, 3, 4]),
                );
            });
        });
    }

    group.finish();
}

fn bench_emulated_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("emulated_decode");

    for count in [1, 16, 256] {
        let mut stream = BytesMut::new();
        for i in 0..count {
            encode_message(&mut stream, &Message::text(format!("message number {i}")));
        }
        group.throughput(Throughput::Bytes(stream.len() as u64));

        group.bench_with_input(BenchmarkId::new("text_frames", count), &stream, |b, stream| {
            b.iter(|| {
                let mut decoder = EmulatedDecoder::new(1024 * 1024);
                decoder.feed(black_box(stream));
                let mut frames = 0;
                while let Some(_frame) = decoder.decode().unwrap() {
                    frames += 1;
                }
                frames
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_mask,
    bench_utf8,
    bench_native_parse,
    bench_native_encode,
    bench_emulated_decode,
);
criterion_main!(benches);
