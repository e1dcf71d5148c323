//! Micro-benchmarks for RESP parsing and serialization.
//!
//! Run with `cargo bench -p cinder-protocol`.

use std::hint::black_box;

use bytes::{Bytes, BytesMut};
use criterion::{criterion_group, criterion_main, Criterion};
use cinder_protocol::{parse_frame, Frame};

/// Builds the raw RESP bytes for `SET <key> <value>` where value is `size` bytes.
fn build_set_bytes(key: &str, value_size: usize) -> Vec<u8> {
    let value = "x".repeat(value_size);
    format!(
        "*3\r\n$3\r\nSET\r\n${}\r\n{}\r\n${}\r\n{}\r\n",
        key.len(),
        key,
        value.len(),
        value
    )
    .into_bytes()
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("resp_parse");

    let ping = b"*1\r\n$4\r\nPING\r\n";
    group.bench_function("ping", |b| {
        b.iter(|| black_box(parse_frame(ping).unwrap().unwrap()));
    });

    let get_cmd = b"*2\r\n$3\r\nGET\r\n$9\r\nkey:12345\r\n";
    group.bench_function("get", |b| {
        b.iter(|| black_box(parse_frame(get_cmd).unwrap().unwrap()));
    });

    let set_64 = build_set_bytes("key:12345", 64);
    group.bench_function("set_64B", |b| {
        b.iter(|| black_box(parse_frame(&set_64).unwrap().unwrap()));
    });

    let set_1k = build_set_bytes("key:12345", 1024);
    group.bench_function("set_1KB", |b| {
        b.iter(|| black_box(parse_frame(&set_1k).unwrap().unwrap()));
    });

    let inline = b"SET key:12345 value\r\n";
    group.bench_function("inline_set", |b| {
        b.iter(|| black_box(parse_frame(inline).unwrap().unwrap()));
    });

    group.finish();
}

fn bench_serialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("resp_serialize");

    let ok = Frame::Simple("OK".into());
    group.bench_function("simple_ok", |b| {
        let mut buf = BytesMut::with_capacity(64);
        b.iter(|| {
            buf.clear();
            ok.serialize(&mut buf);
            black_box(&buf);
        });
    });

    let bulk_1k = Frame::Bulk(Bytes::from(vec![b'x'; 1024]));
    group.bench_function("bulk_1KB", |b| {
        let mut buf = BytesMut::with_capacity(2048);
        b.iter(|| {
            buf.clear();
            bulk_1k.serialize(&mut buf);
            black_box(&buf);
        });
    });

    let delivery = Frame::Array(vec![
        Frame::Bulk(Bytes::from_static(b"message")),
        Frame::Bulk(Bytes::from_static(b"news.sports")),
        Frame::Bulk(Bytes::from(vec![b'x'; 256])),
    ]);
    group.bench_function("message_delivery", |b| {
        let mut buf = BytesMut::with_capacity(512);
        b.iter(|| {
            buf.clear();
            delivery.serialize(&mut buf);
            black_box(&buf);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_parse, bench_serialize);
criterion_main!(benches);
