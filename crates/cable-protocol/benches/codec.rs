//! Codec benchmarks for cable-protocol.

use cable_protocol::{codec, ChannelIdentifier, Command, ServerFrame};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;

fn identifier() -> String {
    ChannelIdentifier::new("ChatChannel")
        .with_param("room", "lobby")
        .into_string()
}

fn bench_encode_message(c: &mut Criterion) {
    let frame = ServerFrame::message(identifier(), json!({"body": "x".repeat(64)}));

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("message_64B", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.finish();
}

fn bench_decode_command(c: &mut Criterion) {
    let command = Command::message(identifier(), r#"{"action":"speak","body":"hello"}"#);
    let encoded = codec::encode_command(&command).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("command", |b| {
        b.iter(|| codec::decode_command(black_box(&encoded)))
    });
    group.finish();
}

fn bench_identifier_parse(c: &mut Criterion) {
    let raw = identifier();

    c.bench_function("identifier_parse", |b| {
        b.iter(|| ChannelIdentifier::parse(black_box(&raw)).unwrap())
    });
}

criterion_group!(
    benches,
    bench_encode_message,
    bench_decode_command,
    bench_identifier_parse
);
criterion_main!(benches);
