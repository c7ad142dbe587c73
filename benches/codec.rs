//! Wire codec benchmarks.
//!
//! Covers the per-packet work on both sides: framing, variable
//! descriptions, table pages and the server's request dispatch.

use async_jip::server::dispatch;
use async_jip::wire::{
    GetRequest, GetResponse, Header, MAX_PACKET_SIZE, MibAddr, VarDescription, VarEntry,
    decode_packet, encode_packet,
};
use async_jip::{
    AccessType, Command, MibSchema, Node, NodeSchema, SchemaCache, Table, Value, VarType,
};
use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::net::SocketAddr;

fn source() -> SocketAddr {
    "[fd04::1]:1873".parse().unwrap()
}

/// Values of every scalar shape worth measuring.
fn sample_values() -> Vec<(&'static str, Value)> {
    vec![
        ("uint8", Value::U8(42)),
        ("uint32", Value::U32(0x0810_0002)),
        ("int64", Value::I64(-1_234_567_890_123)),
        ("dbl", Value::Double(21.5)),
        ("str", Value::from("Living room ceiling lamp")),
        ("blob", Value::Blob(Bytes::from_static(&[0xff; 64]))),
    ]
}

fn table(rows: u16, row_len: usize) -> Table {
    let mut table = Table::new();
    for row in 0..rows {
        table.update_row(row, vec![row as u8; row_len]).unwrap();
    }
    table
}

/// Benchmark header framing
fn bench_packet(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet");
    let body = [0xffu8, 0xff, 0xfe, 0x04, 0, 1];

    group.bench_function("encode", |b| {
        b.iter(|| black_box(encode_packet(Header::new(Command::GetMibRequest, 0x85), &body)))
    });

    let packet = encode_packet(Header::new(Command::GetMibRequest, 0x85), &body);
    group.bench_function("decode", |b| {
        b.iter(|| black_box(decode_packet(packet.clone(), source()).unwrap()))
    });

    group.finish();
}

/// Benchmark GET response bodies carrying one value
fn bench_var_description(c: &mut Criterion) {
    let mut group = c.benchmark_group("var_description");

    for (name, value) in sample_values() {
        let description = VarDescription {
            mib_index: 2,
            var_index: 0,
            entries: vec![VarEntry::Value(value)],
        };
        group.bench_with_input(BenchmarkId::new("encode", name), &description, |b, d| {
            b.iter(|| black_box(d.encode().unwrap()))
        });

        let encoded = description.encode().unwrap();
        group.bench_with_input(BenchmarkId::new("decode", name), &encoded, |b, data| {
            b.iter(|| black_box(VarDescription::decode(data.clone(), source()).unwrap()))
        });
    }

    group.finish();
}

/// Benchmark serving and parsing table pages
fn bench_table(c: &mut Criterion) {
    let mut group = c.benchmark_group("table");

    for rows in [8u16, 64, 255] {
        let table = table(rows, 12);
        group.throughput(Throughput::Elements(rows as u64));

        group.bench_with_input(BenchmarkId::new("version", rows), &table, |b, t| {
            b.iter(|| black_box(t.version()))
        });

        group.bench_with_input(BenchmarkId::new("page", rows), &table, |b, t| {
            b.iter(|| black_box(t.page(0, u8::MAX, MAX_PACKET_SIZE - Header::LEN)))
        });

        let response = GetResponse::Table {
            mib_index: 2,
            var_index: 0,
            page: table.page(0, u8::MAX, MAX_PACKET_SIZE - Header::LEN),
        }
        .encode()
        .unwrap();
        group.bench_with_input(BenchmarkId::new("decode_page", rows), &response, |b, data| {
            b.iter(|| black_box(GetResponse::decode(data.clone(), source()).unwrap()))
        });
    }

    group.finish();
}

/// Benchmark the server's handling of a GET
fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");

    let mut cache = SchemaCache::new();
    cache.insert_node(
        NodeSchema::new(0x0810_0002).mib(
            MibSchema::new(0xffff_fe04, "BulbControl")
                .var(0, "Mode", VarType::Uint8, AccessType::ReadWrite)
                .var(1, "LumCurrent", VarType::Uint8, AccessType::ReadWrite)
                .var(2, "Scenes", VarType::Table, AccessType::ReadOnly),
        ),
    );
    let mut node = Node::new(source(), 0x0810_0002);
    cache.populate_node(&mut node);
    for (index, var) in node.mibs[0].vars.iter_mut().enumerate() {
        var.enabled = true;
        var.value = Some(match index {
            2 => Value::Table(table(32, 12)),
            _ => Value::U8(index as u8),
        });
    }

    let scalar = GetRequest::scalar(MibAddr::Id(0xffff_fe04), 0, 2).encode();
    group.bench_function("get_scalars", |b| {
        b.iter(|| {
            black_box(dispatch(
                &mut node,
                Command::GetMibRequest,
                scalar.clone(),
                source(),
                None,
            ))
        })
    });

    let page = GetRequest::table(MibAddr::Id(0xffff_fe04), 2, 0, 8).encode();
    group.bench_function("get_table_page", |b| {
        b.iter(|| {
            black_box(dispatch(
                &mut node,
                Command::GetMibRequest,
                page.clone(),
                source(),
                None,
            ))
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_packet,
    bench_var_description,
    bench_table,
    bench_dispatch,
);

criterion_main!(benches);
