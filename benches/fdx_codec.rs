//! FDX frame building and decoding throughput

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use fdx_modbus_bridge::fdx::codec;
use fdx_modbus_bridge::fdx::protocol::FreeRunningFlags;
use fdx_modbus_bridge::{FdxByteOrder, FdxCommand, FdxSession, FdxVersion, SingleWrite, TransportKind};

fn register_snapshot(count: usize) -> Vec<u8> {
    (0..count as u16).flat_map(|v| v.to_be_bytes()).collect()
}

/// One data-exchange per frame, the shape of every polled snapshot
fn bench_data_exchange(c: &mut Criterion) {
    let mut group = c.benchmark_group("data_exchange");
    for registers in [4usize, 32, 125] {
        let data = register_snapshot(registers);
        group.bench_with_input(BenchmarkId::from_parameter(registers), &data, |b, data| {
            let mut session = FdxSession::new(TransportKind::Udp, FdxVersion::default(), FdxByteOrder::Big);
            b.iter(|| {
                session.data_exchange(1, black_box(data), false).unwrap();
                black_box(session.take_frame())
            })
        });
    }
    group.finish();
}

/// Appending commands into one frame
fn bench_append(c: &mut Criterion) {
    c.bench_function("append_16_free_running", |b| {
        let mut session = FdxSession::new(TransportKind::Tcp, FdxVersion::default(), FdxByteOrder::Little);
        b.iter(|| {
            for group_id in 0..16u16 {
                session
                    .free_running_request(group_id, FreeRunningFlags::TRANSMIT_CYCLIC, 5_000_000, 5_000_000, group_id > 0)
                    .unwrap();
            }
            black_box(session.take_frame())
        })
    });
}

/// Inbound path: header, commands, then the write-group payload
fn bench_decode(c: &mut Criterion) {
    let mut session = FdxSession::new(TransportKind::Udp, FdxVersion::default(), FdxByteOrder::Big);
    for (index, group_id) in (100..110u16).enumerate() {
        session
            .data_exchange(group_id, &[0x00, 0x01, 0x00, 0x0A, 0x12, 0x34], index > 0)
            .unwrap();
    }
    let frame: Bytes = session.take_frame().unwrap();

    c.bench_function("decode_10_write_groups", |b| {
        b.iter(|| {
            let (header, commands) = codec::decode_frame(black_box(&frame)).unwrap();
            for raw in &commands.commands {
                if let Ok(FdxCommand::DataExchange(exchange)) = FdxCommand::decode(raw, header.byte_order) {
                    black_box(SingleWrite::decode(&exchange.data, header.byte_order).ok());
                }
            }
        })
    });
}

criterion_group!(benches, bench_data_exchange, bench_append, bench_decode);
criterion_main!(benches);
