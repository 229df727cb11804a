use criterion::{criterion_group, criterion_main, Criterion};
use moviesync_core::broadcast::{compute_target, MemberRecord, MemberRegistry, MIN_MARGIN_MS};
use moviesync_core::clock::smooth;
use moviesync_core::protocol::Message;
use std::hint::black_box;
use std::net::SocketAddr;
use tokio::sync::mpsc;

fn bench_play_encode(c: &mut Criterion) {
    c.bench_function("play_command_encode", |b| {
        b.iter(|| {
            let msg = Message::play_at(black_box(1_700_000_010_000));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_sync_reply_decode(c: &mut Criterion) {
    let line = String::from_utf8(
        Message::SyncTimeReply {
            server_now: 1_700_000_000_123,
        }
        .encode()
        .unwrap(),
    )
    .unwrap();

    c.bench_function("sync_reply_decode", |b| {
        b.iter(|| {
            black_box(Message::decode(black_box(&line)).unwrap());
        })
    });
}

fn bench_target_and_smoothing(c: &mut Criterion) {
    c.bench_function("compute_target", |b| {
        let mut now = 1_700_000_000_000i64;
        b.iter(|| {
            now += 37;
            black_box(compute_target(black_box(now), MIN_MARGIN_MS));
        })
    });

    c.bench_function("offset_smooth", |b| {
        b.iter(|| black_box(smooth(black_box(4_899_700), black_box(4_899_950))))
    });
}

fn bench_broadcast_100_members(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let registry = MemberRegistry::new();
    let mut receivers = Vec::new();
    rt.block_on(async {
        for port in 0..100u16 {
            let (tx, rx) = mpsc::channel(1024);
            let addr = SocketAddr::from(([10, 0, 0, 1], 10_000 + port));
            registry.add(MemberRecord::new(addr, tx)).await;
            receivers.push(rx);
        }
    });

    c.bench_function("broadcast_play_100_members", |b| {
        b.iter(|| {
            rt.block_on(async {
                let fan_out = registry.broadcast(&Message::play_at(130_000)).await.unwrap();
                black_box(fan_out);
                for rx in &mut receivers {
                    let _ = rx.try_recv();
                }
            })
        })
    });
}

criterion_group!(
    benches,
    bench_play_encode,
    bench_sync_reply_decode,
    bench_target_and_smoothing,
    bench_broadcast_100_members,
);
criterion_main!(benches);
