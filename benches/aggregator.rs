use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use flowmon::flow::FlowAggregator;
use flowmon::parser::{decode_frame, LinkLayer};

fn ipv4_frame() -> Vec<u8> {
    let builder = etherparse::PacketBuilder::ethernet2([2; 6], [4; 6])
        .ipv4([192, 168, 1, 10], [10, 0, 0, 1], 64)
        .udp(5353, 53);
    let mut frame = Vec::new();
    builder.write(&mut frame, &[0u8; 512]).unwrap();
    frame
}

fn bench_add_single_flow(c: &mut Criterion) {
    let agg = FlowAggregator::new();
    c.bench_function("aggregator_add_single_flow", |b| {
        b.iter(|| agg.add(black_box("10.0.0.1"), black_box("10.0.0.2"), black_box(1500)))
    });
}

fn bench_add_many_flows(c: &mut Criterion) {
    let agg = FlowAggregator::new();
    let hosts: Vec<String> = (0..256).map(|i| format!("10.0.{}.{}", i / 16, i % 16)).collect();
    let mut i = 0usize;
    c.bench_function("aggregator_add_256_flows", |b| {
        b.iter(|| {
            i = (i + 1) % hosts.len();
            agg.add(&hosts[i], "10.1.0.1", black_box(64));
        })
    });
}

fn bench_drain(c: &mut Criterion) {
    let agg = FlowAggregator::new();
    c.bench_function("aggregator_fill_and_drain_1k", |b| {
        b.iter(|| {
            for n in 0..1000u32 {
                agg.add(&n.to_string(), "dst", 100);
            }
            black_box(agg.drain_all())
        })
    });
}

fn bench_contended_add(c: &mut Criterion) {
    c.bench_function("aggregator_add_4_threads", |b| {
        b.iter(|| {
            let agg = Arc::new(FlowAggregator::new());
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let agg = Arc::clone(&agg);
                    thread::spawn(move || {
                        let src = format!("10.0.0.{t}");
                        for _ in 0..1000 {
                            agg.add(&src, "10.0.0.254", 1500);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            black_box(agg.drain_all())
        })
    });
}

fn bench_decode_and_add(c: &mut Criterion) {
    let agg = FlowAggregator::new();
    let frame = ipv4_frame();
    c.bench_function("decode_and_add_ipv4", |b| {
        b.iter(|| {
            if let Some(p) = decode_frame(LinkLayer::Ethernet, black_box(&frame)) {
                agg.add(
                    &p.source.to_string(),
                    &p.destination.to_string(),
                    u64::from(p.total_length),
                );
            }
        })
    });
}

criterion_group!(
    benches,
    bench_add_single_flow,
    bench_add_many_flows,
    bench_drain,
    bench_contended_add,
    bench_decode_and_add
);
criterion_main!(benches);
