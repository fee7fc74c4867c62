//! Registry benchmarks: the mutex-guarded critical sections every parcel
//! passes through, and a full fixed-chute parcel through the orchestrator.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use parcel_sort_orchestrator::path::{DiverterDirection, TablePathPipeline};
use parcel_sort_orchestrator::upstream::LoopbackUpstreamClient;
use parcel_sort_orchestrator::{
    ChuteId, DiverterId, OrchestratorBuilder, ParcelId, ParcelRegistry, RoutingConfig, SortingMode,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

// ---------------------------------------------------------------------------
// Bench: record lifecycle
// ---------------------------------------------------------------------------

fn bench_record_lifecycle(c: &mut Criterion) {
    let registry = ParcelRegistry::new();
    let mut next = 0i64;

    c.bench_function("registry_create_mark_remove", |b| {
        b.iter(|| {
            next += 1;
            let id = ParcelId(next);
            let now = Instant::now();
            registry.create(id, now);
            registry.mark_route_bound(id, now);
            black_box(registry.remove(id));
        })
    });
}

// ---------------------------------------------------------------------------
// Bench: pending assignment register + resolve
// ---------------------------------------------------------------------------

fn bench_pending_roundtrip(c: &mut Criterion) {
    let registry = ParcelRegistry::new();
    registry.create(ParcelId(1), Instant::now());

    c.bench_function("registry_pending_register_resolve", |b| {
        b.iter(|| {
            let now = Instant::now();
            black_box(registry.register_pending(ParcelId(1), now));
            black_box(registry.resolve_pending(ParcelId(1), ChuteId(3), now));
        })
    });
}

// ---------------------------------------------------------------------------
// Bench: round-robin cursor over lists of varying size
// ---------------------------------------------------------------------------

fn bench_round_robin(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_robin_next");
    for size in [3usize, 32, 256] {
        let chutes: Vec<ChuteId> = (1..=size as i64).map(ChuteId).collect();
        let registry = ParcelRegistry::new();
        group.bench_with_input(BenchmarkId::from_parameter(size), &chutes, |b, chutes| {
            b.iter(|| black_box(registry.next_round_robin(chutes)))
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Bench: one fixed-chute parcel end to end
// ---------------------------------------------------------------------------

fn bench_fixed_chute_parcel(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let routing = RoutingConfig {
        mode: SortingMode::FixedChute,
        exception_chute_id: ChuteId(999),
        fixed_chute_id: Some(ChuteId(7)),
        available_chute_ids: Vec::new(),
        chute_assignment_timeout: Duration::from_millis(100),
    };
    let pipeline = TablePathPipeline::new(ChuteId(999)).with_route(
        ChuteId(7),
        vec![
            (DiverterId(1), DiverterDirection::Straight, Duration::from_millis(100)),
            (DiverterId(2), DiverterDirection::Left, Duration::from_millis(100)),
        ],
    );
    let orchestrator = OrchestratorBuilder::new(
        Arc::new(routing),
        Arc::new(LoopbackUpstreamClient::silent()),
        Arc::new(pipeline),
    )
    .build();
    let mut next = 0i64;

    c.bench_function("orchestrator_fixed_chute_parcel", |b| {
        b.to_async(&rt).iter(|| {
            next += 1;
            let orchestrator = orchestrator.clone();
            let id = ParcelId(next);
            async move { black_box(orchestrator.handle_detected(id).await) }
        })
    });
}

criterion_group!(
    benches,
    bench_record_lifecycle,
    bench_pending_roundtrip,
    bench_round_robin,
    bench_fixed_chute_parcel
);
criterion_main!(benches);
