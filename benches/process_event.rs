use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use cgmon::config::{ResourcesConfig, StatsConfig, StoreInterval};
use cgmon::{
    Cache, CgrEvent, DataDb, DataManager, FilterService, Guardian, InMemoryDb, ResourceArgs, ResourceProfile,
    ResourceService, StatQueueProfile, StatService,
};

fn make_dm() -> Arc<DataManager> {
    let db = Arc::new(InMemoryDb::new());
    Arc::new(DataManager::new(db as Arc<dyn DataDb>, Arc::new(Cache::new())))
}

/// 64 queues on distinct accounts plus one catch-all, so the index has to
/// narrow 65 profiles down to two per event.
fn make_stats() -> StatService {
    let dm = make_dm();
    let filters = Arc::new(FilterService::new(Arc::clone(&dm), false));
    let cfg = StatsConfig {
        enabled: true,
        store_interval: StoreInterval::Never,
        ..StatsConfig::default()
    };
    let svc = StatService::new(dm, filters, Arc::new(Guardian::new()), cfg, Duration::ZERO);
    for i in 0..64u32 {
        let mut p = StatQueueProfile::new("cgrates.org", format!("SQ_{i}")).with_metrics(&["*asr", "*acd", "*tcc"]);
        p.filter_ids = vec![format!("*string:~Account:{}", 1000 + i)];
        p.queue_length = 100;
        svc.set_stat_queue_profile(p).unwrap();
    }
    let catch_all = StatQueueProfile::new("cgrates.org", "SQ_ALL").with_metrics(&["*tcd", "*pdd"]);
    svc.set_stat_queue_profile(catch_all).unwrap();
    svc
}

fn call(i: u64) -> CgrEvent {
    CgrEvent::new("cgrates.org", format!("ev_{i}"))
        .with_field("Account", (1000 + i % 64).to_string())
        .with_field("AnswerTime", "2024-01-01T10:00:00Z")
        .with_field("Usage", "90s")
        .with_field("PDD", "3s")
        .with_field("Cost", 0.25)
}

fn bench_stats_process_event(c: &mut Criterion) {
    let mut group = c.benchmark_group("stats");
    group.throughput(Throughput::Elements(1));

    group.bench_function("process_event_indexed", |b| {
        b.iter_custom(|iters| {
            let svc = make_stats();
            let events: Vec<CgrEvent> = (0..iters).map(call).collect();

            let start = Instant::now();
            for ev in &events {
                let _ = svc.process_event(ev, None).unwrap();
            }
            start.elapsed()
        });
    });

    group.finish();
}

fn bench_resources_allocate_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("resources");
    group.throughput(Throughput::Elements(1));

    group.bench_function("allocate_release", |b| {
        b.iter_custom(|iters| {
            let dm = make_dm();
            let filters = Arc::new(FilterService::new(Arc::clone(&dm), false));
            let cfg = ResourcesConfig {
                enabled: true,
                store_interval: StoreInterval::Never,
                ..ResourcesConfig::default()
            };
            let svc = ResourceService::new(dm, filters, Arc::new(Guardian::new()), cfg, Duration::ZERO);
            let mut p = ResourceProfile::new("cgrates.org", "RES_ACC");
            p.filter_ids = vec!["*string:~Account:1001".to_string()];
            p.limit = 1000.0;
            svc.set_resource_profile(p).unwrap();

            let event = CgrEvent::new("cgrates.org", "ev").with_field("Account", "1001");
            let start = Instant::now();
            for i in 0..iters {
                let args = ResourceArgs::new(event.clone(), format!("u{i}"), 1.0);
                svc.allocate(&args).unwrap();
                svc.release(&args).unwrap();
            }
            start.elapsed()
        });
    });

    group.finish();
}

criterion_group!(process_event, bench_stats_process_event, bench_resources_allocate_release);
criterion_main!(process_event);
