//! Statistics engine behavior: matching, ordering, concurrency and storage.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};

use cgmon::config::{IndexingOpts, StatsConfig, StoreInterval};
use cgmon::filters::RuleKind;
use cgmon::storage::codec::decode_record;
use cgmon::time::ActivationInterval;
use cgmon::{
    Cache, CgrEvent, DataDb, DataManager, Filter, FilterRule, FilterService, Guardian, InMemoryDb, StatQueue,
    StatQueueProfile, StatService, TenantId,
};

const TENANT: &str = "cgrates.org";

fn setup(store_interval: StoreInterval) -> (Arc<InMemoryDb>, Arc<DataManager>, StatService) {
    let db = Arc::new(InMemoryDb::new());
    let dm = Arc::new(DataManager::new(Arc::clone(&db) as Arc<dyn DataDb>, Arc::new(Cache::new())));
    let filters = Arc::new(FilterService::new(Arc::clone(&dm), false));
    let cfg = StatsConfig {
        enabled: true,
        store_interval,
        indexing: IndexingOpts {
            prefix_indexed_fields: vec!["Destination".to_string()],
            ..IndexingOpts::default()
        },
        ..StatsConfig::default()
    };
    let svc = StatService::new(Arc::clone(&dm), filters, Arc::new(Guardian::new()), cfg, Duration::ZERO);
    (db, dm, svc)
}

fn queue(id: &str, filter_ids: &[&str], weight: f64, blocker: bool) -> StatQueueProfile {
    let mut p = StatQueueProfile::new(TENANT, id).with_metrics(&["*asr", "*acd", "*tcc"]);
    p.filter_ids = filter_ids.iter().map(ToString::to_string).collect();
    p.weight = weight;
    p.blocker = blocker;
    p.stored = true;
    p
}

fn cdr(id: &str, account: &str) -> CgrEvent {
    CgrEvent::new(TENANT, id)
        .with_field("Account", account)
        .with_field("Destination", "+4986517174963")
        .with_field("AnswerTime", "2024-03-01T09:00:00Z")
        .with_field("Usage", "2m")
        .with_field("Cost", 1.5)
}

#[test]
fn matching_honours_filters_and_activation() {
    let (_, dm, svc) = setup(StoreInterval::Never);
    dm.set_filter(Filter::new(
        TENANT,
        "FLTR_DE",
        vec![FilterRule::new(RuleKind::Prefix, "~Destination", vec!["+49".to_string()]).unwrap()],
    ))
    .unwrap();

    svc.set_stat_queue_profile(queue("SQ_DE", &["FLTR_DE"], 10.0, false)).unwrap();
    svc.set_stat_queue_profile(queue("SQ_1001", &["*string:~Account:1001"], 20.0, false))
        .unwrap();
    svc.set_stat_queue_profile(queue("SQ_1002", &["*string:~Account:1002"], 30.0, false))
        .unwrap();

    let mut expired = queue("SQ_OLD", &["*string:~Account:1001"], 40.0, false);
    expired.activation_interval = Some(ActivationInterval::until(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()));
    svc.set_stat_queue_profile(expired).unwrap();

    let ev = cdr("e1", "1001").at(Utc::now());
    assert_eq!(svc.get_stat_queues_for_event(&ev, None).unwrap(), vec!["SQ_1001", "SQ_DE"]);

    // An event time inside the window brings the old queue back.
    let past = cdr("e2", "1001").at(Utc.with_ymd_and_hms(2019, 6, 1, 0, 0, 0).unwrap());
    assert_eq!(
        svc.get_stat_queues_for_event(&past, None).unwrap(),
        vec!["SQ_OLD", "SQ_1001", "SQ_DE"]
    );

    // Read-only: no queue received anything.
    let sq = svc.get_stat_queue(&TenantId::new(TENANT, "SQ_1001")).unwrap();
    assert!(sq.sq_items.is_empty());
}

#[test]
fn rewritten_filter_moves_its_profiles_in_the_index() {
    let (_, dm, svc) = setup(StoreInterval::Never);
    let account_filter = |account: &str| {
        Filter::new(
            TENANT,
            "FLTR_ACC",
            vec![FilterRule::new(RuleKind::String, "~Account", vec![account.to_string()]).unwrap()],
        )
    };
    dm.set_filter(account_filter("1001")).unwrap();
    svc.set_stat_queue_profile(queue("SQ_ACC", &["FLTR_ACC"], 10.0, false)).unwrap();
    assert_eq!(svc.get_stat_queues_for_event(&cdr("e1", "1001"), None).unwrap(), vec!["SQ_ACC"]);

    dm.set_filter(account_filter("1002")).unwrap();
    assert_eq!(svc.get_stat_queues_for_event(&cdr("e2", "1002"), None).unwrap(), vec!["SQ_ACC"]);
    assert!(svc.get_stat_queues_for_event(&cdr("e3", "1001"), None).unwrap_err().is_not_found());

    // Still referenced, so it stays.
    assert!(dm.remove_filter(TENANT, "FLTR_ACC").is_err());
    assert!(dm.get_filter(TENANT, "FLTR_ACC", true, true).is_ok());
}

#[test]
fn explicit_ids_bypass_the_index_but_not_filters() {
    let (_, _, svc) = setup(StoreInterval::Never);
    svc.set_stat_queue_profile(queue("SQ_1001", &["*string:~Account:1001"], 10.0, false))
        .unwrap();
    svc.set_stat_queue_profile(queue("SQ_1002", &["*string:~Account:1002"], 10.0, false))
        .unwrap();

    let ids = vec!["SQ_1001".to_string(), "SQ_1002".to_string(), "SQ_MISSING".to_string()];
    assert_eq!(
        svc.process_event(&cdr("e1", "1002"), Some(&ids)).unwrap(),
        vec!["SQ_1002"]
    );
}

#[test]
fn heavier_blocker_hides_lighter_queue() {
    let (_, _, svc) = setup(StoreInterval::Never);
    svc.set_stat_queue_profile(queue("SQ_W10", &["*string:~Account:1001"], 10.0, false))
        .unwrap();
    svc.set_stat_queue_profile(queue("SQ_W20", &["*string:~Account:1001"], 20.0, true))
        .unwrap();

    assert_eq!(svc.get_stat_queues_for_event(&cdr("e1", "1001"), None).unwrap(), vec!["SQ_W20"]);
    assert_eq!(svc.process_event(&cdr("e1", "1001"), None).unwrap(), vec!["SQ_W20"]);

    let w10 = svc.get_stat_queue(&TenantId::new(TENANT, "SQ_W10")).unwrap();
    let w20 = svc.get_stat_queue(&TenantId::new(TENANT, "SQ_W20")).unwrap();
    assert!(w10.sq_items.is_empty());
    assert_eq!(w20.sq_items.len(), 1);
}

#[test]
fn lighter_blocker_keeps_heavier_queue_first() {
    let (_, _, svc) = setup(StoreInterval::Never);
    svc.set_stat_queue_profile(queue("SQ_W10", &["*string:~Account:1001"], 10.0, true))
        .unwrap();
    svc.set_stat_queue_profile(queue("SQ_W20", &["*string:~Account:1001"], 20.0, false))
        .unwrap();
    svc.set_stat_queue_profile(queue("SQ_W5", &["*string:~Account:1001"], 5.0, false))
        .unwrap();

    assert_eq!(
        svc.get_stat_queues_for_event(&cdr("e1", "1001"), None).unwrap(),
        vec!["SQ_W20", "SQ_W10"]
    );
}

#[test]
fn concurrent_events_on_one_queue_are_not_lost() {
    let (_, _, svc) = setup(StoreInterval::Never);
    svc.set_stat_queue_profile(queue("SQ_HOT", &["*string:~Account:1001"], 10.0, false))
        .unwrap();
    let svc = Arc::new(svc);

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let svc = Arc::clone(&svc);
            thread::spawn(move || {
                for i in 0..50 {
                    svc.process_event(&cdr(&format!("t{t}_e{i}"), "1001"), None).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let tid = TenantId::new(TENANT, "SQ_HOT");
    let sq = svc.get_stat_queue(&tid).unwrap();
    assert_eq!(sq.sq_items.len(), 400);
    let metrics = svc.get_queue_float_metrics(&tid).unwrap();
    assert!((metrics["*tcc"] - 600.0).abs() < 1e-9);
}

#[test]
fn synchronous_store_writes_inside_process_event() {
    let (db, _, svc) = setup(StoreInterval::Synchronous);
    svc.set_stat_queue_profile(queue("SQ1", &["*string:~Account:1001"], 10.0, false))
        .unwrap();
    svc.process_event(&cdr("e1", "1001"), None).unwrap();

    let stored: StatQueue = decode_record(&db.get("stq_cgrates.org:SQ1").unwrap().unwrap()).unwrap();
    assert_eq!(stored.sq_items.len(), 1);
    assert!(svc.dirty_queue().is_empty());
}

#[test]
fn periodic_store_defers_until_backup() {
    let (db, _, svc) = setup(StoreInterval::Every(Duration::from_secs(5)));
    svc.set_stat_queue_profile(queue("SQ1", &["*string:~Account:1001"], 10.0, false))
        .unwrap();
    svc.process_event(&cdr("e1", "1001"), None).unwrap();
    svc.process_event(&cdr("e2", "1001"), None).unwrap();

    // Re-marking a queued key does not queue it twice.
    assert_eq!(svc.dirty_queue().len(), 1);
    let stored: StatQueue = decode_record(&db.get("stq_cgrates.org:SQ1").unwrap().unwrap()).unwrap();
    assert!(stored.sq_items.is_empty());

    svc.shutdown();
    let stored: StatQueue = decode_record(&db.get("stq_cgrates.org:SQ1").unwrap().unwrap()).unwrap();
    assert_eq!(stored.sq_items.len(), 2);
}

#[test]
fn queue_ttl_drops_old_samples() {
    let (_, _, svc) = setup(StoreInterval::Never);
    let mut p = queue("SQ_TTL", &["*string:~Account:1001"], 10.0, false);
    p.ttl = Some(Duration::from_millis(50));
    svc.set_stat_queue_profile(p).unwrap();

    svc.process_event(&cdr("e1", "1001"), None).unwrap();
    thread::sleep(Duration::from_millis(80));
    svc.process_event(&cdr("e2", "1001"), None).unwrap();

    let sq = svc.get_stat_queue(&TenantId::new(TENANT, "SQ_TTL")).unwrap();
    let ids: Vec<&str> = sq.sq_items.iter().map(|i| i.event_id.as_str()).collect();
    assert_eq!(ids, vec!["e2"]);
    assert!(sq.sq_items[0].expiry.is_some_and(|e| e > Utc::now() - ChronoDuration::seconds(1)));
}

#[test]
fn queue_length_evicts_oldest() {
    let (_, _, svc) = setup(StoreInterval::Never);
    let mut p = queue("SQ_LEN", &["*string:~Account:1001"], 10.0, false);
    p.queue_length = 2;
    svc.set_stat_queue_profile(p).unwrap();

    for id in ["e1", "e2", "e3"] {
        svc.process_event(&cdr(id, "1001"), None).unwrap();
    }
    let tid = TenantId::new(TENANT, "SQ_LEN");
    let sq = svc.get_stat_queue(&tid).unwrap();
    let ids: Vec<&str> = sq.sq_items.iter().map(|i| i.event_id.as_str()).collect();
    assert_eq!(ids, vec!["e2", "e3"]);
    assert!((svc.get_queue_float_metrics(&tid).unwrap()["*tcc"] - 3.0).abs() < 1e-9);
}
