use crate::*;
use slime_lib::{
    get_partial, serve_stores, sha256_bytes, CasTo, GetOptions, MemStore, Precondition,
    SlimeError, SlimeResult, Store, StoreRef,
};
use slime_meta::{local_key, new_prefix_id, MetaDb};
use std::collections::HashSet;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

static INIT_LOGGER: Once = Once::new();

fn init_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

struct Harness {
    db: Arc<MetaDb>,
    finder: Arc<Finder>,
    multi: Arc<Multi>,
    mems: Vec<Arc<MemStore>>,
}

impl Harness {
    fn mem(&self, uuid: &Uuid) -> &Arc<MemStore> {
        self.mems.iter().find(|m| m.uuid() == *uuid).unwrap()
    }

    fn file(&self, path: &str) -> slime_meta::File {
        self.db.run(|tx| tx.get_file(path)).unwrap().unwrap()
    }

    fn total_gets(&self) -> usize {
        self.mems.iter().map(|m| m.get_count()).sum()
    }

    async fn put(&self, path: &str, from: Precondition, data: &[u8]) -> SlimeResult<()> {
        self.multi
            .cas(path, from, CasTo::Data(data.to_vec()), &CancellationToken::new())
            .await
    }

    async fn get(&self, path: &str) -> SlimeResult<Vec<u8>> {
        self.multi
            .get(path, GetOptions::default(), &CancellationToken::new())
            .await
            .map(|(data, _)| data)
    }
}

fn test_config() -> MultiConfig {
    MultiConfig {
        read_data_timeout: Duration::from_millis(200),
        test_interval_between: Duration::from_millis(1),
        ..MultiConfig::default()
    }
}

async fn harness_with(n: usize, need: usize, total: usize, config: MultiConfig) -> Harness {
    init_logging();
    let db = Arc::new(MetaDb::open_in_memory().unwrap());
    let connector = Arc::new(HttpConnector::new(0).unwrap());
    let finder = Arc::new(Finder::new(db.clone(), connector, config.clone()));
    let cancel = CancellationToken::new();
    let mut mems = Vec::new();
    for i in 0..n {
        let mem = Arc::new(MemStore::new(&format!("mem{}", i)));
        finder.add_store("", mem.clone(), &cancel).await.unwrap();
        mems.push(mem);
    }
    let multi = Multi::new(db.clone(), finder.clone(), config).unwrap();
    multi.set_redundancy(need, total).unwrap();
    Harness {
        db,
        finder,
        multi,
        mems,
    }
}

async fn harness(n: usize, need: usize, total: usize) -> Harness {
    harness_with(n, need, total, test_config()).await
}

#[tokio::test]
async fn test_multi_scenario_single_chunk_roundtrip() {
    let h = harness(3, 1, 1).await;
    h.put("key", Precondition::Missing, b"hello").await.unwrap();
    assert_eq!(h.get("key").await.unwrap(), b"hello");

    h.multi
        .cas(
            "key",
            Precondition::Sha256(sha256_bytes(b"hello")),
            CasTo::Missing,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(h.get("key").await.unwrap_err().is_not_found());
    h.multi.wait_pending().await;
    assert!(h.mems.iter().all(|m| m.keys().is_empty()));
}

#[tokio::test]
async fn test_multi_scenario_scrub_restores_removed_chunk() {
    let h = harness(4, 2, 3).await;
    let data = b"hello world! this is some test data.";
    h.put("obj", Precondition::Missing, data).await.unwrap();

    let before = h.file("obj");
    assert!(h.mem(&before.locations[0]).remove_raw(&before.local_key(0)));

    h.multi.scrub_all(&CancellationToken::new()).await.unwrap();
    h.multi.wait_pending().await;

    let after = h.file("obj");
    assert_eq!(after.locations.len(), 3);
    for (i, loc) in after.locations.iter().enumerate() {
        assert!(h.mem(loc).contains(&after.local_key(i)), "chunk {} missing", i);
    }
    assert_eq!(h.get("obj").await.unwrap(), data);
    assert!(h.multi.scrub_stats().chunk_rebuilds >= 1);
}

#[tokio::test]
async fn test_multi_scenario_many_keys_and_deletes() {
    let h = harness(5, 2, 3).await;
    let data = b"the same plaintext under ten different keys";
    for i in 0..10 {
        h.put(&i.to_string(), Precondition::Missing, data).await.unwrap();
    }
    for i in 0..10 {
        assert_eq!(h.get(&i.to_string()).await.unwrap(), data);
    }
    for i in 0..5 {
        h.multi
            .cas(&i.to_string(), Precondition::Any, CasTo::Missing, &CancellationToken::new())
            .await
            .unwrap();
    }
    for i in 5..10 {
        assert_eq!(h.get(&i.to_string()).await.unwrap(), data);
    }
    let listed = h.multi.list("", 0, &CancellationToken::new()).await.unwrap();
    assert_eq!(listed, vec!["5", "6", "7", "8", "9"]);
    let page = h.multi.list("6", 2, &CancellationToken::new()).await.unwrap();
    assert_eq!(page, vec!["7", "8"]);
}

#[tokio::test]
async fn test_multi_scenario_redundancy_change_with_dead_stores() {
    let h = harness(4, 3, 4).await;
    h.put("a", Precondition::Missing, b"hello").await.unwrap();

    h.mems[0].set_offline(true);
    h.multi.set_redundancy(1, 2).unwrap();
    h.put("a", Precondition::Sha256(sha256_bytes(b"hello")), b"there")
        .await
        .unwrap();
    let file = h.file("a");
    assert_eq!(file.locations.len(), 2);
    assert!(!file.locations.contains(&h.mems[0].uuid()));

    h.mems[1].set_offline(true);
    h.multi
        .cas(
            "a",
            Precondition::Sha256(sha256_bytes(b"there")),
            CasTo::Missing,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(h.get("a").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_multi_scenario_blocked_store_falls_back_to_parity() {
    let config = MultiConfig {
        read_data_timeout: Duration::from_millis(10),
        ..test_config()
    };
    let h = harness_with(4, 2, 4, config).await;
    h.put("a", Precondition::Missing, b"data").await.unwrap();

    for mem in h.mems.iter() {
        mem.block();
        let started = Instant::now();
        let got = tokio::time::timeout(Duration::from_secs(2), h.get("a"))
            .await
            .expect("read hung on a blocked store")
            .unwrap();
        assert_eq!(got, b"data");
        assert!(started.elapsed() < Duration::from_millis(500));
        mem.unblock();
    }
}

#[tokio::test]
async fn test_multi_scenario_stray_chunk_removed() {
    let h = harness(1, 1, 1).await;
    h.mems[0]
        .cas("a", Precondition::Any, CasTo::Data(b"data".to_vec()), &CancellationToken::new())
        .await
        .unwrap();
    h.multi.scrub_all(&CancellationToken::new()).await.unwrap();
    assert!(h.get("a").await.unwrap_err().is_not_found());
    assert!(!h.mems[0].contains("a"));
    assert_eq!(h.multi.scrub_stats().chunks_deleted, 1);
}

#[tokio::test]
async fn test_multi_wal_protects_in_flight_chunks() {
    let h = harness(2, 1, 1).await;
    let prefix = new_prefix_id();
    let name = local_key(&prefix, &sha256_bytes(b"x"), 0);
    h.mems[0]
        .cas(&name, Precondition::Any, CasTo::Data(b"x".to_vec()), &CancellationToken::new())
        .await
        .unwrap();
    h.db.run(|tx| tx.wal_mark(&prefix)).unwrap();

    h.multi.scrub_all(&CancellationToken::new()).await.unwrap();
    assert!(h.mems[0].contains(&name));

    h.db.run(|tx| tx.wal_clear(&prefix)).unwrap();
    h.multi.scrub_all(&CancellationToken::new()).await.unwrap();
    assert!(!h.mems[0].contains(&name));
}

#[tokio::test]
async fn test_multi_tolerates_lost_locations() {
    let h = harness(4, 2, 4).await;
    let data: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 251) as u8).collect();
    h.put("big", Precondition::Missing, &data).await.unwrap();

    let file = h.file("big");
    h.mem(&file.locations[0]).set_offline(true);
    h.mem(&file.locations[3]).set_offline(true);
    assert_eq!(h.get("big").await.unwrap(), data);
}

#[tokio::test]
async fn test_multi_healthy_read_uses_need_gets() {
    let h = harness(5, 3, 5).await;
    h.put("obj", Precondition::Missing, b"some bytes to spread").await.unwrap();
    let before = h.total_gets();
    h.get("obj").await.unwrap();
    assert_eq!(h.total_gets() - before, 3);
}

#[tokio::test]
async fn test_multi_mapped_content_roundtrip() {
    let h = harness(3, 2, 3).await;
    // All-ones words are outside the field and force a non-zero mapping.
    let data = vec![0xffu8; 37];
    h.put("ff", Precondition::Missing, &data).await.unwrap();
    let file = h.file("ff");
    assert_ne!(file.mapping_value, 0);
    assert_eq!(h.get("ff").await.unwrap(), data);

    h.mem(&file.locations[0]).set_offline(true);
    assert_eq!(h.get("ff").await.unwrap(), data);
}

#[tokio::test]
async fn test_multi_empty_object() {
    let h = harness(3, 2, 3).await;
    h.put("empty", Precondition::Missing, b"").await.unwrap();
    assert_eq!(h.get("empty").await.unwrap(), Vec::<u8>::new());
    let stat = h.multi.stat("empty", &CancellationToken::new()).await.unwrap();
    assert_eq!(stat.size, 0);
}

#[tokio::test]
async fn test_multi_cas_failures() {
    let h = harness(3, 1, 2).await;
    h.put("k", Precondition::Missing, b"one").await.unwrap();

    let err = h.put("k", Precondition::Missing, b"two").await.unwrap_err();
    assert!(err.is_cas_failure());
    let err = h
        .put("k", Precondition::Sha256(sha256_bytes(b"nope")), b"two")
        .await
        .unwrap_err();
    assert!(err.is_cas_failure());
    assert_eq!(h.get("k").await.unwrap(), b"one");

    // Nothing from the failed writes is left behind.
    h.multi.wait_pending().await;
    let stored: usize = h.mems.iter().map(|m| m.keys().len()).sum();
    assert_eq!(stored, 2);
}

#[tokio::test]
async fn test_multi_insufficient_stores() {
    let h = harness(2, 2, 3).await;
    let err = h.put("k", Precondition::Missing, b"data").await.unwrap_err();
    assert!(matches!(err, SlimeError::InsufficientStores(_)));
    assert!(h.mems.iter().all(|m| m.keys().is_empty()));
}

#[tokio::test]
async fn test_multi_stat_and_partial_reads() {
    let h = harness(3, 2, 3).await;
    h.put("doc", Precondition::Missing, b"hello world").await.unwrap();
    let cancel = CancellationToken::new();

    let stat = h.multi.stat("doc", &cancel).await.unwrap();
    assert_eq!(stat.size, 11);
    assert_eq!(stat.sha256, sha256_bytes(b"hello world"));
    assert!(h.multi.stat("nope", &cancel).await.unwrap_err().is_not_found());

    let (part, _) = get_partial(h.multi.as_ref(), "doc", 6, 5, &cancel).await.unwrap();
    assert_eq!(part, b"world");
    let (tail, _) = get_partial(h.multi.as_ref(), "doc", 6, -1, &cancel).await.unwrap();
    assert_eq!(tail, b"world");
}

#[tokio::test]
async fn test_multi_free_space_estimate() {
    init_logging();
    let db = Arc::new(MetaDb::open_in_memory().unwrap());
    let finder = Arc::new(Finder::new(
        db.clone(),
        Arc::new(HttpConnector::new(0).unwrap()),
        test_config(),
    ));
    let cancel = CancellationToken::new();
    for (i, capacity) in [100i64, 200, 300].iter().enumerate() {
        let mem = Arc::new(MemStore::new(&format!("mem{}", i)));
        mem.set_capacity(*capacity);
        finder.add_store("", mem, &cancel).await.unwrap();
    }
    let multi = Multi::new(db, finder, test_config()).unwrap();

    multi.set_redundancy(1, 2).unwrap();
    assert_eq!(multi.free_space(&cancel).await.unwrap(), 250);
    multi.set_redundancy(2, 4).unwrap();
    assert_eq!(multi.free_space(&cancel).await.unwrap(), 0);
}

#[tokio::test]
async fn test_multi_redundancy_persists_and_reloads() {
    let h = harness(3, 2, 3).await;
    assert_eq!(h.multi.redundancy(), Redundancy { need: 2, total: 3 });
    assert!(h.multi.set_redundancy(4, 3).is_err());
    assert!(h.multi.set_redundancy(0, 3).is_err());

    h.db.run(|tx| {
        tx.set_config(CONFIG_NEED, b"1")?;
        tx.set_config(CONFIG_TOTAL, b"2")
    })
    .unwrap();
    h.multi.reload_config().await.unwrap();
    assert_eq!(h.multi.redundancy(), Redundancy { need: 1, total: 2 });

    let reopened = Multi::new(h.db.clone(), h.finder.clone(), test_config()).unwrap();
    assert_eq!(reopened.redundancy(), Redundancy { need: 1, total: 2 });
    assert_eq!(reopened.uuid(), h.multi.uuid());
}

#[tokio::test]
async fn test_multi_file_scrub_follows_redundancy_and_dead_flags() {
    let h = harness(4, 1, 2).await;
    h.put("x", Precondition::Missing, b"payload").await.unwrap();

    let first = h.file("x");
    h.finder.set_dead(&first.locations[0], true).unwrap();
    h.multi.scrub_all(&CancellationToken::new()).await.unwrap();
    let moved = h.file("x");
    assert_ne!(moved.prefix_id, first.prefix_id);
    assert!(!moved.locations.contains(&first.locations[0]));

    h.multi.set_redundancy(2, 3).unwrap();
    h.multi.scrub_all(&CancellationToken::new()).await.unwrap();
    let reshaped = h.file("x");
    assert_eq!(reshaped.data_chunks, 2);
    assert_eq!(reshaped.locations.len(), 3);
    assert_eq!(h.get("x").await.unwrap(), b"payload");
}

#[tokio::test]
async fn test_multi_dead_store_is_not_used_for_writes() {
    let h = harness(3, 1, 2).await;
    h.finder.set_dead(&h.mems[2].uuid(), true).unwrap();
    for i in 0..5 {
        h.put(&format!("k{}", i), Precondition::Missing, b"v").await.unwrap();
        assert!(!h.file(&format!("k{}", i)).locations.contains(&h.mems[2].uuid()));
    }
    h.finder.set_dead(&h.mems[2].uuid(), false).unwrap();
    assert!(h.finder.stores_info().unwrap().iter().all(|s| !s.dead));
}

#[tokio::test]
async fn test_multi_rebalance_moves_to_emptiest_store() {
    let config = MultiConfig {
        rebalance_min_difference: 1000,
        ..test_config()
    };
    init_logging();
    let db = Arc::new(MetaDb::open_in_memory().unwrap());
    let finder = Arc::new(Finder::new(
        db.clone(),
        Arc::new(HttpConnector::new(0).unwrap()),
        config.clone(),
    ));
    let cancel = CancellationToken::new();
    let small: Vec<Arc<MemStore>> = (0..2)
        .map(|i| Arc::new(MemStore::new(&format!("small{}", i))))
        .collect();
    for mem in small.iter() {
        mem.set_capacity(1 << 20);
        finder.add_store("", mem.clone(), &cancel).await.unwrap();
    }
    let multi = Multi::new(db.clone(), finder.clone(), config).unwrap();
    multi.set_redundancy(1, 2).unwrap();
    for i in 0..3 {
        multi
            .cas(&format!("f{}", i), Precondition::Missing, CasTo::Data(vec![i as u8; 64]), &cancel)
            .await
            .unwrap();
    }

    let big = Arc::new(MemStore::new("big"));
    finder.add_store("", big.clone(), &cancel).await.unwrap();

    let moved = multi.rebalance_once(&cancel).await.unwrap();
    assert_eq!(moved, 3);
    for i in 0..3 {
        let path = format!("f{}", i);
        let file = db.run(|tx| tx.get_file(&path)).unwrap().unwrap();
        let index = file.locations.iter().position(|l| *l == big.uuid()).unwrap();
        assert!(big.contains(&file.local_key(index)));
        let got = multi.get(&path, GetOptions::default(), &cancel).await.unwrap().0;
        assert_eq!(got, vec![i as u8; 64]);
    }
    let stray: usize = small.iter().map(|m| m.keys().len()).sum();
    assert_eq!(stray, 3);
}

#[tokio::test]
async fn test_multi_rebalance_idle_when_balanced() {
    let h = harness(3, 1, 2).await;
    h.put("k", Precondition::Missing, b"v").await.unwrap();
    assert_eq!(h.multi.rebalance_once(&CancellationToken::new()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_multi_wal_scrub_expires_nothing_fresh() {
    let h = harness(1, 1, 1).await;
    h.db.run(|tx| tx.wal_mark(&new_prefix_id())).unwrap();
    assert_eq!(h.multi.scrub_wal_once().await.unwrap(), 0);
}

#[tokio::test]
async fn test_multi_get_cancelled() {
    let h = harness(2, 2, 2).await;
    h.put("k", Precondition::Missing, b"value").await.unwrap();
    for mem in h.mems.iter() {
        mem.block();
    }
    let cancel = CancellationToken::new();
    let multi = h.multi.clone();
    let token = cancel.clone();
    let task =
        tokio::spawn(async move { multi.get("k", GetOptions::default(), &token).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    let err = task.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multi_cas_is_linearizable() {
    const WRITERS: usize = 4;
    const ITERATIONS: usize = 5;
    let h = harness(4, 2, 3).await;
    let multi = h.multi.clone();

    let mut tasks = Vec::new();
    for _ in 0..WRITERS {
        let multi = multi.clone();
        tasks.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let mut written = Vec::new();
            for _ in 0..ITERATIONS {
                loop {
                    let (current, from) =
                        match multi.get("counter", GetOptions::default(), &cancel).await {
                            Ok((data, stat)) => {
                                let n: usize = String::from_utf8(data).unwrap().parse().unwrap();
                                (n, Precondition::Sha256(stat.sha256))
                            }
                            Err(e) if e.is_not_found() => (0, Precondition::Missing),
                            Err(e) => panic!("read failed: {}", e),
                        };
                    let next = current + 1;
                    match multi
                        .cas("counter", from, CasTo::Data(next.to_string().into_bytes()), &cancel)
                        .await
                    {
                        Ok(()) => {
                            written.push(next);
                            break;
                        }
                        Err(e) if e.is_cas_failure() => continue,
                        Err(e) => panic!("cas failed: {}", e),
                    }
                }
            }
            written
        }));
    }

    let mut all = HashSet::new();
    for t in tasks {
        for n in t.await.unwrap() {
            assert!(all.insert(n), "value {} written twice", n);
        }
    }
    let want: HashSet<usize> = (1..=WRITERS * ITERATIONS).collect();
    assert_eq!(all, want);
    let last = h.get("counter").await.unwrap();
    assert_eq!(String::from_utf8(last).unwrap(), (WRITERS * ITERATIONS).to_string());
}

#[tokio::test]
async fn test_finder_test_all_drops_failing_store() {
    let h = harness(3, 1, 1).await;
    h.mems[1].set_offline(true);
    h.finder.test_all(&CancellationToken::new()).await.unwrap();
    let stores = h.finder.stores();
    assert_eq!(stores.len(), 2);
    assert!(!stores.contains_key(&h.mems[1].uuid()));

    let info = h.finder.stores_info().unwrap();
    let dropped = info.iter().find(|s| s.uuid == h.mems[1].uuid()).unwrap();
    assert!(!dropped.connected);
    assert!(dropped.error.is_some());
}

#[tokio::test]
async fn test_finder_test_all_survives_unreadable_location() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("meta.db").to_string_lossy().to_string();
    let db = Arc::new(MetaDb::open(&path).unwrap());
    let connector = Arc::new(HttpConnector::new(0).unwrap());
    let finder = Finder::new(db.clone(), connector, test_config());
    let cancel = CancellationToken::new();
    let mems: Vec<Arc<MemStore>> = (0..3)
        .map(|i| Arc::new(MemStore::new(&format!("mem{}", i))))
        .collect();
    for mem in mems.iter() {
        finder.add_store("", mem.clone(), &cancel).await.unwrap();
    }
    let broken = mems[0].uuid();
    finder.set_dead(&broken, true).unwrap();

    {
        use slime_meta::tuple::{pack, TupleItem};
        let kv = slime_meta::KvDb::open(&path).unwrap();
        let key = pack(&[
            TupleItem::str(slime_meta::TAG_LOCATION),
            TupleItem::bytes(broken.as_bytes()),
        ]);
        kv.run(|tx| tx.set(&key, &pack(&[TupleItem::Int(0)]))).unwrap();
    }
    assert!(db.run(|tx| tx.get_location(&broken)).is_err());

    for (i, mem) in mems.iter().enumerate() {
        mem.set_capacity(1000 + i as i64);
    }
    finder.test_all(&cancel).await.unwrap();

    let stores = finder.stores();
    assert_eq!(stores.len(), 3);
    for (i, mem) in mems.iter().enumerate() {
        assert_eq!(stores[&mem.uuid()].free, 1000 + i as i64);
    }
    assert!(stores[&broken].dead);
    assert!(!stores[&mems[1].uuid()].dead);
}

#[tokio::test]
async fn test_finder_delete_location_refused_while_used() {
    let h = harness(1, 1, 1).await;
    h.put("k", Precondition::Missing, b"v").await.unwrap();
    let uuid = h.mems[0].uuid();
    assert!(h.finder.delete_location(&uuid).await.is_err());

    h.multi
        .cas("k", Precondition::Any, CasTo::Missing, &CancellationToken::new())
        .await
        .unwrap();
    h.finder.delete_location(&uuid).await.unwrap();
    assert!(h.finder.store_for(&uuid).is_none());
    assert!(h.finder.stores_info().unwrap().is_empty());
}

#[tokio::test]
async fn test_finder_scans_http_router() {
    init_logging();
    let mems: Vec<Arc<MemStore>> = (0..3)
        .map(|i| Arc::new(MemStore::new(&format!("remote{}", i))))
        .collect();
    let stores: Vec<StoreRef> = mems.iter().map(|m| m.clone() as StoreRef).collect();
    let (addr, server) = serve_stores(stores).await.unwrap();
    let url = format!("http://{}/", addr);

    let db = Arc::new(MetaDb::open_in_memory().unwrap());
    let config = MultiConfig {
        cache_size: 1 << 20,
        ..test_config()
    };
    let finder = Arc::new(Finder::new(
        db.clone(),
        Arc::new(HttpConnector::new(config.cache_size).unwrap()),
        config.clone(),
    ));
    let cancel = CancellationToken::new();
    assert_eq!(finder.scan(&url, &cancel).await.unwrap(), 3);
    assert_eq!(finder.stores().len(), 3);

    let locations = db.run(|tx| tx.all_locations()).unwrap();
    assert_eq!(locations.len(), 3);
    assert!(locations.iter().all(|l| l.url == url && l.last_seen > 0));

    // A second scan finds nothing new.
    finder.scan_all(&cancel).await.unwrap();
    assert_eq!(finder.stores().len(), 3);

    let multi = Multi::new(db.clone(), finder.clone(), config).unwrap();
    multi.set_redundancy(2, 3).unwrap();
    multi
        .cas("remote", Precondition::Missing, CasTo::Data(b"over http".to_vec()), &cancel)
        .await
        .unwrap();
    let (data, _) = multi.get("remote", GetOptions::default(), &cancel).await.unwrap();
    assert_eq!(data, b"over http");
    assert_eq!(mems.iter().map(|m| m.keys().len()).sum::<usize>(), 3);

    finder.rescan(&cancel).await.unwrap();
    assert_eq!(finder.stores().len(), 3);
    server.abort();
}

#[tokio::test]
async fn test_multi_background_loops_start_and_stop() {
    let config = MultiConfig {
        scrub_files_interval: Duration::from_millis(5),
        scrub_locations_interval: Duration::from_millis(5),
        ..test_config()
    };
    let h = harness_with(1, 1, 1, config).await;
    h.mems[0]
        .cas("stray", Precondition::Any, CasTo::Data(b"x".to_vec()), &CancellationToken::new())
        .await
        .unwrap();
    h.multi.start();
    let deadline = Instant::now() + Duration::from_secs(5);
    while h.mems[0].contains("stray") && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    h.multi.stop().await;
    assert!(!h.mems[0].contains("stray"));
    let stats = h.multi.background_stats();
    assert!(stats
        .get(&BackgroundTaskKind::ScrubLocations)
        .map(|s| s.executed > 0)
        .unwrap_or(false));
}

#[tokio::test]
async fn test_multi_admin_reports_serialize() {
    let h = harness(2, 1, 2).await;
    h.mems[1].set_offline(true);
    h.finder.test_all(&CancellationToken::new()).await.unwrap();

    let stats = serde_json::to_value(h.multi.scrub_stats()).unwrap();
    assert_eq!(stats["file_passes"], 0);
    assert!(stats["last_error"].is_null());

    let info = serde_json::to_value(h.finder.stores_info().unwrap()).unwrap();
    let rows = info.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    let offline = rows
        .iter()
        .find(|r| r["uuid"] == h.mems[1].uuid().to_string())
        .unwrap();
    assert_eq!(offline["connected"], false);
    assert!(offline["error"].is_string());
    let online = rows
        .iter()
        .find(|r| r["uuid"] == h.mems[0].uuid().to_string())
        .unwrap();
    assert!(online.get("error").is_none());

    let r = serde_json::to_string(&h.multi.redundancy()).unwrap();
    assert_eq!(r, r#"{"need":1,"total":2}"#);
}

#[tokio::test]
async fn test_multi_reopen_on_disk_db() {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let db_path = tmp.path().join("meta.db");
    let cancel = CancellationToken::new();
    let mems: Vec<Arc<MemStore>> = (0..3)
        .map(|i| Arc::new(MemStore::new(&format!("disk{}", i))))
        .collect();

    let open = |mems: Vec<Arc<MemStore>>| {
        let db_path = db_path.clone();
        let cancel = cancel.clone();
        async move {
            let db = Arc::new(MetaDb::open(&db_path.to_string_lossy()).unwrap());
            let finder = Arc::new(Finder::new(
                db.clone(),
                Arc::new(HttpConnector::new(0).unwrap()),
                test_config(),
            ));
            for mem in mems {
                finder.add_store("", mem, &cancel).await.unwrap();
            }
            Multi::new(db, finder, test_config()).unwrap()
        }
    };

    let first = open(mems.clone()).await;
    first.set_redundancy(2, 3).unwrap();
    first
        .cas("persist", Precondition::Missing, CasTo::Data(b"on disk".to_vec()), &cancel)
        .await
        .unwrap();
    let uuid = first.uuid();
    first.stop().await;
    drop(first);

    let second = open(mems).await;
    assert_eq!(second.uuid(), uuid);
    assert_eq!(second.redundancy(), Redundancy { need: 2, total: 3 });
    let (data, _) = second
        .get("persist", GetOptions::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(data, b"on disk");
}
