use crate::records::{file_location_key, location_list_key, prefix_key, wal_legacy_key};
use crate::*;
use slime_lib::{unix_timestamp, SlimeError};
use std::sync::Once;
use uuid::Uuid;

static INIT_LOGGER: Once = Once::new();

fn init_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn create_db() -> MetaDb {
    init_logging();
    MetaDb::open_in_memory().unwrap()
}

fn make_file(path: &str, locations: Vec<Uuid>) -> File {
    File {
        path: path.to_string(),
        size: 5,
        sha256: slime_lib::sha256_bytes(path.as_bytes()),
        write_time: unix_timestamp(),
        prefix_id: new_prefix_id(),
        data_chunks: 1,
        mapping_value: 0,
        locations,
    }
}

#[test]
fn test_meta_file_crud() {
    let db = create_db();
    let loc = Uuid::new_v4();
    let f = make_file("a", vec![loc]);

    db.run(|tx| tx.set_file(&f)).unwrap();
    assert_eq!(db.run(|tx| tx.get_file("a")).unwrap(), Some(f.clone()));
    assert_eq!(db.run(|tx| tx.get_file("b")).unwrap(), None);

    db.run(|tx| tx.delete_file("a")).unwrap();
    assert_eq!(db.run(|tx| tx.get_file("a")).unwrap(), None);
    assert!(db
        .run(|tx| tx.get_location_contents(&loc, "", 0))
        .unwrap()
        .is_empty());
    assert_eq!(db.run(|tx| tx.path_for_prefix_id(&f.prefix_id)).unwrap(), None);
}

#[test]
fn test_meta_set_file_moves_indices() {
    let db = create_db();
    let (l1, l2, l3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let old = make_file("obj", vec![l1, l2]);
    db.run(|tx| tx.set_file(&old)).unwrap();

    let mut new = make_file("obj", vec![l2, l3]);
    new.data_chunks = 1;
    db.run(|tx| tx.set_file(&new)).unwrap();

    let by_l1 = db.run(|tx| tx.get_files_by_location(&l1, "", 0)).unwrap();
    assert!(by_l1.is_empty());
    let by_l3 = db.run(|tx| tx.get_files_by_location(&l3, "", 0)).unwrap();
    assert_eq!(by_l3, vec![new.clone()]);

    assert_eq!(
        db.run(|tx| tx.get_location_contents(&l2, "", 0)).unwrap(),
        vec![new.local_key(0)]
    );
    assert_eq!(db.run(|tx| tx.path_for_prefix_id(&old.prefix_id)).unwrap(), None);
    assert_eq!(
        db.run(|tx| tx.path_for_prefix_id(&new.prefix_id)).unwrap(),
        Some("obj".to_string())
    );
}

#[test]
fn test_meta_list_files_paging() {
    let db = create_db();
    let loc = Uuid::new_v4();
    for p in ["a", "ab", "b", "c"] {
        let f = make_file(p, vec![loc]);
        db.run(|tx| tx.set_file(&f)).unwrap();
    }
    let paths = |after: &str, limit: i64| -> Vec<String> {
        db.run(|tx| tx.list_files(after, limit))
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect()
    };
    assert_eq!(paths("", 0), vec!["a", "ab", "b", "c"]);
    assert_eq!(paths("a", 2), vec!["ab", "b"]);
    assert_eq!(paths("c", 0), Vec::<String>::new());

    let err = db.run(|tx| tx.list_files("", -1)).unwrap_err();
    assert!(matches!(err, SlimeError::BadArgument(_)));

    let by_loc: Vec<String> = db
        .run(|tx| tx.get_files_by_location(&loc, "ab", 0))
        .unwrap()
        .into_iter()
        .map(|f| f.path)
        .collect();
    assert_eq!(by_loc, vec!["b", "c"]);
}

#[test]
fn test_meta_location_contents_after() {
    let db = create_db();
    let loc = Uuid::new_v4();
    let mut keys = Vec::new();
    for p in ["x", "y", "z"] {
        let f = make_file(p, vec![loc]);
        keys.push(f.local_key(0));
        db.run(|tx| tx.set_file(&f)).unwrap();
    }
    keys.sort();
    let all = db.run(|tx| tx.get_location_contents(&loc, "", 0)).unwrap();
    assert_eq!(all, keys);
    let rest = db
        .run(|tx| tx.get_location_contents(&loc, &keys[0], 1))
        .unwrap();
    assert_eq!(rest, vec![keys[1].clone()]);
}

#[test]
fn test_meta_location_should_have() {
    let db = create_db();
    let (l1, l2) = (Uuid::new_v4(), Uuid::new_v4());
    let f = make_file("obj", vec![l1, l2]);
    db.run(|tx| tx.set_file(&f)).unwrap();

    assert!(db.run(|tx| tx.location_should_have(&l1, &f.local_key(0))).unwrap());
    assert!(!db.run(|tx| tx.location_should_have(&l1, &f.local_key(1))).unwrap());
    assert!(!db.run(|tx| tx.location_should_have(&l1, "junk")).unwrap());
    let orphan = local_key(&new_prefix_id(), &f.sha256, 0);
    assert!(!db.run(|tx| tx.location_should_have(&l1, &orphan)).unwrap());
}

#[test]
fn test_meta_locations() {
    let db = create_db();
    let mut loc = Location::new(Uuid::new_v4());
    loc.url = "http://127.0.0.1:1/".to_string();
    loc.name = "one".to_string();
    db.run(|tx| tx.set_location(&loc)).unwrap();
    assert_eq!(db.run(|tx| tx.get_location(&loc.uuid)).unwrap(), Some(loc.clone()));

    let other = Location::new(Uuid::new_v4());
    db.run(|tx| tx.set_location(&other)).unwrap();
    assert_eq!(db.run(|tx| tx.all_locations()).unwrap().len(), 2);

    let f = make_file("held", vec![loc.uuid]);
    db.run(|tx| tx.set_file(&f)).unwrap();
    let err = db.run(|tx| tx.delete_location(&loc.uuid)).unwrap_err();
    assert!(matches!(err, SlimeError::BadArgument(_)));

    db.run(|tx| tx.delete_file("held")).unwrap();
    db.run(|tx| tx.delete_location(&loc.uuid)).unwrap();
    assert_eq!(db.run(|tx| tx.get_location(&loc.uuid)).unwrap(), None);
    assert_eq!(db.run(|tx| tx.all_locations()).unwrap(), vec![other]);
}

#[test]
fn test_meta_wal_mark_and_clear() {
    let db = create_db();
    let p = new_prefix_id();
    assert!(!db.run(|tx| tx.wal_check(&p)).unwrap());
    db.run(|tx| tx.wal_mark(&p)).unwrap();
    db.run(|tx| tx.wal_mark(&p)).unwrap();
    assert!(db.run(|tx| tx.wal_check(&p)).unwrap());
    db.run(|tx| tx.wal_clear(&p)).unwrap();
    assert!(db.run(|tx| tx.wal_check(&p)).unwrap());
    db.run(|tx| tx.wal_clear(&p)).unwrap();
    assert!(!db.run(|tx| tx.wal_check(&p)).unwrap());
    // Clearing an unmarked prefix is a no-op.
    db.run(|tx| tx.wal_clear(&p)).unwrap();
}

#[test]
fn test_meta_wal_clear_old() {
    let db = create_db();
    let policy = WalPolicy::default();
    let p = new_prefix_id();
    db.run(|tx| tx.wal_mark(&p)).unwrap();
    let now = unix_timestamp();

    assert_eq!(db.wal_clear_old(now, &policy).unwrap(), 0);

    // Ninety days on, the mark looks corrupt and is left alone.
    let far = now + 100 * 24 * 3600;
    assert_eq!(db.wal_clear_old(far, &policy).unwrap(), 0);
    assert!(db.run(|tx| tx.wal_check(&p)).unwrap());

    let week = now + 8 * 24 * 3600;
    assert_eq!(db.wal_clear_old(week, &policy).unwrap(), 1);
    assert!(!db.run(|tx| tx.wal_check(&p)).unwrap());
}

#[test]
fn test_meta_wal_clear_old_pages() {
    let db = create_db();
    let prefixes: Vec<PrefixId> = (0..250).map(|_| new_prefix_id()).collect();
    db.run(|tx| {
        for p in prefixes.iter() {
            tx.wal_mark(p)?;
        }
        Ok(())
    })
    .unwrap();
    let week = unix_timestamp() + 8 * 24 * 3600;
    assert_eq!(db.wal_clear_old(week, &WalPolicy::default()).unwrap(), 250);
}

#[test]
fn test_meta_legacy_wal_is_honoured() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meta.db").to_string_lossy().to_string();
    let p = new_prefix_id();
    {
        let kv = KvDb::open(&path).unwrap();
        kv.run(|tx| tx.set(&wal_legacy_key(&p), b"1")).unwrap();
    }
    let db = MetaDb::open(&path).unwrap();
    assert!(db.run(|tx| tx.wal_check(&p)).unwrap());
}

#[test]
fn test_meta_config_and_reindex() {
    let db = create_db();
    db.run(|tx| tx.set_config("need", b"2")).unwrap();
    assert_eq!(
        db.run(|tx| tx.get_config_string("need")).unwrap(),
        Some("2".to_string())
    );
    assert_eq!(db.run(|tx| tx.get_config("total")).unwrap(), None);

    let loc = Uuid::new_v4();
    for p in ["r1", "r2", "r3"] {
        let f = make_file(p, vec![loc]);
        db.run(|tx| tx.set_file(&f)).unwrap();
    }
    assert_eq!(db.reindex().unwrap(), 3);
    assert_eq!(
        db.run(|tx| tx.get_files_by_location(&loc, "", 0)).unwrap().len(),
        3
    );
    assert_eq!(
        db.run(|tx| tx.get_location_contents(&loc, "", 0)).unwrap().len(),
        3
    );
    // Config survives a reindex.
    assert!(db.run(|tx| tx.get_config("need")).unwrap().is_some());
}

#[test]
fn test_meta_reindex_keeps_live_chunks_owned_between_pages() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meta.db").to_string_lossy().to_string();
    let db = MetaDb::open(&path).unwrap();

    let loc = Uuid::new_v4();
    let files: Vec<File> = (0..5).map(|i| make_file(&format!("f{}", i), vec![loc])).collect();
    for f in files.iter() {
        db.run(|tx| tx.set_file(f)).unwrap();
    }

    let gone = Uuid::new_v4();
    let damaged = &files[4];
    {
        let kv = KvDb::open(&path).unwrap();
        kv.run(|tx| {
            tx.set(&file_location_key(&gone, "f0"), b"")?;
            tx.set(&location_list_key(&gone, &files[0].local_key(0)), b"")?;
            tx.set(&prefix_key(&new_prefix_id()), b"f1")?;
            tx.delete(&prefix_key(&damaged.prefix_id))
        })
        .unwrap();
    }
    assert!(!db
        .run(|tx| tx.location_should_have(&loc, &damaged.local_key(0)))
        .unwrap());

    let mut pages = 0;
    let count = db
        .reindex_paged(1, || {
            pages += 1;
            for f in files[..4].iter() {
                assert!(db.run(|tx| tx.location_should_have(&loc, &f.local_key(0)))?);
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(count, 5);
    assert!(pages > 5);

    for f in files.iter() {
        assert!(db.run(|tx| tx.location_should_have(&loc, &f.local_key(0))).unwrap());
    }
    assert!(db.run(|tx| tx.get_files_by_location(&gone, "", 0)).unwrap().is_empty());
    assert!(db.run(|tx| tx.get_location_contents(&gone, "", 0)).unwrap().is_empty());
    assert_eq!(db.run(|tx| tx.get_location_contents(&loc, "", 0)).unwrap().len(), 5);
}
