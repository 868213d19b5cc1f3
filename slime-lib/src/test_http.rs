use crate::{
    get_partial, list_store_uuids, new_http_client, sha256_bytes, CasTo, ChunkStoreClient,
    GetOptions, MemStore, Precondition, SlimeError, Store, StoreRef,
};
use std::sync::{Arc, Once};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

static INIT_LOGGER: Once = Once::new();

fn init_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

struct TestServer {
    base: String,
    mems: Vec<Arc<MemStore>>,
    handle: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn start_server(n: usize) -> TestServer {
    init_logging();
    let mems: Vec<Arc<MemStore>> = (0..n)
        .map(|i| Arc::new(MemStore::new(&format!("mem{}", i))))
        .collect();
    let stores: Vec<StoreRef> = mems.iter().map(|m| m.clone() as StoreRef).collect();
    let (addr, handle) = crate::serve_stores(stores).await.unwrap();
    TestServer {
        base: format!("http://{}/", addr),
        mems,
        handle,
    }
}

async fn connect(server: &TestServer, i: usize) -> ChunkStoreClient {
    let url = format!("{}{}/", server.base, server.mems[i].uuid());
    ChunkStoreClient::connect(&url, &CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_http_router_lists_uuids() {
    let server = start_server(3).await;
    let client = new_http_client().unwrap();
    let mut uuids = list_store_uuids(&client, &server.base, &CancellationToken::new())
        .await
        .unwrap();
    let mut want: Vec<_> = server.mems.iter().map(|m| m.uuid()).collect();
    uuids.sort();
    want.sort();
    assert_eq!(uuids, want);
}

#[tokio::test]
async fn test_http_client_connect_reads_identity() {
    let server = start_server(2).await;
    let store = connect(&server, 1).await;
    assert_eq!(store.uuid(), server.mems[1].uuid());
    assert_eq!(store.name(), "mem1");
}

#[tokio::test]
async fn test_http_cas_roundtrip() {
    let server = start_server(1).await;
    let store = connect(&server, 0).await;
    let cancel = CancellationToken::new();

    store
        .cas("k_1", Precondition::Missing, CasTo::Data(b"hello".to_vec()), &cancel)
        .await
        .unwrap();
    assert!(server.mems[0].contains("k_1"));

    let (data, stat) = store.get("k_1", GetOptions::default(), &cancel).await.unwrap();
    assert_eq!(data, b"hello");
    assert_eq!(stat.sha256, sha256_bytes(b"hello"));
    assert_eq!(stat.size, 5);

    let head = store.stat("k_1", &cancel).await.unwrap();
    assert_eq!(head.sha256, stat.sha256);
    assert_eq!(head.size, 5);
    assert!(head.write_time > 0);

    let err = store
        .cas("k_1", Precondition::Missing, CasTo::Data(b"again".to_vec()), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cas_failure());

    let err = store
        .cas(
            "k_1",
            Precondition::Sha256(sha256_bytes(b"nope")),
            CasTo::Missing,
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(err.is_cas_failure());

    store
        .cas(
            "k_1",
            Precondition::Sha256(sha256_bytes(b"hello")),
            CasTo::Missing,
            &cancel,
        )
        .await
        .unwrap();
    assert!(store
        .get("k_1", GetOptions::default(), &cancel)
        .await
        .unwrap_err()
        .is_not_found());

    // Unconditional delete of a missing key is not an error for the client.
    store
        .cas("k_1", Precondition::Any, CasTo::Missing, &cancel)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_http_list_and_free() {
    let server = start_server(1).await;
    let store = connect(&server, 0).await;
    let cancel = CancellationToken::new();
    server.mems[0].set_capacity(1000);

    for key in ["a", "b", "c"] {
        store
            .cas(key, Precondition::Any, CasTo::Data(vec![1u8; 10]), &cancel)
            .await
            .unwrap();
    }
    assert_eq!(store.list("", 0, &cancel).await.unwrap(), vec!["a", "b", "c"]);
    assert_eq!(store.list("a", 1, &cancel).await.unwrap(), vec!["b"]);
    assert_eq!(store.free_space(&cancel).await.unwrap(), 970);
}

#[tokio::test]
async fn test_http_range_reads() {
    let server = start_server(1).await;
    let store = connect(&server, 0).await;
    let cancel = CancellationToken::new();
    store
        .cas("r", Precondition::Any, CasTo::Data(b"hello world".to_vec()), &cancel)
        .await
        .unwrap();

    let (part, stat) = get_partial(&store, "r", 6, 5, &cancel).await.unwrap();
    assert_eq!(part, b"world");
    assert_eq!(stat.size, 11);

    let (tail, _) = get_partial(&store, "r", 2, -1, &cancel).await.unwrap();
    assert_eq!(tail, b"llo world");

    let err = get_partial(&store, "r", 50, 1, &cancel).await.unwrap_err();
    assert!(matches!(err, SlimeError::BadArgument(_)));
}

#[tokio::test]
async fn test_http_key_escaping() {
    let server = start_server(1).await;
    let store = connect(&server, 0).await;
    let cancel = CancellationToken::new();
    let key = "dir/with space?and#marks";
    store
        .cas(key, Precondition::Any, CasTo::Data(b"x".to_vec()), &cancel)
        .await
        .unwrap();
    assert!(server.mems[0].contains(key));
    let (data, _) = store.get(key, GetOptions::default(), &cancel).await.unwrap();
    assert_eq!(data, b"x");
}

#[tokio::test]
async fn test_http_unknown_store_is_not_found() {
    let server = start_server(1).await;
    let url = format!("{}{}/", server.base, crate::new_uuid());
    let err = ChunkStoreClient::connect(&url, &CancellationToken::new())
        .await
        .err()
        .unwrap();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_http_offline_store_surfaces_error() {
    let server = start_server(1).await;
    let store = connect(&server, 0).await;
    server.mems[0].set_offline(true);
    let err = store.free_space(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, SlimeError::RemoteError(_)));
}

#[tokio::test]
async fn test_http_range_overflow_is_bad_argument() {
    let server = start_server(1).await;
    let store = connect(&server, 0).await;
    let cancel = CancellationToken::new();
    store
        .cas("r", Precondition::Any, CasTo::Data(b"abc".to_vec()), &cancel)
        .await
        .unwrap();
    let err = get_partial(&store, "r", u64::MAX - 1, 10, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, SlimeError::BadArgument(_)));
}

#[tokio::test]
async fn test_http_put_over_limit_is_refused() {
    init_logging();
    let mem = Arc::new(MemStore::new("small"));
    let router = crate::StoreRouter::with_max_put_size(vec![mem.clone() as StoreRef], 16);
    let filter = router.filter();
    let path = format!("/{}/big", mem.uuid());

    let resp = warp::test::request()
        .method("PUT")
        .path(&path)
        .body(vec![7u8; 17])
        .reply(&filter)
        .await;
    assert_eq!(resp.status(), 413);
    assert!(!mem.contains("big"));

    let resp = warp::test::request()
        .method("PUT")
        .path(&path)
        .body(vec![7u8; 16])
        .reply(&filter)
        .await;
    assert_eq!(resp.status(), 204);
    assert!(mem.contains("big"));

    let resp = warp::test::request()
        .method("GET")
        .path(&path)
        .reply(&filter)
        .await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.body().len(), 16);
}
