use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;

use stormsync_common::StoreError;
use stormsync_protocol::Frame;
use stormsync_storage::{
    Compare, Connection, HashScan, KeyValueStore, RespConfig, RespStore, SetOptions, Txn, TxnOp,
};

type Handler = Arc<dyn Fn(&[String]) -> Frame + Send + Sync>;

/// Servidor RESP de teste: responde cada comando com o handler e registra
/// os comandos recebidos.
struct Responder {
    addr: String,
    log: Arc<Mutex<Vec<Vec<String>>>>,
    accepted: Arc<AtomicUsize>,
}

impl Responder {
    fn commands(&self) -> Vec<Vec<String>> {
        self.log.lock().unwrap().clone()
    }
}

async fn start_responder(handler: Handler) -> Responder {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let log = Arc::new(Mutex::new(Vec::new()));
    let accepted = Arc::new(AtomicUsize::new(0));

    {
        let log = log.clone();
        let accepted = accepted.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                accepted.fetch_add(1, Ordering::SeqCst);

                let handler = handler.clone();
                let log = log.clone();
                tokio::spawn(async move {
                    let mut conn = Connection::new(socket);
                    while let Ok(Some(frame)) = conn.read_frame().await {
                        let Frame::Array(items) = frame else { return };
                        let args: Vec<String> = items
                            .into_iter()
                            .map(|item| match item {
                                Frame::Bulk(data) => String::from_utf8_lossy(&data).into_owned(),
                                other => format!("{other:?}"),
                            })
                            .collect();
                        log.lock().unwrap().push(args.clone());
                        let reply = handler(&args);
                        if conn.write_frame(&reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
    }

    Responder {
        addr,
        log,
        accepted,
    }
}

/// Handler mínimo de strings, suficiente para GET/SET/DEL.
fn string_handler() -> Handler {
    let data: Mutex<HashMap<String, String>> = Mutex::new(HashMap::new());
    Arc::new(move |args: &[String]| {
        let mut data = data.lock().unwrap();
        match args[0].as_str() {
            "PING" => Frame::Simple("PONG".into()),
            "GET" => data.get(&args[1]).map_or(Frame::Null, |v| Frame::bulk(v)),
            "SET" => {
                let nx = args.iter().any(|a| a == "NX");
                if nx && data.contains_key(&args[1]) {
                    Frame::Null
                } else {
                    data.insert(args[1].clone(), args[2].clone());
                    Frame::Simple("OK".into())
                }
            }
            "DEL" => {
                let n = args[1..].iter().filter(|k| data.remove(*k).is_some()).count();
                Frame::Integer(n as i64)
            }
            "HGET" => Frame::Error("ERR boom".into()),
            "LPUSH" => Frame::Error("WRONGTYPE Operation against a key holding the wrong kind of value".into()),
            other => Frame::Error(format!("ERR unknown command '{other}'")),
        }
    })
}

#[tokio::test]
async fn test_string_round_trip() {
    let responder = start_responder(string_handler()).await;
    let store = RespStore::connect(RespConfig::new(&responder.addr))
        .await
        .unwrap();

    assert!(store.set("k", Bytes::from("v"), SetOptions::default()).await.unwrap());
    assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from("v")));
    assert_eq!(store.get("missing").await.unwrap(), None);
    assert_eq!(
        store.del(&["k".into(), "missing".into()]).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_set_if_absent_with_lease_arguments() {
    let responder = start_responder(string_handler()).await;
    let store = RespStore::new(RespConfig::new(&responder.addr));

    let lease = SetOptions::if_absent_with_lease(Duration::from_millis(5000));
    assert!(store.set("lock:a", Bytes::from("tok"), lease.clone()).await.unwrap());
    assert!(!store.set("lock:a", Bytes::from("other"), lease).await.unwrap());

    let commands = responder.commands();
    assert_eq!(commands[0], vec!["SET", "lock:a", "tok", "PX", "5000", "NX"]);
}

#[tokio::test]
async fn test_auth_is_sent_on_connect() {
    let handler: Handler = Arc::new(|args: &[String]| match args[0].as_str() {
        "AUTH" if args[1] == "secret" => Frame::Simple("OK".into()),
        "AUTH" => Frame::Error("WRONGPASS invalid password".into()),
        _ => Frame::Simple("PONG".into()),
    });
    let responder = start_responder(handler).await;

    RespStore::connect(RespConfig::new(&responder.addr).with_password("secret"))
        .await
        .unwrap();
    assert_eq!(responder.commands()[0], vec!["AUTH", "secret"]);

    let denied = RespStore::connect(RespConfig::new(&responder.addr).with_password("nope")).await;
    assert!(matches!(denied, Err(StoreError::Server(msg)) if msg.starts_with("WRONGPASS")));
}

#[tokio::test]
async fn test_error_reply_keeps_connection_pooled() {
    let responder = start_responder(string_handler()).await;
    let store = RespStore::connect(RespConfig::new(&responder.addr).with_max_connections(1))
        .await
        .unwrap();

    let err = store.hget("h", "f").await.unwrap_err();
    assert!(matches!(err, StoreError::Server(msg) if msg == "ERR boom"));

    let err = store.lpush("k", &[Bytes::from("x")]).await.unwrap_err();
    assert!(matches!(err, StoreError::WrongType));

    store.ping().await.unwrap();
    assert_eq!(responder.accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_txn_runs_as_eval() {
    let handler: Handler = Arc::new(|args: &[String]| match args[0].as_str() {
        "EVAL" => Frame::Array(vec![Frame::Integer(1), Frame::Array(vec![Frame::Integer(1)])]),
        _ => Frame::Simple("PONG".into()),
    });
    let responder = start_responder(handler).await;
    let store = RespStore::new(RespConfig::new(&responder.addr));

    let release = Txn::new()
        .when(Compare::value_equals("lock:a", "tok"))
        .then(TxnOp::Del {
            key: "lock:a".into(),
        });
    let response = store.txn(release).await.unwrap();
    assert!(response.succeeded);
    assert_eq!(response.first_count(), 1);

    let commands = responder.commands();
    let eval = &commands[0];
    assert_eq!(eval[0], "EVAL");
    assert!(eval[1].starts_with("local ok = true"));
    assert_eq!(&eval[2..], &["2", "lock:a", "lock:a", "tok"]);
}

#[tokio::test]
async fn test_blpop_reply_shapes() {
    let calls = AtomicUsize::new(0);
    let handler: Handler = Arc::new(move |args: &[String]| match args[0].as_str() {
        "BLPOP" if calls.fetch_add(1, Ordering::SeqCst) == 0 => Frame::Null,
        "BLPOP" => Frame::Array(vec![Frame::bulk(&args[1]), Frame::bulk("job")]),
        _ => Frame::Simple("PONG".into()),
    });
    let responder = start_responder(handler).await;
    let store = RespStore::new(RespConfig::new(&responder.addr));

    assert_eq!(store.blpop("q", Duration::from_millis(500)).await.unwrap(), None);
    assert_eq!(
        store.blpop("q", Duration::from_millis(500)).await.unwrap(),
        Some(Bytes::from("job"))
    );
    assert_eq!(responder.commands()[0], vec!["BLPOP", "q", "0.5"]);
}

#[tokio::test]
async fn test_hash_scan_follows_cursor() {
    let handler: Handler = Arc::new(|args: &[String]| match (args[0].as_str(), args[2].as_str()) {
        ("HSCAN", "0") => Frame::Array(vec![
            Frame::bulk("9"),
            Frame::Array(vec![Frame::bulk("a"), Frame::bulk("1")]),
        ]),
        ("HSCAN", _) => Frame::Array(vec![
            Frame::bulk("0"),
            Frame::Array(vec![Frame::bulk("b"), Frame::bulk("2")]),
        ]),
        _ => Frame::Error("ERR unexpected".into()),
    });
    let responder = start_responder(handler).await;
    let store: Arc<dyn KeyValueStore> = Arc::new(RespStore::new(RespConfig::new(&responder.addr)));

    let items = HashScan::new(store, "markers").collect().await.unwrap();
    assert_eq!(
        items,
        vec![
            ("a".to_string(), Bytes::from("1")),
            ("b".to_string(), Bytes::from("2")),
        ]
    );

    let commands = responder.commands();
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[1][2], "9");
}

/// Roda contra um Redis real apenas quando `STORMSYNC_REDIS_ADDR` está definido.
#[tokio::test]
async fn test_live_redis_transactions() {
    let Ok(addr) = std::env::var("STORMSYNC_REDIS_ADDR") else {
        return;
    };
    let store = RespStore::connect(RespConfig::new(addr)).await.unwrap();
    let suffix = unique_suffix();
    let lock_key = format!("stormsync-test:lock:{suffix}");
    let delayed = format!("stormsync-test:queue:{suffix}:delayed");
    let ready = format!("stormsync-test:queue:{suffix}");

    let lease = SetOptions::if_absent_with_lease(Duration::from_secs(5));
    assert!(store.set(&lock_key, Bytes::from("tok"), lease.clone()).await.unwrap());
    assert!(!store.set(&lock_key, Bytes::from("other"), lease).await.unwrap());

    let wrong = Txn::new()
        .when(Compare::value_equals(lock_key.clone(), "other"))
        .then(TxnOp::Del {
            key: lock_key.clone(),
        });
    assert!(!store.txn(wrong).await.unwrap().succeeded);

    let release = Txn::new()
        .when(Compare::value_equals(lock_key.clone(), "tok"))
        .then(TxnOp::Del {
            key: lock_key.clone(),
        });
    assert_eq!(store.txn(release).await.unwrap().first_count(), 1);

    store.zadd(&delayed, 2.0, Bytes::from("second")).await.unwrap();
    store.zadd(&delayed, 1.0, Bytes::from("first")).await.unwrap();
    store.zadd(&delayed, 99.0, Bytes::from("later")).await.unwrap();
    let move_due = Txn::new().then(TxnOp::MoveDue {
        from: delayed.clone(),
        to: ready.clone(),
        max_score: 10.0,
    });
    assert_eq!(store.txn(move_due).await.unwrap().first_count(), 2);
    assert_eq!(
        store.lrange(&ready, 0, -1).await.unwrap(),
        vec![Bytes::from("first"), Bytes::from("second")]
    );

    store.del(&[delayed, ready]).await.unwrap();
}

fn unique_suffix() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos()
}
