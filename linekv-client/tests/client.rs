use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use linekv_client::{Arg, Client, ClientError, ConnectionConfig, HashEntry};
use linekv_protocol::{Decoder, Encoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn read_frame(stream: &mut TcpStream, decoder: &mut Decoder) -> Option<Vec<String>> {
    let mut buf = [0u8; 4096];
    loop {
        if let Some(parts) = decoder.decode_frame().expect("malformed request") {
            return Some(parts);
        }
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => decoder.extend(&buf[..n]),
        }
    }
}

async fn write_reply(stream: &mut TcpStream, parts: &[&str]) {
    let mut out = Vec::new();
    for part in parts {
        out.extend_from_slice(format!("{}\n", part.len()).as_bytes());
        out.extend_from_slice(part.as_bytes());
        out.push(b'\n');
    }
    out.push(b'\n');
    stream.write_all(&out).await.expect("write reply");
}

async fn bind() -> (TcpListener, ConnectionConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let config = ConnectionConfig::new(addr.ip().to_string(), addr.port());
    (listener, config)
}

#[tokio::test]
async fn set_get_roundtrip() {
    let (listener, config) = bind().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut decoder = Decoder::new();

        let cmd = read_frame(&mut stream, &mut decoder).await.expect("set");
        assert_eq!(cmd, ["set", "k", "v"]);
        write_reply(&mut stream, &["ok", "1"]).await;

        let cmd = read_frame(&mut stream, &mut decoder).await.expect("get");
        assert_eq!(cmd, ["get", "k"]);
        write_reply(&mut stream, &["ok", "v"]).await;
    });

    let client = Client::connect(config).await.expect("connect");
    assert!(client.set("k", "v").await.expect("set"));
    assert_eq!(client.get("k").await.expect("get"), "v");
    client.close();
}

#[tokio::test]
async fn typed_decoding() {
    let (listener, config) = bind().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut decoder = Decoder::new();

        read_frame(&mut stream, &mut decoder).await.expect("get");
        write_reply(&mut stream, &["not_found"]).await;

        read_frame(&mut stream, &mut decoder).await.expect("hgetall");
        write_reply(&mut stream, &["ok", "a", "1", "b", "2"]).await;

        read_frame(&mut stream, &mut decoder).await.expect("hsize");
        write_reply(&mut stream, &["ok", "2"]).await;
    });

    let client = Client::connect(config).await.expect("connect");

    let err = client.get("missing").await.expect_err("missing key");
    assert!(err.is_not_found());

    let map = client.hgetall("h").await.expect("hgetall");
    assert_eq!(map.len(), 2);
    assert_eq!(map["a"], "1");
    assert_eq!(map["b"], "2");

    assert_eq!(client.hsize("h").await.expect("hsize"), 2);
    client.close();
}

#[tokio::test]
async fn hkeys_all_pages_until_size_reached() {
    let (listener, config) = bind().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut decoder = Decoder::new();

        let cmd = read_frame(&mut stream, &mut decoder).await.expect("hsize");
        assert_eq!(cmd, ["hsize", "h"]);
        write_reply(&mut stream, &["ok", "20"]).await;

        let cmd = read_frame(&mut stream, &mut decoder).await.expect("first page");
        assert_eq!(cmd, ["hkeys", "h", "", "", "15"]);
        let page: Vec<String> = (1..=15).map(|i| format!("k{i:02}")).collect();
        let mut reply: Vec<&str> = vec!["ok"];
        reply.extend(page.iter().map(String::as_str));
        write_reply(&mut stream, &reply).await;

        // The second window starts after the last key of the first.
        let cmd = read_frame(&mut stream, &mut decoder).await.expect("second page");
        assert_eq!(cmd, ["hkeys", "h", "k15", "", "15"]);
        write_reply(&mut stream, &["ok", "k16", "k17", "k18", "k19", "k20"]).await;
    });

    let client = Client::connect(config).await.expect("connect");
    let keys = client.hkeys_all("h").await.expect("hkeys_all");
    assert_eq!(keys.len(), 20);
    assert_eq!(keys.first().map(String::as_str), Some("k01"));
    assert_eq!(keys.last().map(String::as_str), Some("k20"));
    client.close();
}

#[tokio::test]
async fn auth_handshake_runs_before_commands() {
    let (listener, mut config) = bind().await;
    config = config.with_auth_token("secret");
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut decoder = Decoder::new();

        let cmd = read_frame(&mut stream, &mut decoder).await.expect("auth");
        assert_eq!(cmd, ["auth", "secret"]);
        write_reply(&mut stream, &["ok", "1"]).await;

        let cmd = read_frame(&mut stream, &mut decoder).await.expect("ping");
        assert_eq!(cmd, ["ping"]);
        write_reply(&mut stream, &["ok"]).await;
    });

    let client = Client::connect(config).await.expect("connect");
    client.ping().await.expect("ping");
    client.close();
}

#[tokio::test]
async fn rejected_auth_fails_connect() {
    let (listener, mut config) = bind().await;
    config = config.with_auth_token("wrong");
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut decoder = Decoder::new();
        read_frame(&mut stream, &mut decoder).await.expect("auth");
        write_reply(&mut stream, &["ok", "0"]).await;
    });

    let err = Client::connect(config).await.expect_err("auth must fail");
    assert!(matches!(err, ClientError::AuthFailed));
}

#[tokio::test]
async fn timeout_discards_late_reply() {
    let (listener, config) = bind().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut decoder = Decoder::new();

        let cmd = read_frame(&mut stream, &mut decoder).await.expect("slow");
        assert_eq!(cmd, ["slow"]);
        tokio::time::sleep(Duration::from_millis(200)).await;
        write_reply(&mut stream, &["ok", "late"]).await;

        let cmd = read_frame(&mut stream, &mut decoder).await.expect("ping");
        assert_eq!(cmd, ["ping"]);
        write_reply(&mut stream, &["ok"]).await;
    });

    let client = Client::connect(config).await.expect("connect");

    let err = client
        .execute_with_timeout(vec![Arg::from("slow")], 50)
        .await
        .expect_err("must time out");
    assert!(matches!(err, ClientError::Timeout(50)));

    // The late reply to "slow" must be drained, not handed to this call.
    let parts = client
        .execute(vec![Arg::from("ping")])
        .await
        .expect("ping after timeout");
    assert_eq!(parts, ["ok"]);
    client.close();
}

#[tokio::test]
async fn compressed_requests_and_responses() {
    let (listener, mut config) = bind().await;
    config = config.with_compression(true);
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        // The shared decoder inflates the request envelope transparently.
        let mut decoder = Decoder::new();

        let cmd = read_frame(&mut stream, &mut decoder).await.expect("hset");
        assert_eq!(cmd, ["hset", "h", "k", "v"]);
        write_reply(&mut stream, &["ok", "1"]).await;

        let cmd = read_frame(&mut stream, &mut decoder).await.expect("hgetall");
        assert_eq!(cmd, ["hgetall", "h"]);
        let reply = Encoder::encode(
            &[Arg::from("ok"), Arg::from("k"), Arg::from("v")],
            true,
        )
        .expect("encode reply");
        stream.write_all(&reply).await.expect("write reply");
    });

    let client = Client::connect(config).await.expect("connect");
    assert_eq!(client.hset("h", "k", "v").await.expect("hset"), "1");
    let map = client.hgetall("h").await.expect("hgetall");
    assert_eq!(map["k"], "v");
    client.close();
}

#[tokio::test]
async fn batch_executor_partitions_input() {
    let (listener, config) = bind().await;
    let counts: Arc<tokio::sync::Mutex<Vec<usize>>> = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let served_counts = counts.clone();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let counts = served_counts.clone();
            tokio::spawn(async move {
                let mut decoder = Decoder::new();
                let mut served = 0usize;
                while read_frame(&mut stream, &mut decoder).await.is_some() {
                    served += 1;
                    write_reply(&mut stream, &["ok", "1"]).await;
                }
                counts.lock().await.push(served);
            });
        }
    });

    let client = Client::connect(config).await.expect("connect");
    let commands: Vec<Vec<Arg>> = (0..5000)
        .map(|i| {
            vec![
                Arg::from("hset"),
                Arg::from("h"),
                Arg::from(format!("k{i}")),
                Arg::from("v"),
            ]
        })
        .collect();
    client.batch_send(commands).await.expect("batch");

    // Chunk connections report their tallies at EOF, shortly after
    // batch_send returns.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let mut tallies: Vec<usize> = counts
            .lock()
            .await
            .iter()
            .copied()
            .filter(|&n| n > 0)
            .collect();
        tallies.sort_unstable();
        if tallies == [1000, 2000, 2000] {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "chunk tallies never settled: {tallies:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The caller's own connection took no part in the batch.
    assert!(client.connection().is_ready());
    client.close();
}

#[tokio::test]
async fn multi_write_spreads_entries() {
    let (listener, config) = bind().await;
    let connections = Arc::new(AtomicUsize::new(0));
    let writes = Arc::new(AtomicUsize::new(0));
    let server_connections = connections.clone();
    let server_writes = writes.clone();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            server_connections.fetch_add(1, Ordering::SeqCst);
            let writes = server_writes.clone();
            tokio::spawn(async move {
                let mut decoder = Decoder::new();
                while let Some(cmd) = read_frame(&mut stream, &mut decoder).await {
                    assert_eq!(cmd[0], "hset");
                    writes.fetch_add(1, Ordering::SeqCst);
                    write_reply(&mut stream, &["ok", "1"]).await;
                }
            });
        }
    });

    let client = Client::connect(config).await.expect("connect");
    let entries: Vec<HashEntry> = (0..10)
        .map(|i| HashEntry::new("h", format!("k{i}"), "v"))
        .collect();
    client
        .multi_hash_set(entries, 3)
        .await
        .expect("multi write");

    assert_eq!(writes.load(Ordering::SeqCst), 10);
    // The caller's connection plus two extras.
    assert_eq!(connections.load(Ordering::SeqCst), 3);
    client.close();
}

#[tokio::test]
async fn exec_batch_ships_queue_as_json() {
    let (listener, config) = bind().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut decoder = Decoder::new();
        let cmd = read_frame(&mut stream, &mut decoder).await.expect("batchexec");
        assert_eq!(cmd[0], "batchexec");
        let queued: Vec<Vec<String>> = serde_json::from_str(&cmd[1]).expect("payload");
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0], ["set", "a", "1"]);
        assert_eq!(queued[1], ["set", "b", "2"]);
        write_reply(&mut stream, &["ok", r#"[["ok"],["ok"]]"#]).await;
    });

    let client = Client::connect(config).await.expect("connect");
    client.batch_append(vec!["set".into(), "a".into(), "1".into()]);
    client.batch_append(vec!["set".into(), "b".into(), "2".into()]);
    let results = client.exec_batch().await.expect("exec");
    assert_eq!(results, vec![vec!["ok".to_string()], vec!["ok".to_string()]]);

    // The queue was consumed.
    let err = client.exec_batch().await.expect_err("empty queue");
    assert!(matches!(err, ClientError::EmptyBatch));
    client.close();
}

#[tokio::test]
async fn close_is_idempotent_and_rejects_submissions() {
    let (listener, config) = bind().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut decoder = Decoder::new();
        while read_frame(&mut stream, &mut decoder).await.is_some() {
            write_reply(&mut stream, &["ok"]).await;
        }
    });

    let client = Client::connect(config).await.expect("connect");
    client.close();
    client.close();

    let err = client
        .execute(vec![Arg::from("ping")])
        .await
        .expect_err("submit after close");
    assert!(matches!(err, ClientError::ConnectionClosed));
}

#[tokio::test]
async fn close_stops_redialing() {
    let (listener, config) = bind().await;
    tokio::spawn(async move {
        // Serve one connection, fail its first command, then refuse
        // everything by dropping the listener.
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut decoder = Decoder::new();
        let _ = read_frame(&mut stream, &mut decoder).await;
        drop(stream);
    });

    let client = Client::connect(config).await.expect("connect");
    let err = client
        .execute(vec![Arg::from("ping")])
        .await
        .expect_err("server hung up");
    assert!(matches!(
        err,
        ClientError::ConnectionClosed | ClientError::Io(_)
    ));

    // The dispatcher is now redialing; close must stop it promptly
    // rather than after the full backoff.
    let started = tokio::time::Instant::now();
    client.close();
    let err = client
        .execute(vec![Arg::from("ping")])
        .await
        .expect_err("closed");
    assert!(matches!(err, ClientError::ConnectionClosed));
    assert!(started.elapsed() < Duration::from_secs(2));
}
