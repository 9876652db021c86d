//! End-to-end engine tests against an in-process mock server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;

use slirc_client::{Client, ClientConfig, ConnState, ServerSpec};

fn test_config() -> ClientConfig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    ClientConfig {
        reconnect: None,
        keepalive: None,
        ..ClientConfig::default()
    }
}

/// Accept one client and consume its registration handshake.
async fn accept_handshake(
    listener: &TcpListener,
) -> (tokio::io::Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf) {
    let (socket, _) = listener.accept().await.unwrap();
    let (read, write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();
    loop {
        let line = lines.next_line().await.unwrap().expect("client hung up");
        if line.starts_with("USER") {
            break;
        }
    }
    (lines, write)
}

/// Drive the engine until `flag` is set or the budget runs out.
async fn pump_until(client: &Client, flag: &AtomicBool) {
    for _ in 0..200 {
        client
            .process_once(Some(Duration::from_millis(20)))
            .await
            .unwrap();
        if flag.load(Ordering::Acquire) {
            return;
        }
    }
    panic!("condition not reached before budget");
}

#[tokio::test]
async fn registers_and_loads_fragmented_feature_burst() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = Client::new(test_config());
    let registered = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&registered);
    client.add_global_handler("registered", 0, move |_, _| {
        seen.store(true, Ordering::Release);
        Ok(())
    });

    let server = tokio::spawn(async move {
        let (_lines, mut write) = accept_handshake(&listener).await;
        write
            .write_all(b":irc.test 001 tester :Welcome to TestNet\r\n")
            .await
            .unwrap();
        // Feature burst split at an arbitrary byte boundary.
        write
            .write_all(b":irc.test 005 tester PREFIX=(ov)@+ NETWORK=Te")
            .await
            .unwrap();
        write.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        write
            .write_all(b"stNet :are supported by this server\r\n")
            .await
            .unwrap();
        write
            .write_all(b":irc.test 375 tester :- message of the day\r\n")
            .await
            .unwrap();
        write
    });

    let conn = client
        .connect(ServerSpec::new("127.0.0.1", port, "tester"))
        .await
        .unwrap();
    pump_until(&client, &registered).await;

    assert_eq!(conn.state(), ConnState::Active);
    assert_eq!(
        conn.features().get("NETWORK").and_then(|v| v.as_text()),
        Some("TestNet")
    );
    assert_eq!(conn.features().prefix().symbol_for_mode('o'), Some('@'));
    drop(server.await.unwrap());
}

#[tokio::test]
async fn pings_are_answered_without_dispatch() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = Client::new(test_config());
    let server = tokio::spawn(async move {
        let (mut lines, mut write) = accept_handshake(&listener).await;
        write
            .write_all(b"PING :token-1234\r\n")
            .await
            .unwrap();
        // The reader task answers directly; no process_once involved.
        lines.next_line().await.unwrap().expect("no pong")
    });

    client
        .connect(ServerSpec::new("127.0.0.1", port, "tester"))
        .await
        .unwrap();

    let pong = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert!(pong.starts_with("PONG"), "got {pong:?}");
    assert!(pong.contains("token-1234"));
}

#[tokio::test]
async fn handlers_run_in_priority_order_and_track_names() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = Client::new(test_config());
    let order = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));
    for (label, priority) in [("second", 10), ("first", -10)] {
        let order = Arc::clone(&order);
        client.add_global_handler("pubmsg", priority, move |_, _| {
            order.lock().push(label);
            Ok(())
        });
    }
    let flag = Arc::clone(&done);
    client.add_global_handler("pubmsg", 100, move |_, _| {
        flag.store(true, Ordering::Release);
        Ok(())
    });

    let server = tokio::spawn(async move {
        let (_lines, mut write) = accept_handshake(&listener).await;
        write
            .write_all(
                b":irc.test 001 tester :Welcome\r\n\
                  :irc.test 005 tester PREFIX=(ov)@+ :are supported by this server\r\n\
                  :tester!t@h JOIN #room\r\n\
                  :irc.test 353 tester = #room :@alice tester\r\n\
                  :alice!a@h PRIVMSG #room :hello\r\n",
            )
            .await
            .unwrap();
        write
    });

    let conn = client
        .connect(ServerSpec::new("127.0.0.1", port, "tester"))
        .await
        .unwrap();
    pump_until(&client, &done).await;

    assert_eq!(*order.lock(), vec!["first", "second"]);
    let room = conn.channel("#room").expect("joined channel tracked");
    assert!(room.has_user("alice"));
    assert!(room.has_user("tester"));
    drop(server.await.unwrap());
}

#[tokio::test]
async fn server_close_produces_disconnect_event() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = Client::new(test_config());
    let disconnected = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&disconnected);
    client.add_global_handler("disconnect", 0, move |_, _| {
        flag.store(true, Ordering::Release);
        Ok(())
    });

    tokio::spawn(async move {
        let (_lines, write) = accept_handshake(&listener).await;
        drop(write);
    });

    let conn = client
        .connect(ServerSpec::new("127.0.0.1", port, "tester"))
        .await
        .unwrap();
    pump_until(&client, &disconnected).await;
    assert_eq!(conn.state(), ConnState::Disconnected);
    assert!(matches!(
        conn.privmsg("#room", "hi"),
        Err(slirc_client::ClientError::NotConnected)
    ));
}
