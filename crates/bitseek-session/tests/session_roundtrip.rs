use bitseek_session::{
    CancellationToken, ConnectionState, IdleSupervisor, Session, SessionConfig, SessionError,
    StreamSink,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

type ServerWs = WebSocketStream<TcpStream>;

struct TestServer {
    url: String,
    conns: mpsc::UnboundedReceiver<ServerWs>,
}

impl TestServer {
    async fn start(max_connections: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (tx, conns) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            for _ in 0..max_connections {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let ws = accept_async(stream).await.expect("ws handshake");
                if tx.send(ws).is_err() {
                    return;
                }
            }
        });
        Self {
            url: format!("ws://{addr}/api/v2/generate"),
            conns,
        }
    }

    async fn next_conn(&mut self) -> ServerWs {
        tokio::time::timeout(Duration::from_secs(5), self.conns.recv())
            .await
            .expect("connection in time")
            .expect("server running")
    }

    fn config(&self) -> SessionConfig {
        SessionConfig {
            message_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_millis(50),
            ..SessionConfig::with_url(self.url.clone())
        }
    }
}

async fn next_json(ws: &mut ServerWs, kind: &str) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("valid frame");
        if let Message::Text(text) = message {
            let value: Value = serde_json::from_str(&text).expect("json frame");
            if value["type"] == kind {
                return value;
            }
        }
    }
}

async fn send_json(ws: &mut ServerWs, value: Value) {
    ws.send(Message::Text(value.to_string())).await.expect("server send");
}

async fn wait_for_state(session: &Session, expected: ConnectionState) {
    let mut rx = session.subscribe_state();
    tokio::time::timeout(Duration::from_secs(5), async {
        while *rx.borrow_and_update() != expected {
            rx.changed().await.expect("state channel open");
        }
    })
    .await
    .expect("state reached in time");
}

fn recording_sink() -> (Arc<Mutex<Vec<String>>>, Box<dyn StreamSink>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let captured = seen.clone();
    let sink: Box<dyn StreamSink> =
        Box::new(move |chunk: &str| captured.lock().expect("sink lock").push(chunk.to_string()));
    (seen, sink)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streams_cleaned_chunks_in_order() {
    let mut server = TestServer::start(1).await;
    let session = Session::new(server.config());
    let script = tokio::spawn(async move {
        let mut ws = server.next_conn().await;
        let init = next_json(&mut ws, "open_inference_session").await;
        assert_eq!(init["max_length"], 1024);
        let generate = next_json(&mut ws, "generate").await;
        assert_eq!(generate["inputs"], "hi there");
        assert_eq!(generate["extra_stop_sequences"], json!(["</s>"]));
        send_json(&mut ws, json!({"outputs": "<think>plan</think>Hel"})).await;
        send_json(&mut ws, json!({"outputs": "lo"})).await;
        send_json(&mut ws, json!({"outputs": " world</s>"})).await;
        ws
    });

    let (seen, sink) = recording_sink();
    let reply = session.send("hi there", Some(sink)).await.expect("reply");
    assert_eq!(reply, "Hello world");
    assert_eq!(*seen.lock().expect("sink lock"), vec!["Hel", "lo", " world"]);
    assert!(!session.has_pending_exchange());
    let _ws = script.await.expect("server script");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_reply_of_timed_out_exchange_is_discarded() {
    let mut server = TestServer::start(2).await;
    let mut config = server.config();
    config.message_timeout = Duration::from_millis(200);
    let session = Session::new(config);
    let script = tokio::spawn(async move {
        let mut ws = server.next_conn().await;
        next_json(&mut ws, "open_inference_session").await;
        next_json(&mut ws, "generate").await;
        let second = next_json(&mut ws, "generate").await;
        assert_eq!(second["inputs"], "again");
        send_json(&mut ws, json!({"outputs": "STALE-FIRST"})).await;
        send_json(&mut ws, json!({"outputs": "</s>"})).await;
        send_json(&mut ws, json!({"outputs": "fresh", "stop": true})).await;
        (ws, server)
    });

    let first = session.send("slow", None).await;
    assert!(matches!(first, Err(SessionError::Timeout(_))), "got {first:?}");
    assert!(!session.has_pending_exchange());
    assert_eq!(session.state(), ConnectionState::Connected);

    let (seen, sink) = recording_sink();
    let second = session.send("again", Some(sink)).await.expect("second reply");
    assert_eq!(second, "fresh");
    assert_eq!(*seen.lock().expect("sink lock"), vec!["fresh"]);
    let (_ws, mut server) = script.await.expect("server script");
    assert!(server.conns.try_recv().is_err(), "no second connection");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn link_is_replaced_when_abandoned_streams_pile_up() {
    let mut server = TestServer::start(2).await;
    let mut config = server.config();
    config.message_timeout = Duration::from_millis(150);
    let session = Session::new(config);
    let script = tokio::spawn(async move {
        let mut ws = server.next_conn().await;
        next_json(&mut ws, "generate").await;
        next_json(&mut ws, "generate").await;
        let mut ws = server.next_conn().await;
        next_json(&mut ws, "open_inference_session").await;
        let generate = next_json(&mut ws, "generate").await;
        assert_eq!(generate["inputs"], "third");
        send_json(&mut ws, json!({"outputs": "fresh", "stop": true})).await;
        ws
    });

    for input in ["first", "second"] {
        let result = session.send(input, None).await;
        assert!(matches!(result, Err(SessionError::Timeout(_))), "got {result:?}");
    }
    assert_eq!(session.state(), ConnectionState::Disconnected);
    let reply = session.send("third", None).await.expect("reply on new link");
    assert_eq!(reply, "fresh");
    let _ws = script.await.expect("server script");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shortened_message_timeout_applies_to_live_session() {
    let mut server = TestServer::start(1).await;
    let session = Session::new(server.config());
    session.ensure_connected().await.expect("connect");
    let mut ws = server.next_conn().await;

    session.set_message_timeout(Duration::from_millis(150));
    assert_eq!(session.status().message_timeout_ms, 150);
    let started = tokio::time::Instant::now();
    let result = session.send("unanswered", None).await;
    assert_eq!(result, Err(SessionError::Timeout(Duration::from_millis(150))));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(next_json(&mut ws, "generate").await["inputs"], "unanswered");
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_connects_share_one_socket() {
    let mut server = TestServer::start(3).await;
    let session = Session::new(server.config());

    let attempts = (0..4).map(|_| {
        let session = session.clone();
        async move { session.ensure_connected().await }
    });
    let results = futures_util::future::join_all(attempts).await;
    assert!(results.iter().all(Result::is_ok), "got {results:?}");

    let mut ws = server.next_conn().await;
    next_json(&mut ws, "open_inference_session").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.conns.try_recv().is_err(), "exactly one connection");
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_send_is_rejected() {
    let mut server = TestServer::start(1).await;
    let session = Session::new(server.config());
    let script = tokio::spawn(async move {
        let mut ws = server.next_conn().await;
        next_json(&mut ws, "open_inference_session").await;
        next_json(&mut ws, "generate").await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        send_json(&mut ws, json!({"outputs": "first", "stop": true})).await;
        ws
    });

    let background = session.clone();
    let first = tokio::spawn(async move { background.send("one", None).await });
    tokio::time::timeout(Duration::from_secs(5), async {
        while !session.has_pending_exchange() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("first exchange registered");

    let second = session.send("two", None).await;
    assert_eq!(second, Err(SessionError::Concurrency));
    let first = first.await.expect("first task").expect("first reply");
    assert_eq!(first, "first");
    let _ws = script.await.expect("server script");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_send_aborts_and_clears_exchange() {
    let mut server = TestServer::start(1).await;
    let session = Session::new(server.config());
    let script = tokio::spawn(async move {
        let mut ws = server.next_conn().await;
        next_json(&mut ws, "generate").await;
        let retry = next_json(&mut ws, "generate").await;
        assert_eq!(retry["inputs"], "after cancel");
        send_json(&mut ws, json!({"outputs": "too late", "stop": true})).await;
        send_json(&mut ws, json!({"outputs": "ok", "stop": true})).await;
        ws
    });

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });
    let result = session.send_cancellable("never answered", None, &cancel).await;
    assert_eq!(result, Err(SessionError::Aborted));
    assert!(!session.has_pending_exchange());
    assert_eq!(session.state(), ConnectionState::Connected);

    let reply = session.send("after cancel", None).await.expect("reply");
    assert_eq!(reply, "ok");
    let _ws = script.await.expect("server script");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_error_frame_fails_exchange() {
    let mut server = TestServer::start(1).await;
    let session = Session::new(server.config());
    let script = tokio::spawn(async move {
        let mut ws = server.next_conn().await;
        next_json(&mut ws, "generate").await;
        send_json(&mut ws, json!({"error": "model overloaded"})).await;
        ws
    });

    let result = session.send("hello", None).await;
    assert_eq!(result, Err(SessionError::Server("model overloaded".to_string())));
    let _ws = script.await.expect("server script");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_connection_fails_pending_and_reconnects() {
    let mut server = TestServer::start(2).await;
    let session = Session::new(server.config());
    let script = tokio::spawn(async move {
        let mut ws = server.next_conn().await;
        next_json(&mut ws, "generate").await;
        drop(ws);
        let mut ws = server.next_conn().await;
        next_json(&mut ws, "open_inference_session").await;
        let generate = next_json(&mut ws, "generate").await;
        assert_eq!(generate["inputs"], "retry");
        send_json(&mut ws, json!({"outputs": "back", "stop": true})).await;
        ws
    });

    let first = session.send("lost", None).await;
    assert!(matches!(first, Err(SessionError::Connectivity(_))), "got {first:?}");
    wait_for_state(&session, ConnectionState::Connected).await;
    let reply = session.send("retry", None).await.expect("reply after reconnect");
    assert_eq!(reply, "back");
    assert_eq!(session.status().reconnect_attempts, 0);
    let _ws = script.await.expect("server script");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_stops_at_bound_when_server_is_gone() {
    let mut server = TestServer::start(1).await;
    let mut config = server.config();
    config.max_reconnect_attempts = 2;
    config.reconnect_interval = Duration::from_millis(20);
    config.connect_timeout = Duration::from_secs(1);
    let session = Session::new(config);
    session.ensure_connected().await.expect("initial connect");

    let mut ws = server.next_conn().await;
    next_json(&mut ws, "open_inference_session").await;
    ws.close(Some(CloseFrame {
        code: CloseCode::Error,
        reason: "internal".into(),
    }))
    .await
    .expect("server close");

    wait_for_state(&session, ConnectionState::Failed).await;
    assert_eq!(session.status().reconnect_attempts, 2);
    let result = session.send("anyone?", None).await;
    assert_eq!(result, Err(SessionError::ReconnectExhausted { attempts: 2 }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn normal_close_from_server_does_not_reconnect() {
    let mut server = TestServer::start(2).await;
    let session = Session::new(server.config());
    session.ensure_connected().await.expect("connect");

    let mut ws = server.next_conn().await;
    next_json(&mut ws, "open_inference_session").await;
    ws.close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "bye".into(),
    }))
    .await
    .expect("server close");

    wait_for_state(&session, ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(server.conns.try_recv().is_err(), "no reconnect after normal close");
    assert_eq!(session.status().reconnect_attempts, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_frame_without_status_does_not_reconnect() {
    let mut server = TestServer::start(2).await;
    let session = Session::new(server.config());
    session.ensure_connected().await.expect("connect");

    let mut ws = server.next_conn().await;
    next_json(&mut ws, "open_inference_session").await;
    ws.close(None).await.expect("server close");

    wait_for_state(&session, ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(server.conns.try_recv().is_err(), "no reconnect after bare close");
    assert_eq!(session.status().reconnect_attempts, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heartbeat_pings_flow_while_connected() {
    let mut server = TestServer::start(1).await;
    let mut config = server.config();
    config.heartbeat_interval = Duration::from_millis(50);
    let session = Session::new(config);
    session.ensure_connected().await.expect("connect");

    let mut ws = server.next_conn().await;
    next_json(&mut ws, "ping").await;
    send_json(&mut ws, json!({"type": "pong"})).await;
    next_json(&mut ws, "ping").await;

    session.set_heartbeat_interval(Duration::from_millis(80)).await;
    next_json(&mut ws, "ping").await;
    assert_eq!(session.status().heartbeat_interval_ms, 80);
    assert_eq!(session.state(), ConnectionState::Connected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn explicit_close_sends_normal_close_frame() {
    let mut server = TestServer::start(1).await;
    let session = Session::new(server.config());
    session.ensure_connected().await.expect("connect");
    let mut ws = server.next_conn().await;
    next_json(&mut ws, "open_inference_session").await;

    session.close().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);

    let close = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    })
    .await
    .expect("close in time");
    assert_eq!(close.map(|frame| frame.code), Some(CloseCode::Normal));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_supervisor_disconnects_and_reacquires() {
    let mut server = TestServer::start(2).await;
    let session = Session::new(server.config());
    let idle = IdleSupervisor::new(session.clone(), Duration::from_millis(150));

    idle.acquire().await.expect("acquire");
    let first_activity = idle.last_activity();
    let _first = server.next_conn().await;
    wait_for_state(&session, ConnectionState::Disconnected).await;

    tokio::time::sleep(Duration::from_millis(10)).await;
    idle.acquire().await.expect("reacquire");
    let _second = server.next_conn().await;
    assert_eq!(session.state(), ConnectionState::Connected);
    assert!(idle.last_activity() > first_activity);
    idle.shutdown().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
}
