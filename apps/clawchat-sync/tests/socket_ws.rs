use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;

use clawchat_sync::socket::{ReconnectPolicy, SocketEvent, SocketEventKind, SocketManager};
use clawchat_sync::status::ConnectionStatus;

#[derive(Default)]
struct Hub {
    connections: AtomicUsize,
    tokens: Mutex<Vec<String>>,
}

async fn upgrade(
    State(hub): State<Arc<Hub>>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    hub.tokens
        .lock()
        .push(params.get("token").cloned().unwrap_or_default());
    let nth = hub.connections.fetch_add(1, Ordering::SeqCst) + 1;
    ws.on_upgrade(move |socket| session(socket, nth))
}

async fn session(mut socket: WebSocket, nth: usize) {
    let frames = [
        "not json".to_string(),
        r#"{"type":"mystery","data":{}}"#.to_string(),
        format!(r#"{{"type":"reminder","data":{{"title":"Standup","message":"connection {nth}"}}}}"#),
    ];
    for frame in frames {
        if socket.send(Message::Text(frame)).await.is_err() {
            return;
        }
    }
    if nth == 1 {
        // Drop the first connection to force a reconnect.
        let _ = socket.send(Message::Close(None)).await;
        return;
    }
    while let Some(Ok(_)) = socket.recv().await {}
}

async fn spawn_hub() -> (SocketAddr, Arc<Hub>) {
    let hub = Arc::new(Hub::default());
    let router = Router::new().route("/ws", get(upgrade)).with_state(hub.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ws server");
    let addr = listener.local_addr().expect("server addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    (addr, hub)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

#[test_timeout::tokio_timeout_test(secs = 20)]
async fn receives_events_and_reconnects_after_close() {
    let (addr, hub) = spawn_hub().await;
    let socket = SocketManager::websocket(ReconnectPolicy {
        floor: Duration::from_millis(50),
        ceiling: Duration::from_millis(400),
    });

    let reminders = Arc::new(Mutex::new(Vec::new()));
    let sink = reminders.clone();
    let _id = socket.on(SocketEventKind::Reminder, move |event| {
        if let SocketEvent::Reminder(reminder) = event {
            sink.lock().push(reminder.text());
        }
    });
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let seen = statuses.clone();
    let _subscription = socket.on_status_change(move |status| seen.lock().push(status));

    socket
        .connect(&format!("http://{addr}"), "tok en")
        .expect("valid socket url");

    let observed = reminders.clone();
    eventually(move || observed.lock().len() == 2).await;
    assert_eq!(
        *reminders.lock(),
        vec!["connection 1".to_string(), "connection 2".to_string()]
    );
    assert_eq!(hub.connections.load(Ordering::SeqCst), 2);
    assert_eq!(*hub.tokens.lock(), vec!["tok en".to_string(), "tok en".to_string()]);

    let observed = statuses.clone();
    eventually(move || observed.lock().last() == Some(&ConnectionStatus::Connected)).await;
    let history = statuses.lock().clone();
    assert_eq!(history.first(), Some(&ConnectionStatus::Connecting));
    assert!(history.contains(&ConnectionStatus::Reconnecting));
    assert_eq!(socket.reconnect_delay(), Duration::from_millis(50));

    socket.disconnect();
    assert_eq!(socket.status(), ConnectionStatus::Disconnected);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(hub.connections.load(Ordering::SeqCst), 2);
}

#[test_timeout::tokio_timeout_test(secs = 20)]
async fn unreachable_server_keeps_backing_off() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let socket = SocketManager::websocket(ReconnectPolicy {
        floor: Duration::from_millis(20),
        ceiling: Duration::from_millis(80),
    });
    socket.connect(&format!("ws://{addr}"), "tok").expect("valid url");

    eventually(|| socket.reconnect_delay() == Duration::from_millis(80)).await;
    assert_eq!(socket.status(), ConnectionStatus::Reconnecting);
    socket.disconnect();
    assert_eq!(socket.status(), ConnectionStatus::Disconnected);
}
