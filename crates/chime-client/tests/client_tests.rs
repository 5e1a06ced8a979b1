//! Client correlation tests against a scripted peer.

use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;

use chime_client::{CallError, Client};
use chime_core::codec::Value;
use chime_core::config::ClientConfig;

async fn read_doc(reader: &mut BufReader<OwnedReadHalf>) -> Option<serde_json::Value> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await.unwrap();
    if n == 0 {
        return None;
    }
    Some(serde_json::from_str(line.trim_end()).unwrap())
}

async fn write_doc(writer: &mut OwnedWriteHalf, doc: &serde_json::Value) {
    let mut frame = serde_json::to_vec(doc).unwrap();
    frame.push(b'\n');
    writer.write_all(&frame).await.unwrap();
}

fn config_with_timeout(ms: u64) -> ClientConfig {
    ClientConfig {
        call_timeout_ms: ms,
    }
}

#[tokio::test]
async fn test_responses_correlate_regardless_of_arrival_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let first = read_doc(&mut reader).await.unwrap();
        let second = read_doc(&mut reader).await.unwrap();

        // Answer in reverse order; each result echoes the method name.
        for request in [&second, &first] {
            let response = json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": request["method"],
            });
            write_doc(&mut write_half, &response).await;
        }
    });

    let client = Client::connect_to("127.0.0.1", addr.port(), ClientConfig::default())
        .await
        .unwrap();

    let first = client.call_async("alpha", vec![]).unwrap();
    let second = client.call_async("beta", vec![]).unwrap();

    assert_eq!(
        first.outcome().await.unwrap(),
        Value::Str("alpha".to_string())
    );
    assert_eq!(
        second.outcome().await.unwrap(),
        Value::Str("beta".to_string())
    );

    server.await.unwrap();
}

#[tokio::test]
async fn test_remote_error_is_surfaced() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let request = read_doc(&mut reader).await.unwrap();
        let response = json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": { "code": -32601, "message": "method 'nope' not found" },
        });
        write_doc(&mut write_half, &response).await;
    });

    let client = Client::connect_to("127.0.0.1", addr.port(), ClientConfig::default())
        .await
        .unwrap();

    let err = client.call("nope", vec![]).await.unwrap_err();
    match err {
        CallError::Rpc { code, message, .. } => {
            assert_eq!(code, -32601);
            assert!(message.contains("nope"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_response_without_result_or_error_is_malformed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let request = read_doc(&mut reader).await.unwrap();
        write_doc(
            &mut write_half,
            &json!({ "jsonrpc": "2.0", "id": request["id"] }),
        )
        .await;
    });

    let client = Client::connect_to("127.0.0.1", addr.port(), ClientConfig::default())
        .await
        .unwrap();

    let err = client.call("whatever", vec![]).await.unwrap_err();
    assert!(matches!(err, CallError::MalformedResponse));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_then_late_response_is_discarded() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // First request: answer far too late.
        let slow = read_doc(&mut reader).await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        write_doc(
            &mut write_half,
            &json!({ "jsonrpc": "2.0", "id": slow["id"], "result": 1 }),
        )
        .await;

        // Second request: answer promptly.
        let fast = read_doc(&mut reader).await.unwrap();
        write_doc(
            &mut write_half,
            &json!({ "jsonrpc": "2.0", "id": fast["id"], "result": 2 }),
        )
        .await;
    });

    let client = Client::connect_to("127.0.0.1", addr.port(), config_with_timeout(100))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let err = client.call("slow", vec![]).await.unwrap_err();
    assert!(matches!(err, CallError::Timeout));
    assert!(started.elapsed() < Duration::from_millis(350));

    // The late response for the first id arrives during this second call and
    // must not be delivered to it.
    let result = client.call("fast", vec![]).await.unwrap();
    assert_eq!(result, Value::Int(2));
}

#[tokio::test]
async fn test_deferred_registration_replays_on_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // The client announces its handler as soon as the connection is up.
        let registration = read_doc(&mut reader).await.unwrap();
        seen_tx.send(registration.clone()).unwrap();
        write_doc(
            &mut write_half,
            &json!({
                "jsonrpc": "2.0",
                "id": registration["id"],
                "result": { "resultCode": true, "resultText": "Signal found and registered." },
            }),
        )
        .await;

        for n in 1..=3 {
            write_doc(
                &mut write_half,
                &json!({ "jsonrpc": "2.0", "method": "tick", "params": [n] }),
            )
            .await;
        }
        // Keep the connection open until the test is done reading.
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    // Register before connecting: the announcement must be deferred.
    let client = Client::new(ClientConfig::default());
    let (tick_tx, mut tick_rx) = tokio::sync::mpsc::unbounded_channel();
    client.on_notification("tick", &[("n", chime_core::codec::TypeTag::Int)], move |args| {
        tick_tx.send(args.to_vec()).unwrap();
    });

    client.connect("127.0.0.1", addr.port()).await.unwrap();

    let registration = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(registration["method"], "registerSignalHandler");
    assert_eq!(registration["params"], json!(["tick(int)"]));

    for n in 1..=3 {
        let args = tokio::time::timeout(Duration::from_secs(1), tick_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(args, vec![Value::Int(n)]);
    }
}

#[tokio::test]
async fn test_object_form_notification_decodes_by_declared_name() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let registration = read_doc(&mut reader).await.unwrap();
        write_doc(
            &mut write_half,
            &json!({
                "jsonrpc": "2.0",
                "id": registration["id"],
                "result": { "resultCode": true, "resultText": "Signal found and registered." },
            }),
        )
        .await;

        // Object form: one member per parameter, keyed by name, in any order.
        write_doc(
            &mut write_half,
            &json!({
                "jsonrpc": "2.0",
                "method": "priceChanged",
                "params": { "symbol": "XAU", "price": 2.5 },
            }),
        )
        .await;
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let client = Client::connect_to("127.0.0.1", addr.port(), ClientConfig::default())
        .await
        .unwrap();

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    client.on_notification(
        "priceChanged",
        &[
            ("price", chime_core::codec::TypeTag::Float),
            ("symbol", chime_core::codec::TypeTag::Str),
        ],
        move |args| {
            seen_tx.send(args.to_vec()).unwrap();
        },
    );

    // Arguments arrive in declared order, not object order.
    let args = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        args,
        vec![Value::Float(2.5), Value::Str("XAU".to_string())]
    );
}

#[tokio::test]
async fn test_disconnect_fails_in_flight_calls() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, _write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // Read the request, then hang up without answering.
        let _request = read_doc(&mut reader).await.unwrap();
    });

    let client = Client::connect_to("127.0.0.1", addr.port(), ClientConfig::default())
        .await
        .unwrap();

    let handle = client.call_async("doomed", vec![]).unwrap();
    let err = handle.outcome().await.unwrap_err();
    assert!(matches!(err, CallError::Transport(_)));
}
