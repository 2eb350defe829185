#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kblocks_core::Event;
use kblocks_fanout::{ChannelSink, FanOut};
use kblocks_store::{Session, SessionOptions};
use kblocks_stream::{shutdown_flag, Consumer, MemoryStream, ReadSpec};
use serde_json::json;

const Q1: &str = "kblocks://acme.com/v1/queues/dev/default/q1";
const B1: &str = "kblocks://acme.com/v1/buckets/dev/default/b1";

fn object(uri: &str, ts: &str, reason: &str, rev: u32) -> String {
    json!({
        "type": "OBJECT", "objUri": uri, "objType": "acme.com/v1/queues", "timestamp": ts,
        "requestId": "r", "reason": reason, "object": { "spec": { "rev": rev } }
    })
    .to_string()
}

fn log(uri: &str, id: &str, parent: Option<&str>) -> String {
    let mut v = json!({
        "type": "LOG", "objUri": uri, "objType": "acme.com/v1/queues", "timestamp": "2024-05-01T10:00:00Z",
        "requestId": "r", "level": 1, "message": format!("log {}", id), "logId": id
    });
    if let Some(p) = parent {
        v["parentLogId"] = json!(p);
    }
    v.to_string()
}

async fn run_stream(seq: &[String]) -> (Arc<Session>, Vec<Event>) {
    let stream = MemoryStream::new();
    for payload in seq {
        stream.append(payload.clone());
    }
    stream.close();

    let fanout = FanOut::new();
    let (session, _handle) = Session::new(SessionOptions::default());
    fanout.register("session", session.clone());
    let (tap, mut rx) = ChannelSink::new(128);
    fanout.register("tap", Arc::new(tap));

    let (_tx, shutdown) = shutdown_flag();
    Consumer::new(stream, ReadSpec::new("dashboard", "c1").with_block_ms(20)).run(&fanout, shutdown).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        seen.push(ev);
    }
    (session, seen)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn events_flow_from_log_to_session_in_order() {
    let seq = vec![
        object(Q1, "2024-05-01T10:00:01Z", "CREATE", 1),
        log(Q1, "1", None),
        "{\"type\": \"OBJECT\", broken".to_string(),
        log(Q1, "2", Some("1")),
        object(Q1, "2024-05-01T10:00:00Z", "UPDATE", 0),
        object(B1, "2024-05-01T10:00:02Z", "CREATE", 1),
        log(Q1, "3", None),
        object(B1, "2024-05-01T10:00:03Z", "DELETE", 1),
    ];
    let (session, seen) = run_stream(&seq).await;

    let order: Vec<(&str, &str)> = seen.iter().map(|e| (e.kind().as_str(), e.obj_uri())).collect();
    assert_eq!(
        order,
        vec![
            ("OBJECT", Q1),
            ("LOG", Q1),
            ("LOG", Q1),
            ("OBJECT", Q1),
            ("OBJECT", B1),
            ("LOG", Q1),
            ("OBJECT", B1),
        ]
    );

    let forest = session.log_forest(Q1);
    assert_eq!(forest.len(), 2);
    assert_eq!(forest[0].event.log_id.as_deref(), Some("1"));
    assert_eq!(forest[0].children.len(), 1);
    assert_eq!(forest[1].event.log_id.as_deref(), Some("3"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshot_reflects_reconciled_state_and_epoch_advances() {
    let stream = MemoryStream::new();
    let fanout = Arc::new(FanOut::new());
    let (session, handle) = Session::new(SessionOptions::default());
    fanout.register("session", session.clone());
    let mut epochs = handle.subscribe_epoch();

    let (tx, shutdown) = shutdown_flag();
    let consumer = Consumer::new(stream.clone(), ReadSpec::new("dashboard", "c1").with_block_ms(20));
    let task = tokio::spawn({
        let fanout = Arc::clone(&fanout);
        async move { consumer.run(fanout.as_ref(), shutdown).await }
    });

    stream.append(object(Q1, "2024-05-01T10:00:01Z", "CREATE", 1));
    tokio::time::timeout(Duration::from_secs(2), epochs.changed()).await.unwrap().unwrap();
    stream.append(object(Q1, "2024-05-01T10:00:00Z", "UPDATE", 0));
    stream.append(object(Q1, "2024-05-01T10:00:05Z", "UPDATE", 5));
    for _ in 0..100 {
        if handle.current().epoch >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tx.send(true).unwrap();
    task.await.unwrap().unwrap();

    let snap = handle.current();
    assert_eq!(snap.epoch, 2);
    assert_eq!(snap.get(Q1).unwrap().object.as_ref().unwrap()["spec"]["rev"], 5);
}
