//! Transport integration tests against real loopback sockets.

use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use trainstream_rpc::protocol::{decode_i32, decode_i64, encode_i32};
use trainstream_rpc::{
    BackendAnnouncement, BackendDirectory, BackendRpcService, HeartbeatType, MessageType,
    RetrainRequest,
};

#[derive(Default)]
struct MemoryDirectory {
    backends: Mutex<Vec<BackendAnnouncement>>,
    applications: Mutex<HashSet<String>>,
    links: Mutex<Vec<(String, String)>>,
}

impl MemoryDirectory {
    fn with_application(app: &str) -> Self {
        let dir = Self::default();
        dir.applications.lock().unwrap().insert(app.to_string());
        dir
    }

    fn registered_backend_names(&self) -> Vec<String> {
        self.backends
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.backend_name.clone())
            .collect()
    }
}

impl BackendDirectory for MemoryDirectory {
    fn register_backend(&self, announcement: &BackendAnnouncement) -> anyhow::Result<()> {
        self.backends.lock().unwrap().push(announcement.clone());
        Ok(())
    }

    fn application_exists(&self, app_name: &str) -> anyhow::Result<bool> {
        Ok(self.applications.lock().unwrap().contains(app_name))
    }

    fn link_application(&self, app_name: &str, backend_name: &str) -> anyhow::Result<()> {
        self.links
            .lock()
            .unwrap()
            .push((app_name.to_string(), backend_name.to_string()));
        Ok(())
    }
}

fn noop_callback() -> trainstream_rpc::service::ResponseCallback {
    Box::new(|_| {})
}

fn connect_backend(port: u16) -> zmq::Socket {
    let ctx = zmq::Context::new();
    let socket = ctx.socket(zmq::DEALER).unwrap();
    socket.set_rcvtimeo(3_000).unwrap();
    socket.set_linger(0).unwrap();
    socket.connect(&format!("tcp://127.0.0.1:{port}")).unwrap();
    socket
}

fn send_metadata(socket: &zmq::Socket, backend: &str, app: &str, params: &str) {
    socket
        .send_multipart(
            vec![
                Vec::new(),
                encode_i32(MessageType::BackendMetadata as i32),
                backend.as_bytes().to_vec(),
                b"1.0".to_vec(),
                app.as_bytes().to_vec(),
                b"NaiveBestEffortPolicy".to_vec(),
                params.as_bytes().to_vec(),
            ],
            0,
        )
        .unwrap();
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn send_to_unknown_connection_is_dropped() {
    let service = BackendRpcService::new();
    let directory = Arc::new(MemoryDirectory::default());
    let (started_tx, started_rx) = mpsc::channel();
    let (ended_tx, ended_rx) = mpsc::channel();
    service
        .start(
            "127.0.0.1",
            24701,
            Box::new(move |resp| started_tx.send(resp).unwrap()),
            Box::new(move |resp| ended_tx.send(resp).unwrap()),
            directory,
        )
        .unwrap();

    let frames = RetrainRequest::new(1, 10, 3, vec![]).to_frames();
    let msg_id = service.send_message(frames, 99);
    assert_eq!(msg_id, 0);

    // The request is dropped with a logged error; no notification ever fires.
    assert!(started_rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(ended_rx.recv_timeout(Duration::from_millis(200)).is_err());
    service.stop();
}

#[test]
fn message_ids_are_strictly_monotonic() {
    let service = BackendRpcService::new();
    service
        .start(
            "127.0.0.1",
            24702,
            noop_callback(),
            noop_callback(),
            Arc::new(MemoryDirectory::default()),
        )
        .unwrap();

    let ids: Vec<i32> = (0..16)
        .map(|_| service.send_message(vec![vec![0u8]], 7))
        .collect();
    for pair in ids.windows(2) {
        assert!(pair[1] > pair[0], "ids must strictly increase: {ids:?}");
    }
    assert_eq!(ids[0], 0, "ids start at zero");
    service.stop();
}

#[test]
fn send_on_inactive_service_returns_minus_one() {
    let service = BackendRpcService::new();
    assert_eq!(service.send_message(vec![], 0), -1);
}

#[test]
fn double_start_fails() {
    let service = BackendRpcService::new();
    service
        .start(
            "127.0.0.1",
            24703,
            noop_callback(),
            noop_callback(),
            Arc::new(MemoryDirectory::default()),
        )
        .unwrap();
    let again = service.start(
        "127.0.0.1",
        24704,
        noop_callback(),
        noop_callback(),
        Arc::new(MemoryDirectory::default()),
    );
    assert!(again.is_err());
    service.stop();
}

#[test]
fn heartbeat_from_unknown_identity_requests_metadata() {
    let service = BackendRpcService::new();
    service
        .start(
            "127.0.0.1",
            24705,
            noop_callback(),
            noop_callback(),
            Arc::new(MemoryDirectory::default()),
        )
        .unwrap();

    let backend = connect_backend(24705);
    backend
        .send_multipart(
            vec![
                Vec::new(),
                encode_i32(MessageType::BackendHeartbeat as i32),
                encode_i32(HeartbeatType::KeepAlive as i32),
            ],
            0,
        )
        .unwrap();

    let reply = backend.recv_multipart(0).unwrap();
    assert_eq!(reply.len(), 3);
    assert!(reply[0].is_empty());
    assert_eq!(
        decode_i32(&reply[1]).unwrap(),
        MessageType::BackendHeartbeat as i32
    );
    assert_eq!(
        decode_i32(&reply[2]).unwrap(),
        HeartbeatType::RequestContainerMetadata as i32
    );
    service.stop();
}

#[test]
fn metadata_then_retrain_round_trip() {
    let service = BackendRpcService::new();
    let directory = Arc::new(MemoryDirectory::with_application("digits"));
    let (started_tx, started_rx) = mpsc::channel();
    let (ended_tx, ended_rx) = mpsc::channel();
    service
        .start(
            "127.0.0.1",
            24706,
            Box::new(move |resp| started_tx.send(resp).unwrap()),
            Box::new(move |resp| ended_tx.send(resp).unwrap()),
            Arc::clone(&directory) as Arc<dyn BackendDirectory>,
        )
        .unwrap();

    let backend = connect_backend(24706);
    send_metadata(&backend, "sgd-backend", "digits", r#"{"alpha": 0.5}"#);

    assert!(wait_until(Duration::from_secs(3), || {
        !directory.registered_backend_names().is_empty()
    }));
    {
        let backends = directory.backends.lock().unwrap();
        assert_eq!(backends[0].connection_id, 0);
        assert_eq!(backends[0].alpha, 0.5);
        assert_eq!(backends[0].beta, 1.0);
        assert_eq!(backends[0].weight, 10.0);
    }
    assert!(wait_until(Duration::from_secs(3), || {
        !directory.links.lock().unwrap().is_empty()
    }));
    assert_eq!(
        directory.links.lock().unwrap()[0],
        ("digits".to_string(), "sgd-backend".to_string())
    );

    // A known identity now gets a KeepAlive heartbeat.
    backend
        .send_multipart(
            vec![
                Vec::new(),
                encode_i32(MessageType::BackendHeartbeat as i32),
                encode_i32(HeartbeatType::KeepAlive as i32),
            ],
            0,
        )
        .unwrap();
    let reply = backend.recv_multipart(0).unwrap();
    assert_eq!(
        decode_i32(&reply[2]).unwrap(),
        HeartbeatType::KeepAlive as i32
    );

    // Core → backend retrain request arrives framed as
    // [empty][type][msg_id][payload…].
    let request = RetrainRequest::new(1, 1_000_000, 5, vec!["1000000123".into()]);
    let msg_id = service.send_message(request.to_frames(), 0);
    assert_eq!(msg_id, 0);

    let inbound = backend.recv_multipart(0).unwrap();
    assert!(inbound[0].is_empty());
    assert_eq!(
        decode_i32(&inbound[1]).unwrap(),
        MessageType::StartRetraining as i32
    );
    assert_eq!(decode_i32(&inbound[2]).unwrap(), msg_id);
    assert_eq!(decode_i64(&inbound[3]).unwrap(), 1);
    assert_eq!(decode_i64(&inbound[4]).unwrap(), 1_000_000);
    assert_eq!(decode_i64(&inbound[5]).unwrap(), 5);

    // Backend acknowledges start, then completion.
    for ty in [MessageType::RetrainingStarted, MessageType::RetrainingEnded] {
        backend
            .send_multipart(
                vec![
                    Vec::new(),
                    encode_i32(ty as i32),
                    encode_i32(msg_id),
                    encode_i32(0),
                ],
                0,
            )
            .unwrap();
    }
    assert_eq!(
        started_rx.recv_timeout(Duration::from_secs(3)).unwrap(),
        (0, 0)
    );
    assert_eq!(
        ended_rx.recv_timeout(Duration::from_secs(3)).unwrap(),
        (0, 0)
    );
    service.stop();
}
