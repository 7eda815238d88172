// End-to-end tests over the TCP listener
//
// The test thread plays the debugger: it owns the broker and calls
// `drain`/`on_stop`, while clients run on their own threads.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use reqwest::blocking::Client;
use serde_json::{json, Value};
use tempfile::TempDir;
use voltron_adaptor::mock::{MockAdaptor, DEMO_MAIN, DEMO_SP};
use voltron_adaptor::Adaptor;
use voltron_broker::protocol::*;
use voltron_broker::{Broker, BrokerConfig};

struct Harness {
    broker: Broker,
    adaptor: Arc<MockAdaptor>,
    client: Client,
    base: String,
    _dir: TempDir,
}

impl Harness {
    fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig {
            tcp: Some("127.0.0.1:0".parse().unwrap()),
            domain: Some(dir.path().join("voltron.sock")),
            ..BrokerConfig::default()
        };

        let adaptor = Arc::new(MockAdaptor::demo());
        let mut broker = Broker::new(config, vec!["mock".to_string()]);
        broker.bind(adaptor.clone());
        broker.start().unwrap();

        let base = format!("http://{}", broker.tcp_addr().unwrap());
        Self {
            broker,
            adaptor,
            client: Client::new(),
            base,
            _dir: dir,
        }
    }

    fn post(&self, body: Value) -> Value {
        post_with(&self.client, &self.base, body)
    }

    fn get(&self, path: &str) -> Value {
        self.client
            .get(format!("{}{}", self.base, path))
            .send()
            .unwrap()
            .json()
            .unwrap()
    }

    /// Send `body` from another thread
    fn post_in_background(&self, body: Value) -> thread::JoinHandle<Value> {
        let client = self.client.clone();
        let base = self.base.clone();
        thread::spawn(move || post_with(&client, &base, body))
    }

    fn wait_for_queued(&self, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.broker.dispatcher().queued() < n {
            assert!(Instant::now() < deadline, "requests never reached the queue");
            thread::sleep(Duration::from_millis(5));
        }
    }
}

fn post_with(client: &Client, base: &str, body: Value) -> Value {
    let resp = client
        .post(format!("{}/api/request", base))
        .json(&body)
        .send()
        .unwrap();
    assert_eq!(resp.status(), 200);
    resp.json().unwrap()
}

fn error_code(resp: &Value) -> Option<u64> {
    (resp["status"] == "error").then(|| resp["data"]["code"].as_u64().unwrap())
}

fn decode(field: &Value) -> Vec<u8> {
    BASE64_STANDARD.decode(field.as_str().unwrap()).unwrap()
}

#[test]
fn test_version() {
    let h = Harness::start();
    h.adaptor.set_version("lldb-something");

    let resp = h.post(json!({"type": "request", "request": "version"}));
    assert_eq!(
        resp,
        json!({
            "type": "response",
            "status": "success",
            "data": {"api_version": 1.1, "host_version": "lldb-something"}
        })
    );
}

#[test]
fn test_unknown_kind() {
    let h = Harness::start();
    let resp = h.post(json!({"type": "request", "request": "xxx"}));
    assert_eq!(resp["type"], "response");
    assert_eq!(error_code(&resp), Some(4098));
    assert!(resp["data"]["message"].is_string());
}

#[test]
fn test_memory_get_route() {
    let h = Harness::start();
    h.adaptor.map(4096, vec![0xff; 64]);

    let resp = h.get("/api/memory?address=4096&length=64");
    assert_eq!(resp["status"], "success");
    assert_eq!(resp["data"]["bytes"], 64);
    assert_eq!(decode(&resp["data"]["memory"]), vec![0xff; 64]);
}

#[test]
fn test_registers_with_deref() {
    let h = Harness::start();
    let resp = h.post(json!({
        "type": "request",
        "request": "registers",
        "data": {"registers": ["rip"]}
    }));

    assert_eq!(resp["data"]["registers"]["rip"], 4294970096u64);
    assert_eq!(resp["data"]["registers"]["rip"], DEMO_MAIN);
    assert_eq!(resp["data"]["deref"]["rip"][0][0], "pointer");
    assert_eq!(resp["data"]["deref"]["rip"][1], json!(["symbol", "main + 0x0"]));
}

#[test]
fn test_pc_alias_over_the_wire() {
    let h = Harness::start();
    let aliased = h.get("/api/registers?registers=pc");
    let direct = h.get("/api/registers?registers=rip");

    let regs = aliased["data"]["registers"].as_object().unwrap();
    assert_eq!(regs.len(), 1);
    assert_eq!(aliased["data"]["registers"]["rip"], direct["data"]["registers"]["rip"]);
}

#[test]
fn test_wait_times_out() {
    let h = Harness::start();
    let started = Instant::now();
    let resp = h.post(json!({"type": "request", "request": "wait", "data": {"timeout": 1}}));

    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(error_code(&resp), Some(u64::from(TIMED_OUT)));

    let deadline = Instant::now() + Duration::from_millis(100);
    while h.adaptor.notifier().listener_count() > 0 {
        assert!(Instant::now() < deadline, "listener outlived its timeout");
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(h.broker.dispatcher().queued(), 0);
}

#[test]
fn test_wait_wakes_on_stop() {
    let h = Harness::start();
    let waiter = h.post_in_background(json!({"type": "request", "request": "wait", "data": {"timeout": 5}}));

    while h.adaptor.notifier().listener_count() == 0 {
        thread::sleep(Duration::from_millis(5));
    }
    h.broker.on_stop();

    let resp = waiter.join().unwrap();
    assert_eq!(resp["data"]["state"], "stopped");
}

#[test]
fn test_write_then_read() {
    let h = Harness::start();
    let resp = h.post(json!({
        "type": "request",
        "request": "write_memory",
        "data": {"address": DEMO_SP, "value": BASE64_STANDARD.encode(b"AAAAAAAA")}
    }));
    assert_eq!(resp, json!({"type": "response", "status": "success", "data": {}}));

    let resp = h.post(json!({
        "type": "request",
        "request": "memory",
        "data": {"address": DEMO_SP, "length": 8}
    }));
    assert_eq!(decode(&resp["data"]["memory"]), vec![0x41; 8]);
}

#[test]
fn test_queued_requests_run_in_order() {
    let h = Harness::start();
    let write = |value: &[u8]| {
        json!({
            "type": "request",
            "request": "write_memory",
            "block": true,
            "data": {"address": DEMO_SP, "value": BASE64_STANDARD.encode(value)}
        })
    };

    let a = h.post_in_background(write(b"AAAAAAAA"));
    h.wait_for_queued(1);
    let b = h.post_in_background(write(b"BBBBBBBB"));
    h.wait_for_queued(2);

    assert_eq!(h.broker.drain(), 2);
    assert_eq!(a.join().unwrap()["status"], "success");
    assert_eq!(b.join().unwrap()["status"], "success");

    // the later write landed last
    assert_eq!(h.adaptor.memory(DEMO_SP, 8, 0).unwrap(), b"BBBBBBBB".to_vec());
    assert_eq!(h.broker.dispatcher().queued(), 0);
}

#[test]
fn test_blocking_request_times_out_without_stop() {
    let h = Harness::start();
    let resp = h.post(json!({"type": "request", "request": "state", "block": true, "timeout": 0.2}));
    assert_eq!(error_code(&resp), Some(u64::from(TIMED_OUT)));
    assert_eq!(h.broker.dispatcher().queued(), 0);

    // nothing left for the next stop
    assert_eq!(h.broker.drain(), 0);
}

#[test]
fn test_blocking_request_is_answered_by_drain() {
    let h = Harness::start();
    let pending = h.post_in_background(json!({"type": "request", "request": "backtrace", "block": true}));
    h.wait_for_queued(1);

    assert_eq!(h.broker.on_stop(), 1);
    let resp = pending.join().unwrap();
    assert_eq!(resp["data"]["frames"][0]["name"], "inferior`main + 0");
}

#[test]
fn test_shutdown_cancels_queue_and_releases_sockets() {
    let mut h = Harness::start();
    let path = h.broker.domain_path().unwrap().to_path_buf();
    let addr = h.broker.tcp_addr().unwrap();

    let pending = h.post_in_background(json!({"type": "request", "request": "state", "block": true}));
    h.wait_for_queued(1);

    h.broker.stop();
    assert_eq!(error_code(&pending.join().unwrap()), Some(u64::from(SERVER_NOT_RUNNING)));
    assert!(!path.exists());
    assert!(std::net::TcpStream::connect(addr).is_err());
}

#[test]
fn test_errors_are_well_formed() {
    let h = Harness::start();

    let resp: Value = h
        .client
        .post(format!("{}/api/request", h.base))
        .body("{not json")
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(error_code(&resp), Some(u64::from(INVALID_REQUEST)));

    let resp = h.post(json!({"type": "request", "request": "memory", "data": {"address": 4096}}));
    assert_eq!(error_code(&resp), Some(u64::from(MISSING_FIELD)));

    let resp = h.post(json!({"type": "request", "request": "state", "data": {"target_id": 7}}));
    assert_eq!(error_code(&resp), Some(u64::from(NO_SUCH_TARGET)));

    let resp = h.post(json!({"type": "request", "request": "command", "data": {"command": "frobnicate"}}));
    assert_eq!(error_code(&resp), Some(u64::from(GENERIC_ERROR)));

    h.adaptor.set_state(voltron_adaptor::TargetState::Running);
    let resp = h.get("/api/stack?length=8");
    assert_eq!(error_code(&resp), Some(u64::from(TARGET_BUSY)));
}

#[test]
fn test_debugger_not_present() {
    let h = Harness::start();
    h.broker.unbind();
    let resp = h.get("/api/version");
    assert_eq!(error_code(&resp), Some(u64::from(DEBUGGER_NOT_PRESENT)));
}

#[test]
fn test_plugins_and_null() {
    let h = Harness::start();

    let resp = h.get("/api/plugins");
    let plugins = &resp["data"]["plugins"];
    assert_eq!(plugins["debugger"], json!(["mock"]));
    assert_eq!(plugins["api"]["memory"]["request"]["address"], false);
    assert_eq!(plugins["api"]["command"]["request"]["command"], true);
    assert_eq!(plugins["capabilities"], json!([]));

    let resp = h.get("/api/null");
    assert_eq!(resp, json!({"type": "response", "status": "success", "data": {}}));
}

#[test]
fn test_index_and_unknown_paths() {
    let h = Harness::start();

    let resp = h.client.get(format!("{}/", h.base)).send().unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.text().unwrap().contains("voltron"));

    let resp = h.client.get(format!("{}/nope", h.base)).send().unwrap();
    assert_eq!(resp.status(), 404);
}

#[test]
fn test_disassemble_and_stack() {
    let h = Harness::start();

    let resp = h.get("/api/disassemble?count=4");
    let listing = resp["data"]["disassembly"].as_str().unwrap();
    assert_eq!(listing.lines().count(), 4);
    assert!(listing.starts_with(&format!("0x{:x}:", DEMO_MAIN)));
    assert_eq!(resp["data"]["host"], "mock");

    let resp = h.get("/api/stack?length=16");
    assert_eq!(resp["data"]["stack_pointer"], DEMO_SP);
    assert_eq!(decode(&resp["data"]["memory"]).len(), 16);
}

#[test]
fn test_domain_socket_keep_alive() {
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

    let h = Harness::start();
    let path = h.broker.domain_path().unwrap().to_path_buf();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let bodies = rt.block_on(async move {
        let stream = tokio::net::UnixStream::connect(&path).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        let mut bodies = Vec::new();

        for kind in ["version", "state"] {
            let body = json!({"type": "request", "request": kind}).to_string();
            let req = format!(
                "POST /api/request HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            write.write_all(req.as_bytes()).await.unwrap();

            let mut length = 0;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        length = value.trim().parse().unwrap();
                    }
                }
            }
            let mut body = vec![0; length];
            reader.read_exact(&mut body).await.unwrap();
            bodies.push(serde_json::from_slice::<Value>(&body).unwrap());
        }
        bodies
    });

    assert_eq!(bodies[0]["data"]["host_version"], "mock-1.0");
    assert_eq!(bodies[1]["data"]["state"], "stopped");
}

fn read_until(stream: &mut std::net::TcpStream, buf: &mut Vec<u8>, needle: &str) {
    use std::io::Read;

    let mut chunk = [0u8; 4096];
    while !String::from_utf8_lossy(buf).contains(needle) {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed before {:?} arrived", needle);
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[test]
fn test_chunked_request_body() {
    use std::io::{Read, Write};

    let h = Harness::start();
    let mut stream = std::net::TcpStream::connect(h.broker.tcp_addr().unwrap()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let body = r#"{"type":"request","request":"version"}"#;
    let (head, tail) = body.split_at(10);
    write!(
        stream,
        "POST /api/request HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\n\
         Transfer-Encoding: chunked\r\nConnection: close\r\n\r\n\
         {:x}\r\n{}\r\n{:x}\r\n{}\r\n0\r\n\r\n",
        head.len(),
        head,
        tail.len(),
        tail
    )
    .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains("\"host_version\":\"mock-1.0\""));
}

#[test]
fn test_expect_continue() {
    use std::io::Write;

    let h = Harness::start();
    let mut stream = std::net::TcpStream::connect(h.broker.tcp_addr().unwrap()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let body = r#"{"type":"request","request":"state"}"#;
    write!(
        stream,
        "POST /api/request HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\n\
         Content-Length: {}\r\nExpect: 100-continue\r\n\r\n",
        body.len()
    )
    .unwrap();

    let mut buf = Vec::new();
    read_until(&mut stream, &mut buf, "100 Continue");

    stream.write_all(body.as_bytes()).unwrap();
    read_until(&mut stream, &mut buf, "\"state\":\"stopped\"");
    assert!(String::from_utf8_lossy(&buf).contains("HTTP/1.1 200"));
}

#[test]
fn test_numeric_text_field_over_get() {
    let h = Harness::start();
    h.adaptor.map(0x1234, vec![0x5a; 16]);

    // the command's text is passed through, not turned into a number
    let resp = h.get("/api/command?command=1234");
    assert_ne!(error_code(&resp), Some(u64::from(INVALID_REQUEST)));

    let resp = h.get("/api/memory?command=print%200x1234&length=4");
    assert_eq!(decode(&resp["data"]["memory"]), vec![0x5a; 4]);
}
