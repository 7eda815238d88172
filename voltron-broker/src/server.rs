// Transport front-end
//
// TCP and Unix domain socket listeners serving one axum router. Each
// accepted stream is driven by hyper's HTTP/1.1 connection, which handles
// keep-alive, chunked bodies and `Expect: 100-continue`.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use serde_json::map::Entry;
use serde_json::{Map, Number, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::protocol::{ApiResponse, RequestEnvelope};
use crate::requests::TEXT_FIELDS;

/// Largest request body accepted
pub const MAX_BODY: usize = 16 * 1024 * 1024;

/// How long in-flight connections get to write their last response once
/// the listener stops
const CONNECTION_GRACE: Duration = Duration::from_millis(500);

const INDEX_HTML: &str = "<!DOCTYPE html>\n<html><head><title>voltron</title></head>\n<body><p>voltron API server. POST requests to <tt>/api/request</tt>.</p></body></html>\n";

/// Routes shared by both listeners
pub fn router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/request", post(api_request))
        .route("/api/:kind", get(api_get))
        .layer(DefaultBodyLimit::max(MAX_BODY))
        .with_state(dispatcher)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn api_request(State(dispatcher): State<Dispatcher>, body: Bytes) -> Json<ApiResponse> {
    debug!("POST /api/request ({} bytes)", body.len());
    Json(dispatcher.dispatch_json(&body).await)
}

async fn api_get(
    State(dispatcher): State<Dispatcher>,
    Path(kind): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    debug!("GET /api/{} ({} params)", kind, params.len());
    let envelope = envelope_from_query(&kind, params);
    match serde_json::to_value(&envelope) {
        Ok(value) => Json(dispatcher.dispatch_value(value).await).into_response(),
        Err(e) => {
            error!("Failed to build request: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Accept loop for the TCP listener
pub async fn serve_tcp(listener: TcpListener, dispatcher: Dispatcher, mut shutdown: watch::Receiver<bool>) {
    info!("Listening on tcp {:?}", listener.local_addr().ok());
    let app = router(dispatcher);
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    debug!("Accepted tcp connection from {}", peer);
                    stream.set_nodelay(true).ok();
                    connections.spawn(serve_connection(stream, app.clone(), shutdown.clone()));
                }
                Err(e) => warn!("tcp accept failed: {}", e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }

    drop(listener);
    finish(connections).await;
    info!("tcp listener stopped");
}

/// Accept loop for the Unix domain socket listener
pub async fn serve_unix(listener: UnixListener, dispatcher: Dispatcher, mut shutdown: watch::Receiver<bool>) {
    info!("Listening on domain socket {:?}", listener.local_addr().ok());
    let app = router(dispatcher);
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, _)) => {
                    debug!("Accepted domain socket connection");
                    connections.spawn(serve_connection(stream, app.clone(), shutdown.clone()));
                }
                Err(e) => warn!("domain socket accept failed: {}", e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }

    drop(listener);
    finish(connections).await;
    info!("domain socket listener stopped");
}

/// Let connections flush cancelled responses, then abort the rest
async fn finish(mut connections: JoinSet<()>) {
    let pending = connections.len();
    let drained = tokio::time::timeout(CONNECTION_GRACE, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        debug!("Aborting {} of {} connection(s)", connections.len(), pending);
        connections.shutdown().await;
    }
}

async fn serve_connection<S>(stream: S, app: Router, mut shutdown: watch::Receiver<bool>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let conn = http1::Builder::new()
        .keep_alive(true)
        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(app));
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!("Connection closed: {}", e);
            }
            return;
        }
        _ = shutdown.changed() => {}
    }

    // Finish the exchange in flight, then close
    conn.as_mut().graceful_shutdown();
    if let Err(e) = conn.await {
        debug!("Client went away during shutdown: {}", e);
    }
}

/// Coerce a query-string value: integers (decimal or 0x hex), booleans,
/// otherwise a string
pub fn coerce(value: &str) -> Value {
    if let Ok(n) = value.parse::<u64>() {
        return Value::Number(n.into());
    }
    if let Ok(n) = value.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        if let Ok(n) = u64::from_str_radix(hex, 16) {
            return Value::Number(n.into());
        }
    }
    if let Ok(f) = value.parse::<f64>() {
        if let Some(n) = Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    match value {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(value.to_string()),
    }
}

/// Build the request a GET route stands for. `block` and `timeout` go to
/// the envelope; everything else goes into `data`. Text fields keep their
/// value verbatim. Repeated keys become lists.
pub fn envelope_from_query<I>(kind: &str, params: I) -> RequestEnvelope
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut envelope = RequestEnvelope::new(kind, Value::Null);
    let mut data = Map::new();

    for (key, raw) in params {
        let value = if TEXT_FIELDS.contains(&key.as_str()) {
            Value::String(raw)
        } else {
            coerce(&raw)
        };
        match key.as_str() {
            "block" => envelope.block = value.as_bool().unwrap_or(false),
            "timeout" => envelope.timeout = value.as_f64(),
            _ => match data.entry(key) {
                Entry::Occupied(mut entry) => match entry.get_mut() {
                    Value::Array(items) => items.push(value),
                    existing => {
                        let first = existing.take();
                        *existing = Value::Array(vec![first, value]);
                    }
                },
                Entry::Vacant(entry) => {
                    entry.insert(value);
                }
            },
        }
    }

    envelope.data = Value::Object(data);
    envelope
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{GENERIC_ERROR, INVALID_REQUEST};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request};
    use serde_json::json;
    use std::sync::Arc;
    use tower::ServiceExt;
    use voltron_adaptor::MockAdaptor;

    fn params(query: &str) -> Vec<(String, String)> {
        query
            .split('&')
            .filter(|p| !p.is_empty())
            .filter_map(|p| p.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn app() -> Router {
        let d = Dispatcher::new(Duration::from_secs(10), vec!["mock".to_string()], vec![]);
        d.bind(Arc::new(MockAdaptor::demo()));
        d.start();
        router(d)
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Bytes) {
        let resp = app.oneshot(request).await.unwrap();
        let status = resp.status();
        (status, to_bytes(resp.into_body(), MAX_BODY).await.unwrap())
    }

    async fn get_json(uri: &str) -> Value {
        let (status, body) = send(app(), Request::get(uri).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn test_coerce() {
        assert_eq!(coerce("4096"), json!(4096));
        assert_eq!(coerce("-8"), json!(-8));
        assert_eq!(coerce("0x1000"), json!(4096));
        assert_eq!(coerce("0.5"), json!(0.5));
        assert_eq!(coerce("true"), json!(true));
        assert_eq!(coerce("rip"), json!("rip"));
        assert_eq!(coerce("print $rsp"), json!("print $rsp"));
    }

    #[test]
    fn test_envelope_from_query() {
        let env = envelope_from_query("memory", params("address=4096&length=64&block=true&timeout=2"));
        assert_eq!(env.request, "memory");
        assert!(env.block);
        assert_eq!(env.timeout, Some(2.0));
        assert_eq!(env.data, json!({"address": 4096, "length": 64}));
    }

    #[test]
    fn test_text_fields_are_not_coerced() {
        let env = envelope_from_query("command", params("command=1234"));
        assert_eq!(env.data, json!({"command": "1234"}));

        let env = envelope_from_query("memory", params("command=0x10&length=8"));
        assert_eq!(env.data, json!({"command": "0x10", "length": 8}));
    }

    #[test]
    fn test_repeated_keys_become_list() {
        let env = envelope_from_query("registers", params("registers=rip&registers=rsp&registers=rax"));
        assert_eq!(env.data, json!({"registers": ["rip", "rsp", "rax"]}));
    }

    #[test]
    fn test_empty_query() {
        let env = envelope_from_query("version", Vec::new());
        assert_eq!(env.data, json!({}));
        assert!(!env.block);
    }

    #[tokio::test]
    async fn test_get_route_decodes_query() {
        let data = get_json("/api/memory?address=0x1000&length=4").await;
        // 0x1000 is unmapped in the demo process
        assert_eq!(data["status"], "error");
        assert_eq!(data["data"]["code"], GENERIC_ERROR);

        let data = get_json("/api/command?command=echo%20hi%2Bthere").await;
        assert_eq!(data["data"]["output"], "hi+there");
    }

    #[tokio::test]
    async fn test_numeric_looking_command_reaches_host() {
        let data = get_json("/api/command?command=1234").await;
        // the host rejects it, but the request itself is well formed
        assert_eq!(data["data"]["code"], GENERIC_ERROR);
        assert_ne!(data["data"]["code"], INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_post_request() {
        let request = Request::post("/api/request")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"type":"request","request":"version"}"#))
            .unwrap();
        let (status, body) = send(app(), request).await;
        assert_eq!(status, StatusCode::OK);
        let data: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(data["data"]["host_version"], "mock-1.0");
    }

    #[tokio::test]
    async fn test_index_and_unknown_routes() {
        let (status, body) = send(app(), Request::get("/").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8_lossy(&body).contains("voltron"));

        let (status, _) = send(app(), Request::get("/nope").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let request = Request::builder()
            .method(Method::GET)
            .uri("/api/request")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app(), request).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }
}
