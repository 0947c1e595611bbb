//! Framed request pipeline (C2, §4.2).
//!
//! Accepts connections, splits the byte stream on newlines, and runs
//! each decoded frame through authentication and dispatch. One response
//! line is written per request line; there is no pipelining identifier,
//! so within a connection responses come back in request order for
//! free — the server only starts reading the next line after finishing
//! the current one.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};

use crate::auth;
use crate::error::BrokerError;
use crate::protocol::{failure, Request};
use crate::state::{now_ms, BrokerCore};

const READ_CHUNK: usize = 8 * 1024;

/// Accept loop. Runs until the listener errors persistently or the task
/// is aborted by the lifecycle controller.
pub async fn run(listener: UnixListener, core: Arc<BrokerCore>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let core = Arc::clone(&core);
                if core.draining.load(Ordering::Relaxed) {
                    tokio::spawn(reject_draining(stream));
                    continue;
                }
                tokio::spawn(handle_connection(stream, core));
            }
            Err(err) => {
                log::error!("accept error: {err}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn reject_draining(stream: UnixStream) {
    let (_reader, mut writer) = stream.into_split();
    let _ = write_line(&mut writer, &failure(BrokerError::Draining)).await;
}

async fn handle_connection(stream: UnixStream, core: Arc<BrokerCore>) {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(err) => {
                log::debug!("connection read error: {err}");
                return;
            }
        };
        buf.extend_from_slice(&chunk[..n]);

        if buf.len() > core.config.max_request_size {
            let _ = write_line(&mut writer, &failure(BrokerError::TooLarge)).await;
            return;
        }

        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            process_line(line, &core, &mut writer).await;
        }
    }
}

async fn process_line(line: &[u8], core: &Arc<BrokerCore>, writer: &mut OwnedWriteHalf) {
    let request: Request = match serde_json::from_slice(line) {
        Ok(request) => request,
        Err(_) => {
            let _ = write_line(writer, &failure(BrokerError::InvalidJson)).await;
            return;
        }
    };

    let now = now_ms();
    let started = std::time::Instant::now();
    core.in_flight.fetch_add(1, Ordering::Relaxed);
    core.touch_activity(now);
    let correlation_id = core.next_correlation_id();
    let action = request.action.clone();

    let response = match core.config.secret.as_deref() {
        Some(secret) => match auth::verify(secret.as_bytes(), line) {
            Ok(()) => dispatch_logged(core, &request, now, &correlation_id, started).0,
            Err(err) => {
                log::debug!("auth_failed correlation_id={correlation_id} action={action}");
                failure(err)
            }
        },
        None => dispatch_logged(core, &request, now, &correlation_id, started).0,
    };

    if write_line(writer, &response).await.is_err() {
        log::debug!("write failed for correlation_id={correlation_id}");
    }
    core.in_flight.fetch_sub(1, Ordering::Relaxed);
}

fn dispatch_logged(
    core: &Arc<BrokerCore>,
    request: &Request,
    now: i64,
    correlation_id: &str,
    started: std::time::Instant,
) -> (Value, bool) {
    let (response, ok) = core.dispatch(request, now);
    let elapsed_micros = started.elapsed().as_micros() as u64;
    if core.config.structured_logging {
        crate::logging::request_event(&request.action, correlation_id, elapsed_micros, ok);
    } else {
        log::debug!(
            "request handled action={} correlation_id={correlation_id} elapsed_micros={elapsed_micros} ok={ok}",
            request.action
        );
    }
    (response, ok)
}

async fn write_line(writer: &mut OwnedWriteHalf, value: &Value) -> std::io::Result<()> {
    let mut bytes = serde_json::to_vec(value).expect("response values always serialize");
    bytes.push(b'\n');
    writer.write_all(&bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tokio::io::AsyncWriteExt as _;

    async fn start(core: Arc<BrokerCore>) -> (std::path::PathBuf, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("test.sock");
        let listener = crate::endpoint::bind(&path).await.unwrap();
        tokio::spawn(run(listener, core));
        (path, dir)
    }

    #[tokio::test]
    async fn basic_round_trip() {
        let core = Arc::new(BrokerCore::new(Config::default()));
        let (path, _dir) = start(core).await;

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_all(b"{\"action\":\"set\",\"key\":\"foo\",\"value\":\"bar\",\"ttl\":60000}\n").await.unwrap();

        let mut buf = [0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap();
        let response: Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(response["ok"], true);

        stream.write_all(b"{\"action\":\"get\",\"key\":\"foo\"}\n").await.unwrap();
        let n = stream.read(&mut buf).await.unwrap();
        let response: Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(response["value"], "bar");
    }

    #[tokio::test]
    async fn invalid_json_does_not_close_connection() {
        let core = Arc::new(BrokerCore::new(Config::default()));
        let (path, _dir) = start(core).await;

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_all(b"not json\n").await.unwrap();
        let mut buf = [0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap();
        let response: Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(response["error"], "invalid_json");

        stream.write_all(b"{\"action\":\"ping\"}\n").await.unwrap();
        let n = stream.read(&mut buf).await.unwrap();
        let response: Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(response["ok"], true);
    }

    #[tokio::test]
    async fn draining_rejects_new_connections() {
        let core = Arc::new(BrokerCore::new(Config::default()));
        core.draining.store(true, Ordering::Relaxed);
        let (path, _dir) = start(core).await;

        let mut stream = UnixStream::connect(&path).await.unwrap();
        let mut buf = [0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap();
        let response: Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(response["error"], "draining");
    }

    #[tokio::test]
    async fn hmac_auth_failure_and_success() {
        let mut config = Config::default();
        config.secret = Some("shared-secret".to_string());
        let core = Arc::new(BrokerCore::new(config));
        let (path, _dir) = start(core).await;

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_all(b"{\"action\":\"ping\",\"hmac\":\"zz\"}\n").await.unwrap();
        let mut buf = [0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap();
        let response: Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(response["error"], "auth_failed");

        let body = br#"{"action":"ping"}"#;
        let hmac = auth::sign(b"shared-secret", body);
        let framed = format!("{{\"action\":\"ping\",\"hmac\":\"{hmac}\"}}\n");
        stream.write_all(framed.as_bytes()).await.unwrap();
        let n = stream.read(&mut buf).await.unwrap();
        let response: Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(response["ok"], true);
    }
}
