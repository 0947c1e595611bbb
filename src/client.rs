//! Reference client library (§B, §6 "Client retry policy").
//!
//! Specified only where it affects the wire contract: connect-time
//! retries, a local `ttl_required` pre-check, HMAC signing, and the
//! gzip+base64 compression framing the broker stores opaquely. The
//! retry schedule mirrors the reference CLI's `connect_to_hub` backoff
//! (fixed delays rather than a multiplicative one).

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::Engine as _;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::auth;

/// Fixed backoff schedule for connect-time retries (§6).
const RETRY_SCHEDULE_MS: &[u64] = &[50, 100, 200, 400, 800];

/// Default bound on total retry time (§6).
pub const DEFAULT_TOTAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry connecting to `path` on the fixed backoff schedule until one
/// attempt succeeds or `total_timeout` elapses.
pub async fn connect_with_retry(path: &Path, total_timeout: Duration) -> Result<UnixStream> {
    let start = Instant::now();
    let mut attempts = 0u32;
    let mut last_err = None;

    loop {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
        attempts += 1;

        let Some(&delay_ms) = RETRY_SCHEDULE_MS.get((attempts - 1) as usize) else {
            break;
        };
        if start.elapsed() >= total_timeout {
            break;
        }
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        if start.elapsed() >= total_timeout {
            break;
        }
    }

    Err(last_err.unwrap_or_else(|| std::io::Error::other("no connection attempt was made")))
        .with_context(|| {
            format!(
                "failed to connect to {} after {attempts} attempts over {:?}",
                path.display(),
                start.elapsed()
            )
        })
}

/// A connected client session over one endpoint connection.
pub struct BrokerClient {
    stream: BufReader<UnixStream>,
    secret: Option<String>,
    require_ttl_locally: bool,
}

impl BrokerClient {
    /// Connect with the standard retry policy, then wrap the stream.
    pub async fn connect(
        path: &Path,
        secret: Option<String>,
        require_ttl_locally: bool,
        total_timeout: Duration,
    ) -> Result<Self> {
        let stream = connect_with_retry(path, total_timeout).await?;
        Ok(Self {
            stream: BufReader::new(stream),
            secret,
            require_ttl_locally,
        })
    }

    /// Send one request frame and await its response. `set` requests are
    /// checked for a positive `ttl` locally before sending, when
    /// `require_ttl_locally` is set, to avoid a round trip.
    pub async fn call(&mut self, mut request: Value) -> Result<Value> {
        if self.require_ttl_locally && request.get("action").and_then(Value::as_str) == Some("set") {
            let ttl_ok = request.get("ttl").and_then(Value::as_i64).is_some_and(|t| t > 0);
            if !ttl_ok {
                bail!("ttl_required");
            }
        }

        if let Some(secret) = self.secret.clone() {
            let body = serde_json::to_vec(&request).context("failed to serialize request")?;
            let hmac = auth::sign(secret.as_bytes(), &body);
            request
                .as_object_mut()
                .context("request must be a JSON object")?
                .insert("hmac".to_string(), Value::String(hmac));
        }

        let mut line = serde_json::to_vec(&request).context("failed to serialize request")?;
        line.push(b'\n');
        self.stream.get_mut().write_all(&line).await.context("connection write failed")?;

        let mut response_line = String::new();
        let bytes_read = self
            .stream
            .read_line(&mut response_line)
            .await
            .context("connection read failed")?;
        if bytes_read == 0 {
            bail!("connection closed before a response arrived");
        }

        serde_json::from_str(response_line.trim_end()).context("broker returned invalid JSON")
    }
}

/// Gzip+base64 a JSON value if it's at least `threshold` bytes
/// serialized, returning `(wire_value, compressed, before_size, after_size)`
/// ready to splice into a `set` request (§4.4).
#[must_use]
pub fn maybe_compress(value: &Value, threshold: usize) -> (Value, bool, Option<u64>, Option<u64>) {
    let serialized = serde_json::to_vec(value).unwrap_or_default();
    let before = serialized.len();
    if before < threshold {
        return (value.clone(), false, None, None);
    }

    use std::io::Write as _;
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&serialized).expect("writing to an in-memory gzip sink cannot fail");
    let compressed = encoder.finish().expect("finishing an in-memory gzip sink cannot fail");
    let after = compressed.len();

    let encoded = base64::engine::general_purpose::STANDARD.encode(compressed);
    (Value::String(encoded), true, Some(before as u64), Some(after as u64))
}

/// Reverse of [`maybe_compress`]: decode and inflate a `get` response's
/// value when its `compressed` flag is set. `key` is the value's store
/// key, included in error context so a caller can tell which entry
/// failed to decompress (§7).
pub fn decompress_value(key: &str, encoded: &str) -> Result<Value> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .with_context(|| format!("compressed value for key {key:?} was not valid base64"))?;

    use std::io::Read as _;
    let mut decoder = flate2::read::GzDecoder::new(&bytes[..]);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).with_context(|| {
        format!(
            "compressed value for key {key:?} was not a valid gzip stream; broker and client may be at different versions"
        )
    })?;

    serde_json::from_slice(&out).with_context(|| format!("decompressed payload for key {key:?} was not valid JSON"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn small_values_are_left_uncompressed() {
        let (value, compressed, before, after) = maybe_compress(&json!("x"), 1024);
        assert_eq!(value, json!("x"));
        assert!(!compressed);
        assert!(before.is_none());
        assert!(after.is_none());
    }

    #[test]
    fn large_values_round_trip_through_compression() {
        let original = json!("x".repeat(4096));
        let (wire_value, compressed, before, after) = maybe_compress(&original, 1024);
        assert!(compressed);
        assert!(before.unwrap() > after.unwrap());

        let encoded = wire_value.as_str().unwrap();
        let decoded = decompress_value("foo", encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn corrupt_base64_is_reported_not_panicking() {
        let err = decompress_value("foo", "not base64!!").unwrap_err();
        assert!(err.to_string().contains("foo"));
    }

    #[tokio::test]
    async fn connect_retry_gives_up_after_total_timeout() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("nobody-listening.sock");
        let result = connect_with_retry(&missing, Duration::from_millis(150)).await;
        assert!(result.is_err());
    }
}
