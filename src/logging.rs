//! Logging sink (§A "Ambient stack").
//!
//! Plain mode defers to `env_logger`. Structured mode installs a small
//! `log::Log` implementation that writes one JSON object per line to
//! stderr instead, carrying `ts`, `level`, `msg`, and a free-form
//! metadata map — used for per-request events (`correlation_id`,
//! `action`, `ok`) as well as lifecycle events.

use std::io::Write;

use log::{LevelFilter, Log, Metadata, Record};
use serde_json::{json, Map, Value};

use crate::config::Config;

struct StructuredLogger {
    level: LevelFilter,
}

impl Log for StructuredLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = json!({
            "ts": crate::state::now_ms(),
            "level": record.level().to_string(),
            "msg": record.args().to_string(),
            "target": record.target(),
        });
        let _ = writeln!(std::io::stderr(), "{line}");
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Install either `env_logger` or the structured JSON sink, per config.
pub fn init(config: &Config) {
    let level = parse_level(&config.log_level);
    if config.structured_logging {
        let logger = Box::new(StructuredLogger { level });
        if log::set_boxed_logger(logger).is_ok() {
            log::set_max_level(level);
        }
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level)).init();
    }
}

fn parse_level(name: &str) -> LevelFilter {
    match name.to_ascii_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// Emit a structured per-request event with correlation id, elapsed
/// time, and result, the concrete form of "the core emits events with
/// severity, correlation ID, and a metadata map" (§1) when structured
/// logging is on. Plain mode logs the equivalent via a formatted
/// `log::debug!` at the call site instead (see `server.rs`).
pub fn request_event(action: &str, correlation_id: &str, elapsed_micros: u64, ok: bool) {
    let mut metadata = Map::new();
    metadata.insert("action".to_string(), Value::String(action.to_string()));
    metadata.insert("correlation_id".to_string(), Value::String(correlation_id.to_string()));
    metadata.insert("elapsed_micros".to_string(), json!(elapsed_micros));
    metadata.insert("ok".to_string(), Value::Bool(ok));
    let line = json!({
        "ts": crate::state::now_ms(),
        "level": if ok { "info" } else { "warn" },
        "msg": "request handled",
        "metadata": metadata,
    });
    eprintln!("{line}");
}
