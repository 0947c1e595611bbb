//! Lifecycle controller (C7, §4.7).
//!
//! `Fresh -> Listening -> Draining -> Stopped`, with no re-entry to
//! `Listening`. Signal handling follows the polling-flag pattern used
//! for the reference CLI's headless run loop: `signal_hook::flag::register`
//! flips an `AtomicBool`, and the driving loop here polls it alongside
//! the idle watchdog and heartbeat timer rather than spawning a thread
//! per concern.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::endpoint;
use crate::server;
use crate::state::{now_ms, BrokerCore};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const CHILD_FORWARD_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Fresh,
    Listening,
    Draining,
    Stopped,
}

/// Owns the broker's background tasks and drives its state machine.
pub struct Lifecycle {
    core: Arc<BrokerCore>,
    state: State,
    endpoint_path: Option<PathBuf>,
    accept_handle: Option<JoinHandle<()>>,
    sweeper_handle: Option<JoinHandle<()>>,
    signal_flag: Arc<AtomicBool>,
    signal_installed: bool,
    child: Option<tokio::process::Child>,
}

impl Lifecycle {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            core: Arc::new(BrokerCore::new(config)),
            state: State::Fresh,
            endpoint_path: None,
            accept_handle: None,
            sweeper_handle: None,
            signal_flag: Arc::new(AtomicBool::new(false)),
            signal_installed: false,
            child: None,
        }
    }

    #[must_use]
    pub fn core(&self) -> &Arc<BrokerCore> {
        &self.core
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    #[must_use]
    pub fn endpoint_path(&self) -> Option<&PathBuf> {
        self.endpoint_path.as_ref()
    }

    /// Bind the endpoint, export it to the environment, and start the
    /// accept loop, sweeper, and signal handlers.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != State::Fresh {
            anyhow::bail!("start() called from state {:?}, expected Fresh", self.state);
        }

        let path = endpoint::random_path(self.core.config.pipe_id.as_deref());
        let listener = endpoint::bind(&path).await.context("failed to start broker")?;
        self.endpoint_path = Some(path.clone());

        std::env::set_var("BROKER_ENDPOINT", &path);
        if let Some(secret) = &self.core.config.secret {
            std::env::set_var("BROKER_SECRET", secret);
        }

        self.accept_handle = Some(tokio::spawn(server::run(listener, Arc::clone(&self.core))));
        self.sweeper_handle = Some(tokio::spawn(sweep_loop(Arc::clone(&self.core))));
        self.install_signal_handlers();

        self.state = State::Listening;
        log::info!("broker listening on {}", path.display());
        Ok(())
    }

    fn install_signal_handlers(&mut self) {
        if self.signal_installed {
            log::debug!("signal handlers already installed, skipping");
            return;
        }
        for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            if let Err(err) = signal_hook::flag::register(signal, Arc::clone(&self.signal_flag)) {
                log::warn!("failed to register signal handler for {signal}: {err}");
            }
        }
        self.signal_installed = true;
    }

    /// Launch a child process with the endpoint (and secret, if any) in
    /// its environment (§4.7 `spawn`).
    pub fn spawn_child(&mut self, command: &str, args: &[String]) -> Result<()> {
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args);
        if let Some(path) = &self.endpoint_path {
            cmd.env("BROKER_ENDPOINT", path);
        }
        if let Some(secret) = &self.core.config.secret {
            cmd.env("BROKER_SECRET", secret);
        }
        let child = cmd.spawn().with_context(|| format!("failed to spawn child process: {command}"))?;
        self.child = Some(child);
        Ok(())
    }

    /// Drive the broker until a signal, a supervised child's exit, or
    /// the idle watchdog requests shutdown, then drain and stop.
    ///
    /// Returns the process exit code: the child's exit code when one
    /// was supervised, otherwise 0.
    pub async fn run_until_shutdown(&mut self) -> Result<i32> {
        if self.state != State::Listening {
            anyhow::bail!("run_until_shutdown() called from state {:?}, expected Listening", self.state);
        }

        let mut last_heartbeat = now_ms();
        let mut child_exit_code: Option<i32> = None;

        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            if self.signal_flag.swap(false, Ordering::Relaxed) {
                log::info!("signal received, beginning shutdown");
                break;
            }

            if let Some(child) = self.child.as_mut() {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        log::info!("supervised child exited with {status}");
                        child_exit_code = Some(status.code().unwrap_or(1));
                        self.child = None;
                        break;
                    }
                    Ok(None) => {}
                    Err(err) => log::warn!("failed to poll child status: {err}"),
                }
            }

            if let Some(idle_timeout) = self.core.config.idle_timeout {
                let now = now_ms();
                let last = self.core.last_activity_at.load(Ordering::Relaxed);
                if now.saturating_sub(last) >= idle_timeout.as_millis() as i64 {
                    log::info!("idle timeout exceeded, beginning shutdown");
                    break;
                }
            }

            if let Some(heartbeat_interval) = self.core.config.heartbeat_interval {
                let now = now_ms();
                if now.saturating_sub(last_heartbeat) >= heartbeat_interval.as_millis() as i64 {
                    self.emit_heartbeat(now);
                    last_heartbeat = now;
                }
            }
        }

        if let Some(child) = self.child.as_mut() {
            forward_signal_to_child(child);
            let _ = tokio::time::timeout(CHILD_FORWARD_WAIT, child.wait()).await;
        }

        let drained = self.drain(self.core.config.drain_timeout).await;
        if !drained {
            log::warn!("drain timed out with requests still in flight");
        }
        self.stop();

        Ok(child_exit_code.unwrap_or(0))
    }

    /// `drain(timeout)` (§4.7): idempotent, refuses new connections and
    /// waits for `in_flight` to reach zero or the timeout to elapse.
    pub async fn drain(&mut self, timeout: Duration) -> bool {
        if self.state == State::Stopped {
            return true;
        }
        self.state = State::Draining;
        self.core.draining.store(true, Ordering::Relaxed);

        let deadline = tokio::time::Instant::now() + timeout;
        while self.core.in_flight.load(Ordering::Relaxed) > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }

    /// `stop()` (§4.7): cancel timers, close the listener, unlink the
    /// endpoint, and clear the store/lease table. Safe to call more than
    /// once.
    pub fn stop(&mut self) {
        if self.state == State::Stopped {
            return;
        }
        if let Some(handle) = self.accept_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.sweeper_handle.take() {
            handle.abort();
        }
        if let Some(path) = self.endpoint_path.take() {
            endpoint::unlink(&path);
        }
        self.core.clear();
        self.state = State::Stopped;
        log::info!("broker stopped");
    }

    fn emit_heartbeat(&self, now: i64) {
        let uptime_ms = now.saturating_sub(self.core.started_at);
        let in_flight = self.core.in_flight.load(Ordering::Relaxed);
        let approx_bytes = self.core.approximate_bytes(now);
        log::info!("heartbeat uptime_ms={uptime_ms} in_flight={in_flight} approx_bytes={approx_bytes}");
    }
}

async fn sweep_loop(core: Arc<BrokerCore>) {
    let mut ticker = tokio::time::interval(core.config.sweeper_interval);
    loop {
        ticker.tick().await;
        core.sweep(now_ms());
    }
}

#[cfg(unix)]
fn forward_signal_to_child(child: &tokio::process::Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` names a live child we own; SIGTERM is a benign
        // signal we forward to it before waiting for its exit.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn forward_signal_to_child(_child: &tokio::process::Child) {}
