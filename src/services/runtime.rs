//! tokio tasks around the shared core.
//!
//! | Task | Does |
//! |------|------|
//! | [`run_upstream`] | connect, pump and reconnect the command station link |
//! | [`run_relay`] | accept downstream clients, one task per client |
//! | [`run_ticker`] | relay keepalive, automation tick, change feed |
//!
//! Every task polls on a fixed period and holds the core lock only for
//! one short step at a time.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, MissedTickBehavior};

use crate::hal::TcpLineTransport;
use crate::session::SessionSignal;
use crate::traits::{DeltaSink, LineTransport, PinConfigurator, ScriptSource};

use super::{SharedBridge, UpstreamRunner};

/// Poll period of the network tasks.
pub const POLL_PERIOD: Duration = Duration::from_millis(20);

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticks = interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticks
}

// ============================================================================
// Upstream
// ============================================================================

/// Keep the upstream link alive until the session gives up.
///
/// Connection attempts are paced by the session's own backoff: a failed
/// attempt degrades the session, and the next attempt starts only when it
/// asks for one.
pub async fn run_upstream(shared: Arc<SharedBridge>) {
    let (host, port) = shared.with_core(|core| {
        let network = &core.config().network;
        (network.host.as_str().to_string(), network.port)
    });
    let mut runner: UpstreamRunner<TcpLineTransport> = UpstreamRunner::new(Arc::clone(&shared));
    let mut ticks = ticker(POLL_PERIOD);
    let mut want_connect = true;

    loop {
        if want_connect {
            want_connect = false;
            match TcpLineTransport::connect(&host, port).await {
                Ok(link) => {
                    info!("[upstream] connected to {}", link.peer());
                    runner.attach(link);
                }
                Err(err) => {
                    warn!("[upstream] connect to {}:{} failed: {}", host, port, err);
                    runner.connect_failed();
                }
            }
        }

        ticks.tick().await;
        match runner.poll() {
            Some(SessionSignal::Reconnect { .. }) => want_connect = true,
            Some(SessionSignal::GaveUp) => {
                error!("[upstream] giving up on {}:{}", host, port);
                return;
            }
            Some(SessionSignal::Disconnect(_)) | None => {}
        }
    }
}

// ============================================================================
// Relay
// ============================================================================

/// Accept relay clients until the listener fails.
pub async fn run_relay(shared: Arc<SharedBridge>, listener: TcpListener) {
    if let Ok(addr) = listener.local_addr() {
        info!("[relay] listening on {}", addr);
    }
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!("[relay] accept failed: {}", err);
                return;
            }
        };
        let now = shared.now_ms();
        let remote = remote.to_string();
        match shared.with_core(|core| core.accept_client(&remote, now)) {
            Ok(slot) => {
                tokio::spawn(serve_client(Arc::clone(&shared), slot, stream));
            }
            Err(err) => warn!("[relay] {} refused: {}", remote, err),
        }
    }
}

async fn serve_client(shared: Arc<SharedBridge>, slot: u8, stream: TcpStream) {
    let _ = stream.set_nodelay(true);
    let mut link = TcpLineTransport::from_stream(stream);
    let mut ticks = ticker(POLL_PERIOD);

    'serve: loop {
        ticks.tick().await;
        while let Some(line) = link.try_recv_line() {
            let now = shared.now_ms();
            if let Err(err) = shared.with_core(|core| core.on_client_line(slot, &line, now)) {
                warn!("[relay] slot {}: {}", slot, err);
            }
        }

        let (lines, active) = shared.with_core(|core| (core.drain_client(slot), core.client_active(slot)));
        for line in lines {
            if link.send_line(&line).is_err() {
                break 'serve;
            }
        }
        if !active || !link.is_connected() {
            break;
        }
    }

    info!("[relay] slot {} ({}) closed", slot, link.peer());
    shared.with_core(|core| core.teardown_client(slot));
}

// ============================================================================
// Scheduler
// ============================================================================

/// Run the scheduler tick forever.
pub async fn run_ticker<S, P, K>(shared: Arc<SharedBridge>, scripts: S, mut pins: P, mut sink: K)
where
    S: ScriptSource,
    P: PinConfigurator,
    K: DeltaSink,
    K::Error: core::fmt::Debug,
{
    let period = shared.with_core(|core| core.config().automation.tick_ms);
    let mut ticks = ticker(Duration::from_millis(period));
    loop {
        ticks.tick().await;
        let now = shared.now_ms();
        let (failures, published) = shared.with_core(|core| {
            let failures = core.tick(now, &scripts, &mut pins);
            (failures, core.publish_to(&mut sink))
        });
        for (pid, err) in failures {
            warn!("[automation] process {} failed: {}", pid, err);
        }
        if let Err(err) = published {
            warn!("[feed] sink failed: {:?}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeCore;
    use crate::config::{Config, NetworkConfig};
    use crate::services::{LogSink, LoggedPins};
    use crate::hal::MockScripts;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    async fn wait_until(mut f: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if f() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn upstream_synchronizes_with_withrottle_server() {
        let station = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = station.local_addr().unwrap().port();
        let config = Config::default().with_network(NetworkConfig::default().with_host("127.0.0.1").with_port(port));
        let shared = Arc::new(SharedBridge::new(BridgeCore::new(config)));

        let task = tokio::spawn(run_upstream(Arc::clone(&shared)));
        let (mut peer, _) = station.accept().await.unwrap();
        peer.write_all(b"VN2.0\nRL1]\\[Mogul}|{1234}|{L\nPPA1\n").await.unwrap();

        assert!(wait_until(|| shared.with_core(|c| c.session().is_synchronized())).await);
        assert!(shared.with_core(|c| c.registries().locomotive(1234).is_some()));
        task.abort();
    }

    #[tokio::test]
    async fn relay_client_gets_greeting_and_is_torn_down() {
        let shared = Arc::new(SharedBridge::new(BridgeCore::new(Config::default())));
        shared.with_core(|c| {
            c.on_connected(0);
            for line in ["VN2.0", "RL0", "PPA1"] {
                c.on_upstream_line(line, 1).unwrap();
            }
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(run_relay(Arc::clone(&shared), listener));

        let client = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = client.into_split();
        write.write_all(b"NPhone\n").await.unwrap();
        let mut lines = BufReader::new(read).lines();
        let first = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.as_deref(), Some("VN2.0"));
        assert!(shared.with_core(|c| c.client_active(0)));

        drop(write);
        drop(lines);
        assert!(wait_until(|| shared.with_core(|c| c.relay().connection(0).is_none())).await);
        task.abort();
    }

    #[tokio::test]
    async fn ticker_runs_scripts() {
        let shared = Arc::new(SharedBridge::new(BridgeCore::new(Config::default())));
        let scripts = MockScripts::new().with_script("count", "set $n 7");
        shared
            .with_core(|c| c.spawn_script("count", 0, &scripts, &mut LoggedPins, false))
            .unwrap();

        let task = tokio::spawn(run_ticker(Arc::clone(&shared), scripts, LoggedPins, LogSink::default()));
        assert!(wait_until(|| shared.with_core(|c| c.automation().variable("n")) == 7).await);
        task.abort();
    }
}
