//! Host cycle tests against a scripted in-memory transport.
//!
//! The fake connector hands out connections that answer the fixed command
//! battery with canned output; CPU counters advance on every call so the
//! aggregator can derive utilization.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use perfmon::aggregator::{Aggregator, Reading};
use perfmon::collectors::{Commands, MetricKind};
use perfmon::config::HostTarget;
use perfmon::cycle::{CycleSettings, CycleState, HostCycle};
use perfmon::error::{SampleError, TransportError};
use perfmon::events::{EventHub, HostEvent};
use perfmon::transport::{Connection, Connector};

const MEMINFO: &str = "MemTotal: 8000000 kB\nMemFree: 2000000 kB\nBuffers: 100000 kB\nCached: 900000 kB\n";
const UPTIME: &str = " 10:00:00 up 1 day,  1 user,  load average: 0.42, 0.30, 0.25\n";
const NET_DEV: &str = "  eth0: 1000 0 0 0 0 0 0 0 2000 0 0 0 0 0 0 0\n";
const DF: &str = "Filesystem 1024-blocks Used Available Capacity Mounted on\n/dev/sda1 10485760 5242880 5242760 50% /\n";

/// How a scripted connection behaves.
#[derive(Clone, Copy, Default)]
struct Script {
    /// Connect attempts that fail before one succeeds.
    failing_connects: u32,
    /// Drop the first connection after this many commands.
    disconnect_after: Option<u64>,
    /// Every `uptime` call fails.
    broken_uptime: bool,
}

#[derive(Default)]
struct Counters {
    connects: AtomicU32,
    closes: AtomicU32,
    executes: AtomicU64,
    cpu_calls: AtomicU64,
}

struct ScriptedConnector {
    script: Script,
    counters: Arc<Counters>,
}

struct ScriptedConnection {
    script: Script,
    generation: u32,
    counters: Arc<Counters>,
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, target: &HostTarget) -> Result<Arc<dyn Connection>, TransportError> {
        let attempt = self.counters.connects.fetch_add(1, Ordering::SeqCst);
        if attempt < self.script.failing_connects {
            return Err(TransportError::Connect {
                host: target.display_name().to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(Arc::new(ScriptedConnection {
            script: self.script,
            generation: attempt,
            counters: Arc::clone(&self.counters),
        }))
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn execute(&self, command: &str) -> Result<Vec<u8>, TransportError> {
        let n = self.counters.executes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.generation == self.script.failing_connects {
            if let Some(limit) = self.script.disconnect_after {
                if n > limit {
                    return Err(TransportError::Disconnected {
                        reason: "broken pipe".to_string(),
                    });
                }
            }
        }

        let out = match command {
            "cat /proc/stat" => {
                let step = self.counters.cpu_calls.fetch_add(1, Ordering::SeqCst) + 1;
                // Per step: 100 ticks elapse, 60 of them idle.
                format!("cpu  {} 0 {} {} 0 0 0 0 0 0\n", 30 * step, 10 * step, 60 * step)
            }
            "cat /proc/meminfo" => MEMINFO.to_string(),
            "uptime" if self.script.broken_uptime => {
                return Err(TransportError::Execution {
                    command: command.to_string(),
                    status: Some(127),
                    stderr: "uptime: command not found".to_string(),
                })
            }
            "uptime" => UPTIME.to_string(),
            "cat /proc/net/dev" => NET_DEV.to_string(),
            "df -P -k '/'" => DF.to_string(),
            other => {
                return Err(TransportError::Execution {
                    command: other.to_string(),
                    status: Some(127),
                    stderr: "unexpected command".to_string(),
                })
            }
        };
        Ok(out.into_bytes())
    }

    async fn close(&self) {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}

fn target() -> HostTarget {
    toml::from_str(
        r#"
name = "web-1"
address = "10.0.0.5"
user = "monitor"
"#,
    )
    .unwrap()
}

fn settings(max_connect_attempts: Option<u32>) -> CycleSettings {
    CycleSettings {
        interval: Duration::from_millis(20),
        backoff_initial: Duration::from_millis(5),
        backoff_max: Duration::from_millis(20),
        max_connect_attempts,
        commands: Commands::default(),
    }
}

struct Harness {
    counters: Arc<Counters>,
    events: broadcast::Receiver<HostEvent>,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<Aggregator>,
}

fn start(script: Script, max_connect_attempts: Option<u32>) -> Harness {
    let counters = Arc::new(Counters::default());
    let connector = Arc::new(ScriptedConnector {
        script,
        counters: Arc::clone(&counters),
    });
    let hub = EventHub::with_capacity(4096);
    let events = hub.subscribe();
    let cancel = CancellationToken::new();
    let cycle = HostCycle::new(target(), connector, settings(max_connect_attempts), hub);
    let handle = tokio::spawn(cycle.run(cancel.child_token()));
    Harness {
        counters,
        events,
        cancel,
        handle,
    }
}

/// Receive events until `pred` matches one, failing after a few seconds.
async fn wait_for<F>(events: &mut broadcast::Receiver<HostEvent>, mut pred: F) -> HostEvent
where
    F: FnMut(&HostEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event hub closed"),
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

fn snapshot_with_utilization(event: &HostEvent) -> bool {
    matches!(
        event,
        HostEvent::Snapshot { statistics, .. } if statistics.cpu_utilization.is_available()
    )
}

#[tokio::test]
async fn samples_every_metric_and_derives_cpu_utilization() {
    let mut h = start(Script::default(), None);

    let HostEvent::Snapshot { host, statistics } =
        wait_for(&mut h.events, snapshot_with_utilization).await
    else {
        unreachable!()
    };
    assert_eq!(&*host, "web-1");
    assert_eq!(statistics.cpu_utilization.value(), Some(&40.0));

    h.cancel.cancel();
    let aggregator = h.handle.await.unwrap();
    let stats = aggregator.snapshot();

    assert_eq!(stats.host, "web-1");
    assert_eq!(stats.memory.value().and_then(|m| m.used_kb()), Some(5_000_000));
    assert_eq!(stats.load_average.value().map(|l| l.one), Some(0.42));
    assert_eq!(stats.disk.value().map(|d| d.used_percent), Some(50));
    let network = stats.network.value().expect("network sampled");
    assert_eq!(network.interface("eth0").map(|i| (i.rx_bytes, i.tx_bytes)), Some((1000, 2000)));

    assert_eq!(h.counters.connects.load(Ordering::SeqCst), 1);
    assert_eq!(h.counters.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failing_metric_is_unavailable_while_others_keep_flowing() {
    let script = Script {
        broken_uptime: true,
        ..Script::default()
    };
    let mut h = start(script, None);

    let failed = wait_for(&mut h.events, |e| matches!(e, HostEvent::SampleFailed { .. })).await;
    let HostEvent::SampleFailed { kind, error, .. } = failed else {
        unreachable!()
    };
    assert_eq!(kind, MetricKind::LoadAverage);
    assert!(matches!(error, SampleError::Transport(TransportError::Execution { .. })));

    wait_for(&mut h.events, snapshot_with_utilization).await;
    h.cancel.cancel();
    let aggregator = h.handle.await.unwrap();
    let stats = aggregator.snapshot();

    assert!(matches!(stats.load_average, Reading::Unavailable { .. }));
    assert!(stats.memory.is_available());
    assert!(stats.disk.is_available());
    // An execution failure is not a connection failure.
    assert_eq!(h.counters.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retries_connection_with_backoff() {
    let script = Script {
        failing_connects: 3,
        ..Script::default()
    };
    let mut h = start(script, None);

    wait_for(&mut h.events, |e| {
        matches!(e, HostEvent::StateChanged { state: CycleState::Sampling, .. })
    })
    .await;
    assert_eq!(h.counters.connects.load(Ordering::SeqCst), 4);

    h.cancel.cancel();
    h.handle.await.unwrap();
}

#[tokio::test]
async fn gives_up_after_attempt_budget() {
    let script = Script {
        failing_connects: u32::MAX,
        ..Script::default()
    };
    let mut h = start(script, Some(3));

    wait_for(&mut h.events, |e| {
        matches!(e, HostEvent::StateChanged { state: CycleState::Terminated, .. })
    })
    .await;

    let aggregator = tokio::time::timeout(Duration::from_secs(5), h.handle)
        .await
        .expect("cycle should stop by itself")
        .unwrap();
    assert_eq!(h.counters.connects.load(Ordering::SeqCst), 3);
    assert_eq!(aggregator.snapshot().cpu, Reading::Pending);
}

#[tokio::test]
async fn reconnects_after_losing_the_connection_and_keeps_the_snapshot() {
    let script = Script {
        disconnect_after: Some(12),
        ..Script::default()
    };
    let mut h = start(script, None);

    wait_for(&mut h.events, |e| {
        matches!(
            e,
            HostEvent::SampleFailed { error, .. } if error.is_connection_lost()
        )
    })
    .await;

    // Back to sampling on a second connection.
    wait_for(&mut h.events, |e| {
        matches!(e, HostEvent::StateChanged { state: CycleState::Sampling, .. })
    })
    .await;
    wait_for(&mut h.events, snapshot_with_utilization).await;

    h.cancel.cancel();
    let aggregator = h.handle.await.unwrap();
    assert_eq!(h.counters.connects.load(Ordering::SeqCst), 2);
    assert_eq!(h.counters.closes.load(Ordering::SeqCst), 2);
    assert!(aggregator.snapshot().memory.is_available());
}

#[tokio::test]
async fn lost_connection_does_not_spend_the_attempt_budget() {
    let script = Script {
        disconnect_after: Some(12),
        ..Script::default()
    };
    let mut h = start(script, Some(1));

    wait_for(&mut h.events, |e| {
        matches!(
            e,
            HostEvent::SampleFailed { error, .. } if error.is_connection_lost()
        )
    })
    .await;
    let next = wait_for(&mut h.events, |e| {
        matches!(
            e,
            HostEvent::StateChanged {
                state: CycleState::Sampling | CycleState::Terminated,
                ..
            }
        )
    })
    .await;
    assert!(matches!(
        next,
        HostEvent::StateChanged { state: CycleState::Sampling, .. }
    ));
    assert_eq!(h.counters.connects.load(Ordering::SeqCst), 2);
    assert!(!h.handle.is_finished());

    h.cancel.cancel();
    h.handle.await.unwrap();
}

#[tokio::test]
async fn cancelling_one_host_leaves_another_running() {
    let mut first = start(Script::default(), None);
    let mut second = start(Script::default(), None);

    wait_for(&mut first.events, snapshot_with_utilization).await;
    first.cancel.cancel();
    first.handle.await.unwrap();

    let seen = second.counters.cpu_calls.load(Ordering::SeqCst);
    wait_for(&mut second.events, |e| matches!(e, HostEvent::Snapshot { .. })).await;
    wait_for(&mut second.events, snapshot_with_utilization).await;
    assert!(!second.handle.is_finished());
    assert!(second.counters.cpu_calls.load(Ordering::SeqCst) >= seen);

    second.cancel.cancel();
    second.handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn backoff_delays_double_between_attempts() {
    let script = Script {
        failing_connects: u32::MAX,
        ..Script::default()
    };
    let counters = Arc::new(Counters::default());
    let connector = Arc::new(ScriptedConnector {
        script,
        counters: Arc::clone(&counters),
    });
    let cycle = HostCycle::new(
        target(),
        connector,
        CycleSettings {
            backoff_initial: Duration::from_secs(10),
            backoff_max: Duration::from_secs(15),
            max_connect_attempts: Some(4),
            ..CycleSettings::default()
        },
        EventHub::new(),
    );

    let started = tokio::time::Instant::now();
    cycle.run(CancellationToken::new()).await;

    // 10 s, then 15 s twice (capped), then the fourth failure gives up.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(40) && elapsed < Duration::from_secs(41));
    assert_eq!(counters.connects.load(Ordering::SeqCst), 4);
}
