//! Measurement loop
//!
//! Periodically samples the counters of every tunnel a node carries, turns
//! counter deltas into per-slice throughput, loss and latency readings and
//! publishes them to a [`MeasurementStore`]. The loop runs on its own
//! cancellation token and never touches the agent's apply lock.

use crate::error::{Result, SliceError};
use crate::models::{Measurement, Vni};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One tunnel interface to observe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementTarget {
    pub slice_id: String,
    pub vni: Vni,
    /// Overlay interface, e.g. `vxlan1000`
    pub interface: String,
    /// Underlay address of the tunnel peer
    pub peer: IpAddr,
}

/// Raw counters and latency of one target at one instant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeSample {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub dropped: u64,
    pub latency_ms: Option<f64>,
    pub taken_at: Instant,
}

#[async_trait]
pub trait Probe: Send + Sync {
    async fn sample(&self, target: &MeasurementTarget) -> Result<ProbeSample>;
}

/// Reads `/sys/class/net/<iface>/statistics` and times a TCP connect to the peer
#[derive(Debug, Clone)]
pub struct InterfaceProbe {
    sysfs_root: PathBuf,
    latency_port: u16,
    connect_timeout: Duration,
}

impl Default for InterfaceProbe {
    fn default() -> Self {
        Self::new("/sys/class/net", 22, Duration::from_secs(1))
    }
}

impl InterfaceProbe {
    pub fn new(sysfs_root: impl Into<PathBuf>, latency_port: u16, connect_timeout: Duration) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            latency_port,
            connect_timeout,
        }
    }

    async fn read_counter(&self, interface: &str, name: &str) -> Result<u64> {
        let path = self
            .sysfs_root
            .join(interface)
            .join("statistics")
            .join(name);
        let raw = tokio::fs::read_to_string(&path).await?;
        raw.trim().parse::<u64>().map_err(|e| {
            SliceError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}: {}", path.display(), e),
            ))
        })
    }

    /// Connect time to the peer; a refused connection still measures a round trip
    async fn connect_latency(&self, peer: IpAddr) -> Option<f64> {
        let start = Instant::now();
        let attempt = tokio::time::timeout(
            self.connect_timeout,
            tokio::net::TcpStream::connect(SocketAddr::new(peer, self.latency_port)),
        )
        .await;
        match attempt {
            Ok(Ok(_)) => Some(start.elapsed().as_secs_f64() * 1000.0),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                Some(start.elapsed().as_secs_f64() * 1000.0)
            }
            _ => None,
        }
    }
}

#[async_trait]
impl Probe for InterfaceProbe {
    async fn sample(&self, target: &MeasurementTarget) -> Result<ProbeSample> {
        let iface = target.interface.as_str();
        let tx_bytes = self.read_counter(iface, "tx_bytes").await?;
        let rx_bytes = self.read_counter(iface, "rx_bytes").await?;
        let tx_packets = self.read_counter(iface, "tx_packets").await?;
        let rx_packets = self.read_counter(iface, "rx_packets").await?;
        let tx_dropped = self.read_counter(iface, "tx_dropped").await?;
        let rx_dropped = self.read_counter(iface, "rx_dropped").await?;
        let latency_ms = self.connect_latency(target.peer).await;
        Ok(ProbeSample {
            tx_bytes,
            rx_bytes,
            tx_packets,
            rx_packets,
            dropped: tx_dropped.saturating_add(rx_dropped),
            latency_ms,
            taken_at: Instant::now(),
        })
    }
}

/// Targets to probe and the latest reading per slice
pub struct MeasurementStore {
    node: String,
    targets: DashMap<Vni, MeasurementTarget>,
    latest: DashMap<String, Measurement>,
}

impl MeasurementStore {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            targets: DashMap::new(),
            latest: DashMap::new(),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn register(&self, target: MeasurementTarget) {
        debug!(vni = target.vni, slice_id = %target.slice_id, "Registering measurement target");
        self.targets.insert(target.vni, target);
    }

    /// Stop probing a tunnel; the slice's reading goes once it has no targets left
    pub fn unregister(&self, vni: Vni) -> Option<MeasurementTarget> {
        let removed = self.targets.remove(&vni).map(|(_, t)| t)?;
        let still_probed = self
            .targets
            .iter()
            .any(|t| t.slice_id == removed.slice_id);
        if !still_probed {
            self.latest.remove(&removed.slice_id);
        }
        Some(removed)
    }

    /// Targets sorted by VNI
    pub fn targets(&self) -> Vec<MeasurementTarget> {
        let mut targets: Vec<_> = self.targets.iter().map(|t| t.value().clone()).collect();
        targets.sort_by_key(|t| t.vni);
        targets
    }

    pub fn publish(&self, measurement: Measurement) {
        self.latest
            .insert(measurement.slice_id.clone(), measurement);
    }

    /// Latest readings sorted by slice id
    pub fn snapshot(&self) -> Vec<Measurement> {
        let mut out: Vec<_> = self.latest.iter().map(|m| m.value().clone()).collect();
        out.sort_by(|a, b| a.slice_id.cmp(&b.slice_id));
        out
    }
}

/// Configuration for the measurement loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementConfig {
    /// Base sampling interval in seconds (default: 10)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Maximum jitter added to each interval in milliseconds (default: 1000)
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    /// Channel buffer for published readings
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_interval_secs() -> u64 {
    10
}

fn default_jitter_ms() -> u64 {
    1000
}

fn default_buffer_size() -> usize {
    256
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            jitter_ms: default_jitter_ms(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl MeasurementConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Default)]
struct SliceAggregate {
    throughput_mbps: f64,
    latency_ms: Option<f64>,
    lost: u64,
    total: u64,
}

/// Samples every registered target on a jittered interval
pub struct MeasurementLoop {
    store: Arc<MeasurementStore>,
    probe: Arc<dyn Probe>,
    config: MeasurementConfig,
    previous: HashMap<Vni, ProbeSample>,
    last_latency: HashMap<Vni, f64>,
    tx: Option<mpsc::Sender<Measurement>>,
}

impl MeasurementLoop {
    pub fn new(store: Arc<MeasurementStore>, probe: Arc<dyn Probe>, config: MeasurementConfig) -> Self {
        Self {
            store,
            probe,
            config,
            previous: HashMap::new(),
            last_latency: HashMap::new(),
            tx: None,
        }
    }

    /// Also forward every published reading on a channel
    pub fn with_channel(mut self) -> (Self, mpsc::Receiver<Measurement>) {
        let (tx, rx) = mpsc::channel(self.config.buffer_size.max(1));
        self.tx = Some(tx);
        (self, rx)
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            node = %self.store.node(),
            interval_secs = self.config.interval_secs,
            "Starting measurement loop"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.next_delay()) => {
                    let published = self.tick().await;
                    debug!(node = %self.store.node(), slices = published, "Measurement cycle complete");
                }
                _ = cancel.cancelled() => {
                    info!(node = %self.store.node(), "Shutting down measurement loop");
                    break;
                }
            }
        }
    }

    fn next_delay(&self) -> Duration {
        self.config.interval() + Duration::from_millis(rand_jitter(self.config.jitter_ms))
    }

    /// Sample all targets once and publish per-slice readings; returns slices published
    pub async fn tick(&mut self) -> usize {
        let targets = self.store.targets();
        self.previous
            .retain(|vni, _| targets.iter().any(|t| t.vni == *vni));
        self.last_latency
            .retain(|vni, _| targets.iter().any(|t| t.vni == *vni));

        let mut per_slice: BTreeMap<String, SliceAggregate> = BTreeMap::new();
        for target in &targets {
            let sample = match self.probe.sample(target).await {
                Ok(sample) => sample,
                Err(e) => {
                    warn!(vni = target.vni, interface = %target.interface, error = %e, "Probe failed");
                    continue;
                }
            };
            if let Some(latency) = sample.latency_ms {
                self.last_latency.insert(target.vni, latency);
            }
            let Some(prev) = self.previous.insert(target.vni, sample) else {
                continue;
            };

            let elapsed = sample
                .taken_at
                .saturating_duration_since(prev.taken_at)
                .as_secs_f64();
            if elapsed <= 0.0 {
                continue;
            }
            let bytes = (sample.tx_bytes + sample.rx_bytes)
                .saturating_sub(prev.tx_bytes + prev.rx_bytes);
            let packets = (sample.tx_packets + sample.rx_packets)
                .saturating_sub(prev.tx_packets + prev.rx_packets);
            let dropped = sample.dropped.saturating_sub(prev.dropped);

            let agg = per_slice.entry(target.slice_id.clone()).or_default();
            agg.throughput_mbps += bytes as f64 * 8.0 / elapsed / 1_000_000.0;
            agg.lost += dropped;
            agg.total += packets + dropped;
            if let Some(latency) = self.last_latency.get(&target.vni) {
                agg.latency_ms = Some(agg.latency_ms.map_or(*latency, |l: f64| l.max(*latency)));
            }
        }

        let observed_at = chrono::Utc::now().timestamp();
        let count = per_slice.len();
        for (slice_id, agg) in per_slice {
            let measurement = Measurement {
                slice_id,
                node: self.store.node().to_string(),
                throughput_mbps: agg.throughput_mbps,
                latency_ms: agg.latency_ms.unwrap_or(0.0),
                loss_rate: if agg.total > 0 {
                    agg.lost as f64 / agg.total as f64
                } else {
                    0.0
                },
                observed_at,
            };
            self.store.publish(measurement.clone());
            if let Some(tx) = &self.tx {
                if let Err(e) = tx.try_send(measurement) {
                    debug!(error = %e, "Measurement channel full or closed");
                }
            }
        }
        count
    }
}

/// Generate a jitter value between 0 and max_ms
fn rand_jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    now % max_ms
}
