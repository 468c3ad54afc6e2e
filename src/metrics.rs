//! Prometheus metrics for a disk store.
//!
//! Each store registers its collectors in a private [`Registry`] labelled
//! with the store name, so several stores can live in one process.

use std::collections::HashMap;

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Counters and gauges of one store.
#[derive(Clone)]
pub struct StoreMetrics {
    registry: Registry,

    pub writes: IntCounter,
    pub write_failures: IntCounter,
    pub reads: IntCounter,
    pub read_failures: IntCounter,
    pub fault_races: IntCounter,
    pub memory_demotions: IntCounter,
    pub disk_evictions: IntCounter,
    pub expirations: IntCounter,

    pub memory_resident: IntGauge,
    pub disk_resident: IntGauge,
    pub queue_depth: IntGauge,
}

impl StoreMetrics {
    pub fn new(store: &str) -> Result<Self, prometheus::Error> {
        let labels = HashMap::from([("store".to_string(), store.to_string())]);
        let registry = Registry::new_custom(Some("disk_tier".to_string()), Some(labels))?;

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let writes = counter("writes_total", "Elements written to the data file")?;
        let write_failures = counter("write_failures_total", "Element writes that failed")?;
        let reads = counter("reads_total", "Elements read back from the data file")?;
        let read_failures = counter("read_failures_total", "Reads that failed to decode")?;
        let fault_races = counter(
            "fault_races_total",
            "Completed writes discarded because the placeholder was replaced",
        )?;
        let memory_demotions = counter(
            "memory_demotions_total",
            "Cached copies dropped to enforce the memory capacity",
        )?;
        let disk_evictions = counter(
            "disk_evictions_total",
            "Entries removed to enforce the disk capacity",
        )?;
        let expirations = counter("expirations_total", "Entries removed by expiry")?;

        let gauge = |name: &str, help: &str| -> Result<IntGauge, prometheus::Error> {
            let g = IntGauge::new(name, help)?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };
        let memory_resident = gauge("memory_resident", "Entries holding a value in memory")?;
        let disk_resident = gauge("disk_resident", "Entries with a region in the data file")?;
        let queue_depth = gauge("queue_depth", "Disk tasks queued or running")?;

        Ok(Self {
            registry,
            writes,
            write_failures,
            reads,
            read_failures,
            fault_races,
            memory_demotions,
            disk_evictions,
            expirations,
            memory_resident,
            disk_resident,
            queue_depth,
        })
    }

    /// Text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
