//! Tunnel gauges.
//!
//! One active-connection gauge per device kind and a last-connection
//! timestamp, each labelled by instance namespace and name. Gauges are
//! atomics keyed by label set. An active series is dropped once its last
//! tunnel closes; timestamps are kept.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::device::DeviceKind;

type Labels = (String, String);
type ActiveKey = (DeviceKind, Labels);

/// Counts only change while the map lock is held (read or write), so a
/// series seen at zero under the write lock has no live guard.
type ActiveMap = RwLock<HashMap<ActiveKey, Arc<AtomicI64>>>;

#[derive(Debug, Default)]
pub struct TunnelMetrics {
    active: Arc<ActiveMap>,
    last_connection: RwLock<HashMap<Labels, Arc<AtomicI64>>>,
}

/// Holds one active-tunnel count until dropped.
#[derive(Debug)]
pub struct ActiveConnection {
    series: Arc<ActiveMap>,
    key: ActiveKey,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        let mut series = self.series.write().unwrap_or_else(PoisonError::into_inner);
        let Some(gauge) = series.get(&self.key) else {
            return;
        };
        if gauge.fetch_sub(1, Ordering::AcqRel) <= 1 {
            series.remove(&self.key);
        }
    }
}

impl TunnelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count an active tunnel for `(kind, namespace, name)`.
    pub fn track(&self, kind: DeviceKind, namespace: &str, name: &str) -> ActiveConnection {
        let key = (kind, (namespace.to_owned(), name.to_owned()));
        let counted = self
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .map(|gauge| gauge.fetch_add(1, Ordering::AcqRel))
            .is_some();
        if !counted {
            self.active
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(key.clone())
                .or_default()
                .fetch_add(1, Ordering::AcqRel);
        }
        ActiveConnection {
            series: Arc::clone(&self.active),
            key,
        }
    }

    pub fn active(&self, kind: DeviceKind, namespace: &str, name: &str) -> i64 {
        let key = (kind, (namespace.to_owned(), name.to_owned()));
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .map_or(0, |g| g.load(Ordering::Acquire))
    }

    /// Stamp the current time as the instance's last API connection.
    pub fn record_api_connection(&self, namespace: &str, name: &str) {
        let gauge = gauge_for(
            &self.last_connection,
            (namespace.to_owned(), name.to_owned()),
        );
        gauge.store(chrono::Utc::now().timestamp(), Ordering::Release);
    }

    pub fn last_api_connection(&self, namespace: &str, name: &str) -> Option<i64> {
        self.last_connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(namespace.to_owned(), name.to_owned()))
            .map(|g| g.load(Ordering::Acquire))
    }

    /// Prometheus text exposition of every gauge.
    pub fn render(&self) -> String {
        let mut out = String::new();

        let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
        for kind in DeviceKind::ALL {
            let metric = format!("vmstream_vmi_{}_active_connections", kind.as_str());
            let _ = writeln!(
                out,
                "# HELP {metric} Amount of active {} connections, broken down by namespace and vmi name.",
                kind.as_str()
            );
            let _ = writeln!(out, "# TYPE {metric} gauge");

            let series: BTreeMap<&Labels, i64> = active
                .iter()
                .filter(|((k, _), _)| *k == kind)
                .map(|((_, labels), g)| (labels, g.load(Ordering::Acquire)))
                .collect();
            for ((namespace, name), value) in series {
                let _ = writeln!(out, "{metric}{} {value}", labels(namespace, name));
            }
        }
        drop(active);

        let metric = "vmstream_vmi_last_api_connection_timestamp_seconds";
        let _ = writeln!(
            out,
            "# HELP {metric} Virtual machine last API connection timestamp, including VNC, console, portforward, SSH and usbredir connections."
        );
        let _ = writeln!(out, "# TYPE {metric} gauge");
        let last = self
            .last_connection
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let series: BTreeMap<&Labels, i64> = last
            .iter()
            .map(|(labels, g)| (labels, g.load(Ordering::Acquire)))
            .collect();
        for ((namespace, name), value) in series {
            let _ = writeln!(out, "{metric}{} {value}", labels(namespace, name));
        }

        out
    }
}

fn gauge_for<K>(map: &RwLock<HashMap<K, Arc<AtomicI64>>>, key: K) -> Arc<AtomicI64>
where
    K: std::hash::Hash + Eq,
{
    if let Some(gauge) = map.read().unwrap_or_else(PoisonError::into_inner).get(&key) {
        return Arc::clone(gauge);
    }
    Arc::clone(
        map.write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default(),
    )
}

fn labels(namespace: &str, name: &str) -> String {
    format!(
        "{{namespace=\"{}\",name=\"{}\"}}",
        escape(namespace),
        escape(name)
    )
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_increments_and_decrements() {
        let metrics = TunnelMetrics::new();

        let first = metrics.track(DeviceKind::Vnc, "default", "testvmi");
        let second = metrics.track(DeviceKind::Vnc, "default", "testvmi");
        assert_eq!(metrics.active(DeviceKind::Vnc, "default", "testvmi"), 2);
        assert_eq!(metrics.active(DeviceKind::Console, "default", "testvmi"), 0);

        drop(first);
        assert_eq!(metrics.active(DeviceKind::Vnc, "default", "testvmi"), 1);
        drop(second);
        assert_eq!(metrics.active(DeviceKind::Vnc, "default", "testvmi"), 0);
    }

    #[test]
    fn concurrent_tunnels_commute() {
        let metrics = Arc::new(TunnelMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let _guard = metrics.track(DeviceKind::PortForward, "default", "testvmi");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.active(DeviceKind::PortForward, "default", "testvmi"), 0);
        assert!(metrics.active.read().unwrap().is_empty());
    }

    #[test]
    fn closed_series_leave_the_exposition() {
        let metrics = TunnelMetrics::new();
        let series = "vmstream_vmi_vnc_active_connections{namespace=\"default\",name=\"gone\"}";

        let first = metrics.track(DeviceKind::Vnc, "default", "gone");
        let second = metrics.track(DeviceKind::Vnc, "default", "gone");
        drop(first);
        assert!(metrics.render().contains(&format!("{series} 1")));

        drop(second);
        assert!(!metrics.render().contains(series));
        assert!(metrics.active.read().unwrap().is_empty());

        let _again = metrics.track(DeviceKind::Vnc, "default", "gone");
        assert!(metrics.render().contains(&format!("{series} 1")));
    }

    #[test]
    fn records_last_connection() {
        let metrics = TunnelMetrics::new();
        assert_eq!(metrics.last_api_connection("default", "testvmi"), None);

        metrics.record_api_connection("default", "testvmi");
        let stamp = metrics.last_api_connection("default", "testvmi").unwrap();
        assert!((chrono::Utc::now().timestamp() - stamp).abs() <= 1);
    }

    #[test]
    fn renders_prometheus_text() {
        let metrics = TunnelMetrics::new();
        let _guard = metrics.track(DeviceKind::Console, "default", "testvmi");
        metrics.record_api_connection("default", "testvmi");

        let text = metrics.render();
        assert!(text.contains("# TYPE vmstream_vmi_vnc_active_connections gauge"));
        assert!(text.contains(
            "vmstream_vmi_console_active_connections{namespace=\"default\",name=\"testvmi\"} 1"
        ));
        assert!(text.contains(
            "vmstream_vmi_last_api_connection_timestamp_seconds{namespace=\"default\",name=\"testvmi\"}"
        ));
    }
}
