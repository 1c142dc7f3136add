//! Recovery analysis across before / during / after snapshots

use crate::config::ToleranceSettings;
use crate::models::{MetricAnalysis, MetricSnapshot};
use std::collections::BTreeMap;

#[derive(Clone, Copy)]
enum Tolerance {
    /// Absolute difference allowed
    Points(f64),
    /// Fraction of the baseline allowed
    Ratio(f64),
}

impl Tolerance {
    fn accepts(self, before: f64, after: f64) -> bool {
        let delta = (after - before).abs();
        match self {
            Tolerance::Points(points) => delta <= points,
            Tolerance::Ratio(ratio) => delta <= ratio * before.abs(),
        }
    }
}

type Extract = fn(&MetricSnapshot) -> Option<f64>;

fn metrics(tolerance: &ToleranceSettings) -> [(&'static str, Extract, Tolerance); 4] {
    [
        ("cpu_percent", |s: &MetricSnapshot| s.cpu_percent, Tolerance::Points(tolerance.cpu_points)),
        ("memory_percent", |s: &MetricSnapshot| s.memory_percent, Tolerance::Points(tolerance.memory_points)),
        ("disk_read_bytes", |s: &MetricSnapshot| s.disk_read_bytes.map(|v| v as f64), Tolerance::Ratio(tolerance.disk_ratio)),
        ("disk_write_bytes", |s: &MetricSnapshot| s.disk_write_bytes.map(|v| v as f64), Tolerance::Ratio(tolerance.disk_ratio)),
    ]
}

/// Per-metric `{before, peak_during, after, change_during, recovered}`
///
/// `recovered` requires both a baseline and a post value; missing data never
/// counts as recovered.
pub fn analyze(
    before: Option<&MetricSnapshot>,
    during: &[MetricSnapshot],
    after: Option<&MetricSnapshot>,
    tolerance: &ToleranceSettings,
) -> BTreeMap<String, MetricAnalysis> {
    metrics(tolerance)
        .into_iter()
        .map(|(name, extract, tol)| {
            let before_value = before.and_then(extract);
            let after_value = after.and_then(extract);
            let peak_during = during.iter().filter_map(extract).fold(None, |peak: Option<f64>, v| {
                Some(peak.map_or(v, |p| p.max(v)))
            });
            let change_during = match (before_value, peak_during) {
                (Some(b), Some(p)) => Some(p - b),
                _ => None,
            };
            let recovered = match (before_value, after_value) {
                (Some(b), Some(a)) => tol.accepts(b, a),
                _ => false,
            };
            let analysis = MetricAnalysis { before: before_value, peak_during, after: after_value, change_during, recovered };
            (name.to_string(), analysis)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetricReading;

    fn snap(label: &str, cpu: Option<f64>, mem: Option<f64>, read: Option<u64>) -> MetricSnapshot {
        MetricReading { cpu_percent: cpu, memory_percent: mem, disk_read_bytes: read, disk_write_bytes: None }
            .into_snapshot(label)
    }

    #[test]
    fn test_recovered_within_tolerance() {
        let before = snap("before", Some(20.0), Some(40.0), Some(1000));
        let during = vec![snap("during_0", Some(80.0), Some(60.0), Some(5000)), snap("during_1", Some(95.0), None, None)];
        let after = snap("after", Some(24.0), Some(55.0), Some(1050));

        let result = analyze(Some(&before), &during, Some(&after), &ToleranceSettings::default());

        let cpu = &result["cpu_percent"];
        assert_eq!(cpu.peak_during, Some(95.0));
        assert_eq!(cpu.change_during, Some(75.0));
        assert!(cpu.recovered);

        // 15 points away from baseline, tolerance is 10
        assert!(!result["memory_percent"].recovered);
        assert!(result["disk_read_bytes"].recovered);
        assert!(!result["disk_write_bytes"].recovered);
        assert_eq!(result["disk_write_bytes"].before, None);
    }

    #[test]
    fn test_missing_after_is_not_recovered() {
        let before = snap("before", Some(20.0), Some(40.0), None);
        let result = analyze(Some(&before), &[], None, &ToleranceSettings::default());
        assert!(!result["cpu_percent"].recovered);
        assert_eq!(result["cpu_percent"].peak_during, None);
        assert_eq!(result["cpu_percent"].change_during, None);
    }

    #[test]
    fn test_degraded_samples_are_ignored_for_peak() {
        let during = vec![MetricSnapshot::degraded("during_0", "unreachable"), snap("during_1", Some(30.0), None, None)];
        let result = analyze(None, &during, None, &ToleranceSettings::default());
        assert_eq!(result["cpu_percent"].peak_during, Some(30.0));
    }
}
