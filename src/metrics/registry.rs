//! In-process metric registry with Prometheus text exposition.
//!
//! Series are keyed by instrument name and a sorted label set. Rendering
//! goes through [`Metric`] / [`MetricValue`], one `# HELP` / `# TYPE` block
//! per instrument.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, LazyLock, Mutex};

/// Upper bounds, in seconds, of the duration histogram buckets.
pub const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

static GLOBAL: LazyLock<Arc<Registry>> = LazyLock::new(|| Arc::new(Registry::new()));

/// The process-wide registry.
pub fn global() -> Arc<Registry> {
    Arc::clone(&GLOBAL)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        })
    }
}

/// A named, described series family.
#[derive(Debug, Clone, Copy)]
pub struct Instrument {
    pub name: &'static str,
    pub help: &'static str,
    pub metric_type: MetricType,
}

impl Instrument {
    pub const fn counter(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            metric_type: MetricType::Counter,
        }
    }

    pub const fn gauge(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            metric_type: MetricType::Gauge,
        }
    }

    pub const fn histogram(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            metric_type: MetricType::Histogram,
        }
    }
}

/// One exposition line, minus the metric name.
pub struct MetricValue {
    pub name_postfix: Option<&'static str>,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

impl MetricValue {
    pub fn from_value(value: f64) -> Self {
        Self {
            name_postfix: None,
            labels: BTreeMap::new(),
            value,
        }
    }

    pub fn with_name_postfix(mut self, postfix: &'static str) -> Self {
        self.name_postfix = Some(postfix);
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(postfix) = self.name_postfix {
            f.write_str(postfix)?;
        }

        if !self.labels.is_empty() {
            let labels: Vec<String> = self
                .labels
                .iter()
                .map(|(key, value)| format!("{}=\"{}\"", key, escape_label(value)))
                .collect();
            write!(f, "{{{}}}", labels.join(","))?;
        }

        if self.value.is_infinite() {
            write!(f, " {}", if self.value > 0.0 { "+Inf" } else { "-Inf" })
        } else {
            write!(f, " {}", self.value)
        }
    }
}

/// A rendered instrument with all of its series.
pub struct Metric {
    pub name: &'static str,
    pub description: &'static str,
    pub metric_type: MetricType,
    pub values: Vec<MetricValue>,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# HELP {} {}", self.name, self.description)?;
        writeln!(f, "# TYPE {} {}", self.name, self.metric_type)?;
        for value in &self.values {
            writeln!(f, "{}{}", self.name, value)?;
        }
        Ok(())
    }
}

type LabelSet = Vec<(String, String)>;

#[derive(Debug, Clone)]
enum Series {
    Value(f64),
    Histogram {
        buckets: Vec<u64>,
        sum: f64,
        count: u64,
    },
}

struct Family {
    instrument: Instrument,
    series: BTreeMap<LabelSet, Series>,
}

fn label_set(labels: &[(&str, &str)]) -> LabelSet {
    let mut set: LabelSet = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    set.sort();
    set
}

/// Thread-safe store of counters, gauges and histograms.
#[derive(Default)]
pub struct Registry {
    families: Mutex<BTreeMap<&'static str, Family>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, instrument: &Instrument, labels: &[(&str, &str)], f: impl FnOnce(&mut Series)) {
        let mut families = self
            .families
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let family = families.entry(instrument.name).or_insert_with(|| Family {
            instrument: *instrument,
            series: BTreeMap::new(),
        });
        let series = family
            .series
            .entry(label_set(labels))
            .or_insert_with(|| match instrument.metric_type {
                MetricType::Histogram => Series::Histogram {
                    buckets: vec![0; DURATION_BUCKETS.len()],
                    sum: 0.0,
                    count: 0,
                },
                MetricType::Counter | MetricType::Gauge => Series::Value(0.0),
            });
        f(series);
    }

    /// Add one to a counter.
    pub fn increment(&self, instrument: &Instrument, labels: &[(&str, &str)]) {
        self.update(instrument, labels, |series| {
            if let Series::Value(v) = series {
                *v += 1.0;
            }
        });
    }

    pub fn set_gauge(&self, instrument: &Instrument, labels: &[(&str, &str)], value: f64) {
        self.update(instrument, labels, |series| {
            if let Series::Value(v) = series {
                *v = value;
            }
        });
    }

    /// Record one observation into a histogram.
    pub fn observe(&self, instrument: &Instrument, labels: &[(&str, &str)], value: f64) {
        self.update(instrument, labels, |series| {
            if let Series::Histogram {
                buckets,
                sum,
                count,
            } = series
            {
                for (bucket, bound) in buckets.iter_mut().zip(DURATION_BUCKETS) {
                    if value <= *bound {
                        *bucket += 1;
                    }
                }
                *sum += value;
                *count += 1;
            }
        });
    }

    /// Current counter or gauge value, or a histogram's observation count.
    pub fn value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let families = self
            .families
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        families
            .get(name)?
            .series
            .get(&label_set(labels))
            .map(|series| match series {
                Series::Value(v) => *v,
                Series::Histogram { count, .. } => *count as f64,
            })
    }

    /// Snapshot every family as renderable metrics.
    pub fn snapshot(&self) -> Vec<Metric> {
        let families = self
            .families
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        families.values().map(Family::to_metric).collect()
    }

    /// Prometheus text exposition of every series.
    pub fn render(&self) -> String {
        self.snapshot()
            .iter()
            .map(|metric| metric.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Family {
    fn to_metric(&self) -> Metric {
        let mut values = Vec::new();
        for (labels, series) in &self.series {
            let base = || {
                labels
                    .iter()
                    .fold(MetricValue::from_value(0.0), |v, (key, value)| {
                        v.with_label(key, value)
                    })
            };
            match series {
                Series::Value(v) => values.push(MetricValue { value: *v, ..base() }),
                Series::Histogram {
                    buckets,
                    sum,
                    count,
                } => {
                    for (bound, hits) in DURATION_BUCKETS.iter().zip(buckets) {
                        values.push(
                            MetricValue {
                                value: *hits as f64,
                                ..base()
                            }
                            .with_name_postfix("_bucket")
                            .with_label("le", &bound.to_string()),
                        );
                    }
                    values.push(
                        MetricValue {
                            value: *count as f64,
                            ..base()
                        }
                        .with_name_postfix("_bucket")
                        .with_label("le", "+Inf"),
                    );
                    values.push(
                        MetricValue { value: *sum, ..base() }.with_name_postfix("_sum"),
                    );
                    values.push(
                        MetricValue {
                            value: *count as f64,
                            ..base()
                        }
                        .with_name_postfix("_count"),
                    );
                }
            }
        }
        Metric {
            name: self.instrument.name,
            description: self.instrument.help,
            metric_type: self.instrument.metric_type,
            values,
        }
    }
}
