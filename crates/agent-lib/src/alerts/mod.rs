//! Alert rules with per-rule cooldown
//!
//! Three rule kinds: metric thresholds evaluated against fresh samples,
//! anomaly rules triggered by persisted anomaly events, and forecast
//! rules triggered by forecast-breach events. Every rule walks
//! Armed -> Firing -> Cooling -> Armed; cooldown state is in-memory
//! only, so all rules re-arm on process restart.

use crate::config::ThresholdConfig;
use crate::models::{Event, EventKind, Notification, Sample, Severity};
use std::collections::HashMap;
use tracing::{debug, info};

/// Forecast rules fire when the breach ETA is inside this window.
pub const DEFAULT_MIN_ETA_SECS: f64 = 86_400.0;

/// Anomaly rules fire for any score at or above this.
pub const DEFAULT_MIN_ANOMALY_SCORE: f64 = 0.0;

/// Delivery seam for fired notifications. Fire-and-forget: failures are
/// the notifier's problem and never affect ingestion.
pub trait Notifier: Send {
    fn notify(&self, notification: &Notification);
}

impl<N: Notifier + Send + Sync> Notifier for std::sync::Arc<N> {
    fn notify(&self, notification: &Notification) {
        (**self).notify(notification);
    }
}

/// Severity-colored stderr notifier, the default local delivery channel.
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, notification: &Notification) {
        let color = match notification.severity {
            Severity::Critical => "\x1b[91m",
            Severity::Warning => "\x1b[93m",
            Severity::Info => "\x1b[92m",
        };
        eprintln!(
            "{color}[{}] {}: {}\x1b[0m",
            notification.severity.as_str().to_uppercase(),
            notification.title,
            notification.body
        );
    }
}

/// Threshold comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdOp {
    Gt,
    Gte,
}

impl ThresholdOp {
    pub fn check(&self, actual: f64, value: f64) -> bool {
        match self {
            ThresholdOp::Gt => actual > value,
            ThresholdOp::Gte => actual >= value,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            ThresholdOp::Gt => ">",
            ThresholdOp::Gte => ">=",
        }
    }
}

/// What a rule watches.
#[derive(Debug, Clone)]
pub enum RuleKind {
    Threshold {
        metric: String,
        op: ThresholdOp,
        value: f64,
    },
    Anomaly {
        min_score: f64,
    },
    Forecast {
        min_eta_secs: f64,
    },
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub severity: Severity,
    pub kind: RuleKind,
}

/// Cooldown state machine. `Firing` is instantaneous: a rule fires and
/// immediately enters `Cooling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleState {
    Armed,
    Cooling { until: i64 },
}

/// One rule firing: the notification to deliver, plus the threshold
/// event to persist when the trigger was a raw sample (event-triggered
/// rules already reference their source event).
#[derive(Debug, Clone)]
pub struct Firing {
    pub rule: String,
    pub notification: Notification,
    pub event: Option<Event>,
}

pub struct RuleEngine {
    rules: Vec<Rule>,
    cooldown_secs: i64,
    states: HashMap<String, RuleState>,
}

impl RuleEngine {
    pub fn new(cooldown_secs: u64) -> Self {
        Self {
            rules: Vec::new(),
            cooldown_secs: cooldown_secs as i64,
            states: HashMap::new(),
        }
    }

    /// Engine with the built-in rule set for the configured thresholds.
    pub fn with_default_rules(thresholds: &ThresholdConfig, cooldown_secs: u64) -> Self {
        let mut engine = Self::new(cooldown_secs);
        engine.add_rule(Rule {
            name: "cpu_high".to_string(),
            severity: Severity::Warning,
            kind: RuleKind::Threshold {
                metric: "cpu_pct".to_string(),
                op: ThresholdOp::Gte,
                value: thresholds.cpu_pct,
            },
        });
        engine.add_rule(Rule {
            name: "mem_high".to_string(),
            severity: Severity::Warning,
            kind: RuleKind::Threshold {
                metric: "mem_pct".to_string(),
                op: ThresholdOp::Gte,
                value: thresholds.mem_pct,
            },
        });
        engine.add_rule(Rule {
            name: "swap_high".to_string(),
            severity: Severity::Warning,
            kind: RuleKind::Threshold {
                metric: "swap_pct".to_string(),
                op: ThresholdOp::Gte,
                value: thresholds.swap_pct,
            },
        });
        engine.add_rule(Rule {
            name: "anomaly_detected".to_string(),
            severity: Severity::Critical,
            kind: RuleKind::Anomaly {
                min_score: DEFAULT_MIN_ANOMALY_SCORE,
            },
        });
        engine.add_rule(Rule {
            name: "forecast_breach".to_string(),
            severity: Severity::Warning,
            kind: RuleKind::Forecast {
                min_eta_secs: DEFAULT_MIN_ETA_SECS,
            },
        });
        engine
    }

    pub fn add_rule(&mut self, rule: Rule) {
        self.states.insert(rule.name.clone(), RuleState::Armed);
        self.rules.push(rule);
    }

    /// Evaluate threshold rules against a fresh sample.
    pub fn evaluate_sample(&mut self, sample: &Sample, now: i64) -> Vec<Firing> {
        let mut firings = Vec::new();
        for i in 0..self.rules.len() {
            let RuleKind::Threshold { metric, op, value } = &self.rules[i].kind else {
                continue;
            };
            let Some(actual) = sample.metric(metric) else {
                continue;
            };
            if !op.check(actual, *value) {
                continue;
            }
            let (metric, op, value) = (metric.clone(), *op, *value);
            if !self.arm_check(i, now) {
                continue;
            }

            let rule = &self.rules[i];
            let body = format!(
                "{metric} at {actual:.1} crossed {} {value:.1} on {}",
                op.symbol(),
                sample.host
            );
            let event = Event::new(
                sample.ts,
                EventKind::Threshold,
                Some(actual),
                &[metric.clone()],
                body.clone(),
            );
            firings.push(Firing {
                rule: rule.name.clone(),
                notification: Notification {
                    severity: rule.severity,
                    title: rule.name.clone(),
                    body,
                    source_event_id: None,
                },
                event: Some(event),
            });
            info!(rule = %rule.name, metric = %metric, actual, "threshold rule fired");
        }
        firings
    }

    /// Evaluate anomaly and forecast rules against a newly written event.
    pub fn evaluate_event(&mut self, event: &Event, now: i64) -> Vec<Firing> {
        let mut firings = Vec::new();
        for i in 0..self.rules.len() {
            let matched = match (&self.rules[i].kind, event.kind) {
                (RuleKind::Anomaly { min_score }, EventKind::Anomaly) => {
                    event.score.unwrap_or(0.0) >= *min_score
                }
                (RuleKind::Forecast { min_eta_secs }, EventKind::ForecastBreach) => {
                    event.score.unwrap_or(f64::INFINITY) <= *min_eta_secs
                }
                _ => false,
            };
            if !matched || !self.arm_check(i, now) {
                continue;
            }

            let rule = &self.rules[i];
            firings.push(Firing {
                rule: rule.name.clone(),
                notification: Notification {
                    severity: rule.severity,
                    title: rule.name.clone(),
                    body: if event.explanation.is_empty() {
                        format!("{} event on {}", event.kind.as_str(), event.metric_tags)
                    } else {
                        event.explanation.clone()
                    },
                    source_event_id: event.id,
                },
                event: None,
            });
            info!(rule = %rule.name, event_id = ?event.id, "event rule fired");
        }
        firings
    }

    /// Advance the rule's state machine; true when the rule may fire now
    /// (and is then moved into Cooling).
    fn arm_check(&mut self, rule_index: usize, now: i64) -> bool {
        let name = self.rules[rule_index].name.clone();
        let state = self.states.entry(name).or_insert(RuleState::Armed);
        match *state {
            RuleState::Cooling { until } if now < until => {
                debug!(rule = %self.rules[rule_index].name, until, "rule cooling, muted");
                false
            }
            _ => {
                *state = RuleState::Cooling {
                    until: now + self.cooldown_secs,
                };
                true
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_sample(ts: i64, cpu: f64) -> Sample {
        Sample {
            ts,
            host: "test".to_string(),
            cpu_pct: cpu,
            mem_pct: 10.0,
            swap_pct: 0.0,
            disk_read_bps: 0.0,
            disk_write_bps: 0.0,
            net_up_bps: 0.0,
            net_down_bps: 0.0,
            proc_count: 10,
            cpu_temp: None,
        }
    }

    fn cpu_rule(cooldown: u64) -> RuleEngine {
        let mut engine = RuleEngine::new(cooldown);
        engine.add_rule(Rule {
            name: "cpu_high".to_string(),
            severity: Severity::Warning,
            kind: RuleKind::Threshold {
                metric: "cpu_pct".to_string(),
                op: ThresholdOp::Gt,
                value: 90.0,
            },
        });
        engine
    }

    // cpu > 90 with a 60 s cooldown: 95 at t=0 fires, 96 at t=30 is
    // muted, 95 at t=61 fires again.
    #[test]
    fn test_cooldown_mutes_refire() {
        let mut engine = cpu_rule(60);

        let at_0 = engine.evaluate_sample(&cpu_sample(0, 95.0), 0);
        let at_30 = engine.evaluate_sample(&cpu_sample(30, 96.0), 30);
        let at_61 = engine.evaluate_sample(&cpu_sample(61, 95.0), 61);

        assert_eq!(at_0.len(), 1);
        assert!(at_30.is_empty());
        assert_eq!(at_61.len(), 1);
    }

    #[test]
    fn test_below_threshold_never_fires() {
        let mut engine = cpu_rule(60);
        for t in 0..100 {
            assert!(engine.evaluate_sample(&cpu_sample(t, 50.0), t).is_empty());
        }
    }

    // At most one firing per rule in any window of cooldown length.
    #[test]
    fn test_at_most_one_firing_per_cooldown_window() {
        let cooldown = 300i64;
        let mut engine = cpu_rule(cooldown as u64);
        let mut fired_at = Vec::new();
        for t in 0..2000 {
            if !engine.evaluate_sample(&cpu_sample(t, 99.0), t).is_empty() {
                fired_at.push(t);
            }
        }
        assert!(!fired_at.is_empty());
        for pair in fired_at.windows(2) {
            assert!(pair[1] - pair[0] >= cooldown, "firings {pair:?} too close");
        }
    }

    #[test]
    fn test_threshold_firing_carries_event() {
        let mut engine = cpu_rule(60);
        let firings = engine.evaluate_sample(&cpu_sample(5, 95.0), 5);
        let event = firings[0].event.as_ref().unwrap();
        assert_eq!(event.kind, EventKind::Threshold);
        assert_eq!(event.metric_tags, "cpu_pct");
        assert_eq!(event.score, Some(95.0));
        assert!(firings[0].notification.body.contains("cpu_pct"));
    }

    #[test]
    fn test_anomaly_rule_min_score() {
        let mut engine = RuleEngine::new(0);
        engine.add_rule(Rule {
            name: "anomaly_detected".to_string(),
            severity: Severity::Critical,
            kind: RuleKind::Anomaly { min_score: 0.6 },
        });

        let mut low = Event::new(10, EventKind::Anomaly, Some(0.5), &[], "low".to_string());
        low.id = Some(1);
        let mut high = Event::new(11, EventKind::Anomaly, Some(0.7), &[], "high".to_string());
        high.id = Some(2);

        assert!(engine.evaluate_event(&low, 10).is_empty());
        let firings = engine.evaluate_event(&high, 11);
        assert_eq!(firings.len(), 1);
        assert_eq!(firings[0].notification.source_event_id, Some(2));
        assert_eq!(firings[0].notification.severity, Severity::Critical);
    }

    #[test]
    fn test_forecast_rule_eta_window() {
        let mut engine = RuleEngine::new(0);
        engine.add_rule(Rule {
            name: "forecast_breach".to_string(),
            severity: Severity::Warning,
            kind: RuleKind::Forecast {
                min_eta_secs: 3600.0,
            },
        });

        let soon = Event::new(
            0,
            EventKind::ForecastBreach,
            Some(1800.0),
            &["mem_pct".to_string()],
            String::new(),
        );
        let far = Event::new(
            1,
            EventKind::ForecastBreach,
            Some(7200.0),
            &["mem_pct".to_string()],
            String::new(),
        );

        assert_eq!(engine.evaluate_event(&soon, 0).len(), 1);
        assert!(engine.evaluate_event(&far, 1).is_empty());
    }

    #[test]
    fn test_rules_cool_down_independently() {
        let mut engine = RuleEngine::with_default_rules(&ThresholdConfig::default(), 300);
        let mut sample = cpu_sample(0, 95.0);
        sample.mem_pct = 95.0;

        let firings = engine.evaluate_sample(&sample, 0);
        let names: Vec<&str> = firings.iter().map(|f| f.rule.as_str()).collect();
        assert!(names.contains(&"cpu_high"));
        assert!(names.contains(&"mem_high"));
        assert!(!names.contains(&"swap_high"));

        // An anomaly event still fires: its rule has its own state.
        let mut event = Event::new(1, EventKind::Anomaly, Some(0.9), &[], String::new());
        event.id = Some(7);
        assert_eq!(engine.evaluate_event(&event, 1).len(), 1);
    }
}
