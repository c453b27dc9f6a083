//! Per-request results reporting

use crate::customrule::CustomRuleAction;
use crate::{Decision, WafError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;

/// Receives the outcome of evaluating one request
pub trait ResultsLogger: Send + Sync {
    fn field_bytes_limit_exceeded(&self, limit: usize);
    fn pausable_bytes_limit_exceeded(&self, limit: usize);
    fn total_bytes_limit_exceeded(&self, limit: usize);
    fn total_full_raw_request_body_limit_exceeded(&self, limit: usize);
    fn body_parse_error(&self, err: &WafError);
    fn header_parse_error(&self, err: &WafError);
    fn secrule_triggered(&self, rule_id: i64, decision: Decision, msg: &str, log_data: &str, ruleset_id: &str);
    fn custom_rule_triggered(&self, rule_name: &str, priority: i64, action: CustomRuleAction);
    /// `client_ip` is the listed address that blocked the request
    fn ip_reputation_triggered(&self, client_ip: IpAddr);
}

/// One results record, serialized as a JSON line
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ResultRecord<'a> {
    BytesLimitExceeded {
        time: DateTime<Utc>,
        kind: &'static str,
        limit: usize,
        message: String,
    },
    ParseError {
        time: DateTime<Utc>,
        stage: &'static str,
        error: String,
    },
    RuleTriggered {
        time: DateTime<Utc>,
        rule_id: i64,
        decision: Decision,
        message: &'a str,
        details: &'a str,
        ruleset_id: &'a str,
    },
    CustomRuleTriggered {
        time: DateTime<Utc>,
        rule_name: &'a str,
        priority: i64,
        action: CustomRuleAction,
    },
    IpReputationTriggered {
        time: DateTime<Utc>,
        client_ip: IpAddr,
        message: &'static str,
    },
}

/// Writes JSON result lines through `tracing` under the `azwaf::results` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingResultsLogger;

impl TracingResultsLogger {
    fn emit(&self, record: &ResultRecord<'_>) {
        match serde_json::to_string(record) {
            Ok(line) => tracing::info!(target: "azwaf::results", "{line}"),
            Err(e) => tracing::error!(error = %e, "Failed to serialize results record"),
        }
    }

    fn limit(&self, kind: &'static str, limit: usize, message: String) {
        self.emit(&ResultRecord::BytesLimitExceeded {
            time: Utc::now(),
            kind,
            limit,
            message,
        });
    }

    fn parse_error(&self, stage: &'static str, err: &WafError) {
        self.emit(&ResultRecord::ParseError {
            time: Utc::now(),
            stage,
            error: err.to_string(),
        });
    }
}

impl ResultsLogger for TracingResultsLogger {
    fn field_bytes_limit_exceeded(&self, limit: usize) {
        self.limit("field", limit, format!("Request body contained a field longer than the limit ({limit} bytes)"));
    }

    fn pausable_bytes_limit_exceeded(&self, limit: usize) {
        self.limit(
            "pausable",
            limit,
            format!("Request body length (excluding file upload fields) exceeded the limit ({limit} bytes)"),
        );
    }

    fn total_bytes_limit_exceeded(&self, limit: usize) {
        self.limit("total", limit, format!("Request body length exceeded the limit ({limit} bytes)"));
    }

    fn total_full_raw_request_body_limit_exceeded(&self, limit: usize) {
        self.limit(
            "total_full_raw_request_body",
            limit,
            format!(
                "Request body length exceeded the limit ({limit} bytes) while scanning the entire request body as a single field"
            ),
        );
    }

    fn body_parse_error(&self, err: &WafError) {
        self.parse_error("body", err);
    }

    fn header_parse_error(&self, err: &WafError) {
        self.parse_error("headers", err);
    }

    fn secrule_triggered(&self, rule_id: i64, decision: Decision, msg: &str, log_data: &str, ruleset_id: &str) {
        self.emit(&ResultRecord::RuleTriggered {
            time: Utc::now(),
            rule_id,
            decision,
            message: msg,
            details: log_data,
            ruleset_id,
        });
    }

    fn custom_rule_triggered(&self, rule_name: &str, priority: i64, action: CustomRuleAction) {
        self.emit(&ResultRecord::CustomRuleTriggered {
            time: Utc::now(),
            rule_name,
            priority,
            action,
        });
    }

    fn ip_reputation_triggered(&self, client_ip: IpAddr) {
        self.emit(&ResultRecord::IpReputationTriggered {
            time: Utc::now(),
            client_ip,
            message: "Request blocked by the IP reputation list",
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Event {
        LimitExceeded(&'static str, usize),
        BodyParseError(String),
        HeaderParseError(String),
        SecRule { rule_id: i64, decision: Decision, msg: String },
        CustomRule(String, CustomRuleAction),
        IpReputation(String),
    }

    /// Keeps every result in memory
    #[derive(Debug, Default)]
    pub(crate) struct RecordingLogger {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingLogger {
        fn push(&self, e: Event) {
            self.events.lock().unwrap().push(e);
        }

        pub(crate) fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        pub(crate) fn secrule_ids(&self) -> Vec<i64> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    Event::SecRule { rule_id, .. } => Some(rule_id),
                    _ => None,
                })
                .collect()
        }

        pub(crate) fn custom_rule_names(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    Event::CustomRule(name, _) => Some(name),
                    _ => None,
                })
                .collect()
        }
    }

    impl ResultsLogger for RecordingLogger {
        fn field_bytes_limit_exceeded(&self, limit: usize) {
            self.push(Event::LimitExceeded("field", limit));
        }

        fn pausable_bytes_limit_exceeded(&self, limit: usize) {
            self.push(Event::LimitExceeded("pausable", limit));
        }

        fn total_bytes_limit_exceeded(&self, limit: usize) {
            self.push(Event::LimitExceeded("total", limit));
        }

        fn total_full_raw_request_body_limit_exceeded(&self, limit: usize) {
            self.push(Event::LimitExceeded("total_full_raw_request_body", limit));
        }

        fn body_parse_error(&self, err: &WafError) {
            self.push(Event::BodyParseError(err.to_string()));
        }

        fn header_parse_error(&self, err: &WafError) {
            self.push(Event::HeaderParseError(err.to_string()));
        }

        fn secrule_triggered(&self, rule_id: i64, decision: Decision, msg: &str, _log_data: &str, _ruleset_id: &str) {
            self.push(Event::SecRule {
                rule_id,
                decision,
                msg: msg.to_string(),
            });
        }

        fn custom_rule_triggered(&self, rule_name: &str, _priority: i64, action: CustomRuleAction) {
            self.push(Event::CustomRule(rule_name.to_string(), action));
        }

        fn ip_reputation_triggered(&self, client_ip: IpAddr) {
            self.push(Event::IpReputation(client_ip.to_string()));
        }
    }

    #[test]
    fn test_record_serialization() {
        let record = ResultRecord::RuleTriggered {
            time: Utc::now(),
            rule_id: 942100,
            decision: Decision::Block,
            message: "SQL Injection Attack Detected via libinjection",
            details: "Matched Data: s&sos found within ARGS:a",
            ruleset_id: "OWASP CRS 3.1",
        };
        let v: serde_json::Value = serde_json::to_value(&record).unwrap();
        assert_eq!(v["type"], "RuleTriggered");
        assert_eq!(v["rule_id"], 942100);
        assert_eq!(v["decision"], "Block");
        assert!(v["time"].is_string());
    }

    #[test]
    fn test_tracing_logger_does_not_panic() {
        let logger = TracingResultsLogger;
        logger.total_bytes_limit_exceeded(10);
        logger.body_parse_error(&WafError::Parse("x".into()));
        logger.custom_rule_triggered("r", 1, CustomRuleAction::Log);
        logger.ip_reputation_triggered(IpAddr::from([1, 2, 3, 4]));
    }
}
