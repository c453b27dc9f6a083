//! WAF orchestration: configuration, requests, IP reputation, results
//! logging and the per-request evaluation flow.

pub mod config;
pub mod ipreputation;
pub mod logging;
pub mod request;
pub mod server;

pub use config::{Exclusion, IpReputationConfig, PolicyConfig, SecRuleConfig, WafConfig};
pub use ipreputation::IpReputationEngine;
pub use logging::{ResultsLogger, TracingResultsLogger};
pub use request::HttpRequest;
pub use server::Waf;
