#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Runtime plumbing for daemons embedding the policy agent: the poll runner,
//! the prometheus-backed metrics sender, the admin endpoint, and clap
//! argument structs for the agent's configuration surface.

mod admin;
mod args;
mod metrics;
mod runner;

pub use self::{
    admin::serve_admin,
    args::{AdminArgs, AgentArgs, IpTablesArgs, LogArgs, LogFormat},
    metrics::PrometheusMetrics,
    runner::PollRunner,
};
