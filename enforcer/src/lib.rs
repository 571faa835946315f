#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Transactional enforcement of managed iptables chains.
//!
//! New rule sets are installed as fresh generation chains alongside the old
//! ones, made live by an atomic parent-chain jump, and superseded generations
//! are reaped afterwards. The converger drives this from planner output on a
//! poll cycle, caching last-applied rule sets so unchanged state costs
//! nothing.

mod converge;
mod enforce;

pub use self::{
    converge::{AggregateError, RuleEnforcer, SinglePollCycle},
    enforce::{Enforcer, EnforcerConfig, EnforceError, SystemTimestamper, Timestamper},
};
