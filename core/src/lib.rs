#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod chain;
mod rule;

pub use self::{
    chain::{
        asg_chain_prefix, generation_chain_name, Chain, LiveChain, LogConfig, RulesWithChain,
        ASG_MANAGED_CHAINS_REGEX, FILTER_TABLE, GENERATION_SUFFIX_PATTERN,
    },
    rule::IpTablesRule,
};

use anyhow::Result;
use std::time::Duration;

/// The side-effect boundary to the kernel's packet filter.
///
/// Every operation is a blocking, syscall-class call that either succeeds or
/// returns an error carrying the underlying diagnostic. Implementations must
/// serialize concurrent callers internally; `iptables` is not reentrant.
pub trait IpTables: Send + Sync {
    /// Creates an empty chain. Fails if the chain already exists.
    fn new_chain(&self, table: &str, chain: &str) -> Result<()>;

    /// Inserts rules starting at the 1-based `position`, preserving order.
    fn bulk_insert(
        &self,
        table: &str,
        chain: &str,
        position: usize,
        rules: &[IpTablesRule],
    ) -> Result<()>;

    /// Appends rules at the tail of the chain, preserving order.
    fn bulk_append(&self, table: &str, chain: &str, rules: &[IpTablesRule]) -> Result<()>;

    /// Returns the chain's current rules as `-A <chain> ...` text lines.
    fn list(&self, table: &str, chain: &str) -> Result<Vec<String>>;

    /// Returns the names of every chain in the table.
    fn list_chains(&self, table: &str) -> Result<Vec<String>>;

    /// Removes exactly one matching rule. Fails if the rule is absent.
    fn delete(&self, table: &str, chain: &str, rule: &IpTablesRule) -> Result<()>;

    /// Removes an empty chain. Fails while the chain is still referenced.
    fn delete_chain(&self, table: &str, chain: &str) -> Result<()>;

    /// Flushes all rules, keeping the chain itself.
    fn clear_chain(&self, table: &str, chain: &str) -> Result<()>;

    /// Removes every rule at a position greater than `keep`, except a blanket
    /// `REJECT --reject-with icmp-port-unreachable` terminal, which is always
    /// preserved.
    fn delete_after_rule_num_keep_reject(&self, table: &str, chain: &str, keep: usize)
        -> Result<()>;
}

/// Produces the desired rule sets the converger drives toward.
///
/// Multiple planners may be registered; their results are enforced in
/// registration order, each planner's rule sets in their returned order.
pub trait Planner: Send + Sync {
    fn policy_rules_and_chain(&self) -> Result<RulesWithChain>;

    /// Desired per-container egress rule sets. An empty `containers` slice
    /// means "all containers" and marks a full polling sweep.
    fn asg_rules_and_chains(&self, containers: &[String]) -> Result<Vec<RulesWithChain>>;
}

/// Duration metrics emitted by the converger.
pub trait MetricsSender: Send + Sync {
    fn send_duration(&self, name: &'static str, elapsed: Duration);
}

/// Stable metric names, part of the exposed contract.
pub mod metrics {
    pub const ENFORCE_DURATION: &str = "iptablesEnforceTime";
    pub const POLL_DURATION: &str = "totalPollTime";
    pub const ASG_ENFORCE_DURATION: &str = "asgIptablesEnforceTime";
    pub const ASG_CLEANUP_DURATION: &str = "asgIptablesCleanupTime";
    pub const ASG_POLL_DURATION: &str = "asgTotalPollTime";
}
