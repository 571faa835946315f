#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The only component that touches the kernel: the `iptables` crate behind
//! the adapter contract, serialized for in-process callers.
//!
//! The wrapped binary takes the xtables lock itself (the crate passes
//! `--wait` where the binary supports it), so other chain producers on the
//! host block instead of failing.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use policy_agent_core::{IpTables, IpTablesRule};
use thiserror::Error;
use tracing::debug;


/// A failed iptables operation, carrying enough to diagnose it from a log
/// line.
#[derive(Debug, Error)]
#[error("{operation} {target}: {diagnostic}")]
pub struct CommandError {
    pub operation: &'static str,
    pub target: String,
    pub diagnostic: String,
}

fn op_err(
    operation: &'static str,
    target: String,
    source: Box<dyn std::error::Error>,
) -> anyhow::Error {
    anyhow::Error::new(CommandError {
        operation,
        target,
        diagnostic: source.to_string(),
    })
}

/// `iptables(8)` behind the adapter contract.
pub struct LockedIpTables {
    inner: iptables::IPTables,
    lock: Mutex<()>,
}

impl LockedIpTables {
    /// Binds to the system's IPv4 packet filter.
    pub fn new() -> Result<Self> {
        Self::with_family(false)
    }

    /// Binds to the IPv4 or IPv6 packet filter.
    pub fn with_family(is_ipv6: bool) -> Result<Self> {
        let inner =
            iptables::new(is_ipv6).map_err(|source| anyhow!("initializing iptables: {source}"))?;
        Ok(Self {
            inner,
            lock: Mutex::new(()),
        })
    }
}

impl IpTables for LockedIpTables {
    fn new_chain(&self, table: &str, chain: &str) -> Result<()> {
        let _serialized = self.lock.lock();
        debug!(table, chain, "new-chain");
        self.inner
            .new_chain(table, chain)
            .map_err(|source| op_err("new-chain", format!("{table}/{chain}"), source))
    }

    fn bulk_insert(
        &self,
        table: &str,
        chain: &str,
        position: usize,
        rules: &[IpTablesRule],
    ) -> Result<()> {
        let _serialized = self.lock.lock();
        debug!(table, chain, position, rules = rules.len(), "bulk-insert");
        // Inserting rule i at position + i keeps the given order in the
        // chain.
        for (i, rule) in rules.iter().enumerate() {
            self.inner
                .insert(table, chain, &rule.to_string(), (position + i) as i32)
                .map_err(|source| op_err("insert", format!("{table}/{chain}"), source))?;
        }
        Ok(())
    }

    fn bulk_append(&self, table: &str, chain: &str, rules: &[IpTablesRule]) -> Result<()> {
        let _serialized = self.lock.lock();
        debug!(table, chain, rules = rules.len(), "bulk-append");
        for rule in rules {
            self.inner
                .append(table, chain, &rule.to_string())
                .map_err(|source| op_err("append", format!("{table}/{chain}"), source))?;
        }
        Ok(())
    }

    fn list(&self, table: &str, chain: &str) -> Result<Vec<String>> {
        let _serialized = self.lock.lock();
        let lines = self
            .inner
            .list(table, chain)
            .map_err(|source| op_err("list", format!("{table}/{chain}"), source))?;
        Ok(appended_rules(&lines))
    }

    fn list_chains(&self, table: &str) -> Result<Vec<String>> {
        let _serialized = self.lock.lock();
        let lines = self
            .inner
            .list_table(table)
            .map_err(|source| op_err("list-table", table.to_string(), source))?;
        Ok(chain_names(&lines))
    }

    fn delete(&self, table: &str, chain: &str, rule: &IpTablesRule) -> Result<()> {
        let _serialized = self.lock.lock();
        debug!(table, chain, rule = %rule, "delete");
        self.inner
            .delete(table, chain, &rule.to_string())
            .map_err(|source| op_err("delete", format!("{table}/{chain}"), source))
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<()> {
        let _serialized = self.lock.lock();
        debug!(table, chain, "delete-chain");
        self.inner
            .delete_chain(table, chain)
            .map_err(|source| op_err("delete-chain", format!("{table}/{chain}"), source))
    }

    fn clear_chain(&self, table: &str, chain: &str) -> Result<()> {
        let _serialized = self.lock.lock();
        debug!(table, chain, "flush-chain");
        self.inner
            .flush_chain(table, chain)
            .map_err(|source| op_err("flush-chain", format!("{table}/{chain}"), source))
    }

    fn delete_after_rule_num_keep_reject(
        &self,
        table: &str,
        chain: &str,
        keep: usize,
    ) -> Result<()> {
        let _serialized = self.lock.lock();
        let lines = self
            .inner
            .list(table, chain)
            .map_err(|source| op_err("list", format!("{table}/{chain}"), source))?;
        let rules = appended_rules(&lines);
        // Bottom-up so the remaining rule numbers stay valid as we go.
        for position in positions_to_delete(&rules, chain, keep) {
            debug!(table, chain, position, "delete-rule-num");
            let output = self
                .inner
                .execute(table, &format!("-D {chain} {position}"))
                .map_err(|source| op_err("delete-rule-num", format!("{table}/{chain}"), source))?;
            if !output.status.success() {
                return Err(CommandError {
                    operation: "delete-rule-num",
                    target: format!("{table}/{chain}"),
                    diagnostic: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                }
                .into());
            }
        }
        Ok(())
    }
}

/// The `-A ...` lines of an `iptables -S` listing; the `-P`/`-N` header line
/// is not a rule and carries no rule number.
fn appended_rules(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter(|line| line.starts_with("-A "))
        .cloned()
        .collect()
}

/// Chain names from a whole-table `iptables -S` listing: built-in chains
/// appear as `-P <name> <policy>`, user chains as `-N <name>`.
fn chain_names(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            match tokens.next() {
                Some("-P") | Some("-N") => tokens.next().map(str::to_string),
                _ => None,
            }
        })
        .collect()
}

/// 1-based rule positions to delete, highest first: everything past `keep`
/// except a blanket REJECT terminal.
fn positions_to_delete(rules: &[String], chain: &str, keep: usize) -> Vec<usize> {
    rules
        .iter()
        .enumerate()
        .rev()
        .filter_map(|(i, rule)| {
            let position = i + 1;
            if position <= keep || is_blanket_reject(rule, chain) {
                None
            } else {
                Some(position)
            }
        })
        .collect()
}

/// A rule that rejects everything: no match criteria, just the REJECT target
/// with the port-unreachable response. Stripping it would leave a container's
/// net-out chain open-ended.
fn is_blanket_reject(rule: &str, chain: &str) -> bool {
    let mut tokens = rule.split_whitespace();
    if tokens.next() != Some("-A") || tokens.next() != Some(chain) {
        return false;
    }
    let rest: Vec<&str> = tokens.collect();
    matches!(
        rest.as_slice(),
        ["-j", "REJECT", "--reject-with", "icmp-port-unreachable"]
            | ["--jump", "REJECT", "--reject-with", "icmp-port-unreachable"]
    )
}
