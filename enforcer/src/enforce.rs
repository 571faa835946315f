use anyhow::{Context, Result};
use ipnet::IpNet;
use policy_agent_core::{
    generation_chain_name, Chain, IpTables, IpTablesRule, LiveChain, RulesWithChain,
    FILTER_TABLE, GENERATION_SUFFIX_PATTERN,
};
use regex::Regex;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

#[cfg(test)]
mod tests;

/// Supplies the microsecond timestamps generation chains are named after.
/// Generation ordering is numeric on these, so they must be monotonic per
/// prefix; the converger guarantees no two enforces for one prefix overlap.
pub trait Timestamper: Send + Sync {
    fn current_micros(&self) -> i64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTimestamper;

impl Timestamper for SystemTimestamper {
    fn current_micros(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_micros() as i64)
            .unwrap_or(0)
    }
}

#[derive(Clone, Debug, Default)]
pub struct EnforcerConfig {
    /// Replace container network policy with a blanket accept on the overlay
    /// network. The generational machinery still runs so re-enabling policy
    /// is just another enforce.
    pub disable_container_network_policy: bool,
    pub overlay_network: Option<IpNet>,
}

/// How an enforce failed. Everything up to `BulkAppend` means the new
/// generation never became live and a best-effort rollback was attempted.
/// `Cleanup` means the swap completed and the new chain IS live; only the
/// reaping of older state failed. Callers must not treat `Cleanup` as
/// rollback-needed.
#[derive(Debug, Error)]
pub enum EnforceError {
    #[error("creating chain: {0}")]
    CreateChain(#[source] anyhow::Error),

    #[error("inserting chain: {0}")]
    InsertChain(#[source] anyhow::Error),

    #[error("bulk appending: {0}")]
    BulkAppend(#[source] anyhow::Error),

    #[error("cleaning up: {source}")]
    Cleanup {
        /// The live generation chain the enforce installed.
        chain: String,
        #[source]
        source: anyhow::Error,
    },
}

impl EnforceError {
    /// The generation chain that became live despite the error, if any.
    pub fn applied_chain(&self) -> Option<&str> {
        match self {
            Self::Cleanup { chain, .. } => Some(chain),
            _ => None,
        }
    }
}

/// Installs rule sets as timestamp-suffixed generation chains and reaps the
/// generations they supersede.
pub struct Enforcer {
    iptables: Arc<dyn IpTables>,
    timestamper: Arc<dyn Timestamper>,
    config: EnforcerConfig,
}

impl Enforcer {
    pub fn new(
        iptables: Arc<dyn IpTables>,
        timestamper: Arc<dyn Timestamper>,
        config: EnforcerConfig,
    ) -> Self {
        Self {
            iptables,
            timestamper,
            config,
        }
    }

    pub fn enforce_rules_and_chain(&self, rule_set: &RulesWithChain) -> Result<String, EnforceError> {
        self.enforce_on_chain(&rule_set.chain, &rule_set.rules)
    }

    /// Installs `rules` as a fresh generation of `chain`, swaps it live, and
    /// reaps every older same-prefix generation. Returns the new generation
    /// chain's name.
    pub fn enforce_on_chain(
        &self,
        chain: &Chain,
        rules: &[IpTablesRule],
    ) -> Result<String, EnforceError> {
        let new_time = self.timestamper.current_micros();
        let name = generation_chain_name(&chain.prefix, new_time);
        let table = &chain.table;
        let parent = &chain.parent_chain;

        debug!(%table, chain = %name, "create-chain");
        self.iptables
            .new_chain(table, &name)
            .map_err(EnforceError::CreateChain)?;

        let mut rules = rules.to_vec();
        if self.config.disable_container_network_policy {
            if let Some(overlay) = &self.config.overlay_network {
                rules.insert(
                    0,
                    IpTablesRule::new(["-s".to_string(), overlay.to_string(), "-j".to_string(), "ACCEPT".to_string()]),
                );
            }
        }

        debug!(%table, %parent, chain = %name, "insert-jump");
        if let Err(error) = self
            .iptables
            .bulk_insert(table, parent, 1, &[IpTablesRule::jump(&name)])
        {
            if let Err(cleanup) = self.delete_chain(&LiveChain {
                table: table.clone(),
                name: name.clone(),
            }) {
                debug!(%cleanup, chain = %name, "cleanup after failed insert");
            }
            return Err(EnforceError::InsertChain(error));
        }

        debug!(%table, chain = %name, rules = rules.len(), "bulk-append");
        if let Err(error) = self.iptables.bulk_append(table, &name, &rules) {
            if let Err(cleanup) = self.cleanup_old_chain(
                &LiveChain {
                    table: table.clone(),
                    name: name.clone(),
                },
                parent,
            ) {
                debug!(%cleanup, chain = %name, "cleanup after failed append");
            }
            return Err(EnforceError::BulkAppend(error));
        }

        debug!(%table, %parent, chain = %name, "reap-superseded");
        self.cleanup_old_rules(
            table,
            parent,
            chain.managed_chains_regex(),
            chain.cleanup_parent_chain,
            new_time,
        )
        .map_err(|source| EnforceError::Cleanup {
            chain: name.clone(),
            source,
        })?;

        Ok(name)
    }

    /// Deletes every chain in the filter table whose name matches `regex` and
    /// is not in `desired_chains`. Returns the deleted chains.
    pub fn clean_chains_matching(
        &self,
        regex: &Regex,
        desired_chains: &[LiveChain],
    ) -> Result<Vec<LiveChain>> {
        let all_chains = self
            .iptables
            .list_chains(FILTER_TABLE)
            .with_context(|| format!("listing chains in {FILTER_TABLE}"))?;

        let to_delete: Vec<LiveChain> = all_chains
            .into_iter()
            .filter(|name| {
                regex.is_match(name) && !desired_chains.iter().any(|d| &d.name == name)
            })
            .map(|name| LiveChain {
                table: FILTER_TABLE.to_string(),
                name,
            })
            .collect();

        for chain in &to_delete {
            debug!(table = %chain.table, chain = %chain.name, "delete-undesired-chain");
            self.delete_chain(chain).with_context(|| {
                format!("deleting chain {} from table {}", chain.name, chain.table)
            })?;
        }

        Ok(to_delete)
    }

    fn cleanup_old_rules(
        &self,
        table: &str,
        parent: &str,
        managed_chains_regex: &str,
        cleanup_parent_chain: bool,
        new_time: i64,
    ) -> Result<()> {
        let rules = self
            .iptables
            .list(table, parent)
            .context("listing parent rules")?;

        let managed =
            Regex::new(&format!("{managed_chains_regex}{GENERATION_SUFFIX_PATTERN}"))
                .context("compiling managed chains pattern")?;

        for rule in &rules {
            if let Some(captures) = managed.captures(rule) {
                let old_time: i64 = captures[1].parse().context("parsing generation suffix")?;
                if old_time < new_time {
                    let old = LiveChain {
                        table: table.to_string(),
                        name: captures[0].to_string(),
                    };
                    debug!(chain = %old.name, "reap-old-generation");
                    self.cleanup_old_chain(&old, parent)?;
                }
            }
        }

        if cleanup_parent_chain {
            // Rule 1 is now the jump to the fresh generation; anything past
            // rule 2 predates the swap or leaked in from outside, except the
            // terminal REJECT, which the adapter preserves.
            self.iptables
                .delete_after_rule_num_keep_reject(table, parent, 2)
                .context("clean up parent chain")?;
        }

        Ok(())
    }

    /// Unlinks a generation from its parent, then deletes it.
    fn cleanup_old_chain(&self, chain: &LiveChain, parent: &str) -> Result<()> {
        self.iptables
            .delete(&chain.table, parent, &IpTablesRule::jump(&chain.name))
            .context("remove reference to old chain")?;

        self.delete_chain(chain)
    }

    /// Deletes a chain and any log subchains it gotos. The recursion is one
    /// level: log subchains do not themselves goto further.
    fn delete_chain(&self, chain: &LiveChain) -> Result<()> {
        let rules = self
            .iptables
            .list(&chain.table, &chain.name)
            .context("list rules for chain")?;

        let goto = Regex::new(&format!(
            r"-A\s+{}\s+.*-g\s+([^\s]+)",
            regex::escape(&chain.name)
        ))
        .context("compiling goto pattern")?;

        let mut goto_targets: Vec<String> = rules
            .iter()
            .filter_map(|rule| goto.captures(rule).map(|c| c[1].to_string()))
            .collect();
        goto_targets.sort();
        goto_targets.dedup();

        self.iptables
            .clear_chain(&chain.table, &chain.name)
            .context("flush old chain")?;

        self.iptables
            .delete_chain(&chain.table, &chain.name)
            .context("delete old chain")?;

        for target in goto_targets {
            debug!(table = %chain.table, chain = %target, "delete-goto-target");
            self.iptables
                .delete_chain(&chain.table, &target)
                .with_context(|| format!("cleanup jump target {target}"))?;
        }

        Ok(())
    }
}
