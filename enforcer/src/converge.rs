use crate::enforce::{Enforcer, EnforceError};
use ahash::AHashMap as HashMap;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use policy_agent_core::{
    asg_chain_prefix, metrics, Chain, LiveChain, MetricsSender, Planner, RulesWithChain,
    ASG_MANAGED_CHAINS_REGEX,
};
use regex::Regex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;


/// The enforcement seam the converger drives.
pub trait RuleEnforcer: Send + Sync {
    fn enforce_rules_and_chain(&self, rule_set: &RulesWithChain) -> Result<String, EnforceError>;

    fn clean_chains_matching(
        &self,
        regex: &Regex,
        desired_chains: &[LiveChain],
    ) -> Result<Vec<LiveChain>>;
}

impl RuleEnforcer for Enforcer {
    fn enforce_rules_and_chain(&self, rule_set: &RulesWithChain) -> Result<String, EnforceError> {
        Enforcer::enforce_rules_and_chain(self, rule_set)
    }

    fn clean_chains_matching(
        &self,
        regex: &Regex,
        desired_chains: &[LiveChain],
    ) -> Result<Vec<LiveChain>> {
        Enforcer::clean_chains_matching(self, regex, desired_chains)
    }
}

/// Every failure an ASG sweep accumulated. The sweep keeps going past
/// individual enforce failures so one broken container cannot starve the
/// rest of the host.
#[derive(Debug)]
pub struct AggregateError(pub Vec<anyhow::Error>);

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for error in &self.0 {
            if !first {
                f.write_str("; ")?;
            }
            write!(f, "{error:#}")?;
            first = false;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

struct AsgState {
    rule_sets: HashMap<LiveChain, RulesWithChain>,
    container_chains: HashMap<LiveChain, String>,
}

/// One poll cycle over all planners: diff desired rule sets against the
/// last-applied cache and enforce only what changed.
///
/// Policy and ASG state live under independent mutexes; cycles of distinct
/// roles run in parallel while same-role cycles serialize. No code path
/// acquires both. Metrics are emitted after the lock is released so they
/// never extend the critical section.
pub struct SinglePollCycle {
    planners: Vec<Arc<dyn Planner>>,
    enforcer: Arc<dyn RuleEnforcer>,
    metrics: Arc<dyn MetricsSender>,
    policy_rule_sets: Mutex<HashMap<Chain, RulesWithChain>>,
    asg: Mutex<AsgState>,
}

impl SinglePollCycle {
    pub fn new(
        planners: Vec<Arc<dyn Planner>>,
        enforcer: Arc<dyn RuleEnforcer>,
        metrics: Arc<dyn MetricsSender>,
    ) -> Self {
        Self {
            planners,
            enforcer,
            metrics,
            policy_rule_sets: Mutex::new(HashMap::new()),
            asg: Mutex::new(AsgState {
                rule_sets: HashMap::new(),
                container_chains: HashMap::new(),
            }),
        }
    }

    pub fn shared(
        planners: Vec<Arc<dyn Planner>>,
        enforcer: Arc<dyn RuleEnforcer>,
        metrics: Arc<dyn MetricsSender>,
    ) -> Arc<Self> {
        Arc::new(Self::new(planners, enforcer, metrics))
    }

    /// Fetches each planner's policy rule set and enforces the ones that
    /// differ from the cache. Any failure aborts the cycle; the cache entry
    /// for a failed enforce is left unchanged unless the new generation went
    /// live and only its cleanup failed.
    pub fn do_policy_cycle(&self) -> Result<()> {
        let poll_start = Instant::now();
        let mut enforce_duration = Duration::ZERO;

        {
            let mut rule_sets = self.policy_rule_sets.lock();

            for planner in &self.planners {
                let rule_set = planner.policy_rules_and_chain().context("get-rules")?;
                let enforce_start = Instant::now();

                let cached = rule_sets.get(&rule_set.chain);
                if cached != Some(&rule_set) {
                    debug!(
                        chain = %rule_set.chain.prefix,
                        old_rules = cached.map(|c| c.rules.len()).unwrap_or(0),
                        new_rules = rule_set.rules.len(),
                        "updating iptables rules"
                    );
                    match self.enforcer.enforce_rules_and_chain(&rule_set) {
                        Ok(_) => {
                            rule_sets.insert(rule_set.chain.clone(), rule_set);
                        }
                        Err(error) => {
                            // A cleanup failure means the swap completed; the
                            // cache must reflect what is now live.
                            if error.applied_chain().is_some() {
                                rule_sets.insert(rule_set.chain.clone(), rule_set);
                            }
                            return Err(anyhow::Error::new(error).context("enforce"));
                        }
                    }
                }

                enforce_duration += enforce_start.elapsed();
            }
        }

        self.metrics
            .send_duration(metrics::ENFORCE_DURATION, enforce_duration);
        self.metrics
            .send_duration(metrics::POLL_DURATION, poll_start.elapsed());

        Ok(())
    }

    /// Syncs ASG rule sets for all containers and reaps orphaned chains.
    pub fn do_asg_cycle(&self) -> Result<()> {
        self.sync_asgs_for_containers(&[])
    }

    /// Syncs ASG rule sets for the given containers; an empty list means all
    /// containers and marks a full polling sweep, which additionally cleans
    /// up orphaned chains and emits metrics.
    ///
    /// Enforce failures accumulate; planner failures abort. Caches advance
    /// only for rule sets whose generation actually went live.
    pub fn sync_asgs_for_containers(&self, containers: &[String]) -> Result<()> {
        let poll_start = Instant::now();
        let mut enforce_duration = Duration::ZERO;
        let mut cleanup_duration = Duration::ZERO;
        let mut errors: Vec<anyhow::Error> = Vec::new();
        let polling_loop = containers.is_empty();

        {
            let mut state = self.asg.lock();
            let mut desired_chains: Vec<LiveChain> = Vec::new();

            for planner in &self.planners {
                let rule_sets = planner
                    .asg_rules_and_chains(containers)
                    .context("get-asg-rules")?;

                let enforce_start = Instant::now();
                for rule_set in rule_sets {
                    let key = LiveChain {
                        table: rule_set.chain.table.clone(),
                        name: rule_set.chain.parent_chain.clone(),
                    };

                    if state.rule_sets.get(&key) != Some(&rule_set) {
                        debug!(
                            parent = %key.name,
                            new_rules = rule_set.rules.len(),
                            "updating container iptables rules"
                        );
                        match self.enforcer.enforce_rules_and_chain(&rule_set) {
                            Ok(chain) => {
                                state.container_chains.insert(key.clone(), chain);
                                state.rule_sets.insert(key.clone(), rule_set);
                            }
                            Err(error) => {
                                if let Some(chain) = error.applied_chain() {
                                    state
                                        .container_chains
                                        .insert(key.clone(), chain.to_string());
                                    state.rule_sets.insert(key.clone(), rule_set);
                                }
                                errors.push(anyhow::Error::new(error).context("enforce-asg"));
                            }
                        }
                    }

                    if let Some(name) = state.container_chains.get(&key) {
                        desired_chains.push(LiveChain {
                            table: key.table.clone(),
                            name: name.clone(),
                        });
                    }
                }
                enforce_duration += enforce_start.elapsed();
            }

            if polling_loop {
                let cleanup_start = Instant::now();
                if let Err(error) =
                    self.cleanup_asg_chains(&mut state, ASG_MANAGED_CHAINS_REGEX, &desired_chains)
                {
                    errors.push(error);
                }
                cleanup_duration = cleanup_start.elapsed();
            }
        }

        if polling_loop {
            self.metrics
                .send_duration(metrics::ASG_ENFORCE_DURATION, enforce_duration);
            self.metrics
                .send_duration(metrics::ASG_CLEANUP_DURATION, cleanup_duration);
            self.metrics
                .send_duration(metrics::ASG_POLL_DURATION, poll_start.elapsed());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AggregateError(errors).into())
        }
    }

    /// Deletes every chain named under the given container's ASG prefix,
    /// regardless of cache state. For use when a container is torn down.
    pub fn cleanup_orphaned_asg_chains(&self, container_handle: &str) -> Result<()> {
        let mut state = self.asg.lock();
        self.cleanup_asg_chains(&mut state, &asg_chain_prefix(container_handle), &[])
    }

    fn cleanup_asg_chains(
        &self,
        state: &mut AsgState,
        pattern: &str,
        desired_chains: &[LiveChain],
    ) -> Result<()> {
        let regex = Regex::new(pattern).expect("chain prefixes are valid patterns");
        let deleted = self
            .enforcer
            .clean_chains_matching(&regex, desired_chains)
            .context("clean-up-orphaned-asg-chains")?;

        debug!(chains = deleted.len(), "deleted orphaned chains");

        let stale: Vec<LiveChain> = state
            .container_chains
            .iter()
            .filter(|(key, name)| {
                deleted
                    .iter()
                    .any(|d| d.table == key.table && &d.name == *name)
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in stale {
            state.container_chains.remove(&key);
            state.rule_sets.remove(&key);
        }

        Ok(())
    }
}
