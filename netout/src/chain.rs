use crate::{converter::RuleConverter, namer::ChainNamer, rule::NetOutRule};
use anyhow::Result;
use ipnet::IpNet;
use policy_agent_core::{IpTables, IpTablesRule, FILTER_TABLE};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;


/// The workload class a container runs as, which selects the deny-network
/// list that applies to it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Workload {
    #[default]
    App,
    Task,
    Staging,
}

impl FromStr for Workload {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "app" => Ok(Self::App),
            "task" => Ok(Self::Task),
            "staging" => Ok(Self::Staging),
            _ => Err(anyhow::anyhow!("unknown workload class {s:?}")),
        }
    }
}

/// Destination networks containers may never reach, by workload class.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyNetworks {
    #[serde(default)]
    pub always: Vec<IpNet>,
    #[serde(default)]
    pub running: Vec<IpNet>,
    #[serde(default)]
    pub staging: Vec<IpNet>,
}

impl DenyNetworks {
    fn for_workload(&self, workload: Workload) -> &[IpNet] {
        match workload {
            Workload::App | Workload::Task => &self.running,
            Workload::Staging => &self.staging,
        }
    }
}

/// Outbound connection-limiting configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutConn {
    pub limit: bool,
    pub rate_per_sec: u64,
    pub burst: u64,
    /// Log rate-limited connections instead of silently rejecting them.
    pub logging: bool,
}

#[derive(Debug, Error)]
pub enum NetOutError {
    #[error("getting chain name: {0}")]
    ChainName(#[source] anyhow::Error),

    #[error("bulk inserting net-out rules: {0}")]
    BulkInsert(#[source] anyhow::Error),
}

/// Composes the egress chain for a single container handle.
pub struct NetOutChain {
    pub chain_namer: Arc<dyn ChainNamer>,
    pub iptables: Arc<dyn IpTables>,
    pub converter: Arc<dyn RuleConverter>,
    /// Global ASG logging: log denied packets and accepted connections.
    pub asg_logging: bool,
    pub denied_logs_per_sec: u64,
    pub deny_networks: DenyNetworks,
    pub container_workload: Workload,
    pub conn: OutConn,
}

impl NetOutChain {
    /// The rules every net-out chain ends with: an optional rate-limited
    /// DENY log, then the terminal reject.
    pub fn default_rules(&self, container_handle: &str) -> Vec<IpTablesRule> {
        let mut rules = Vec::with_capacity(2);
        if self.asg_logging {
            rules.push(IpTablesRule::new([
                "-m".to_string(),
                "limit".to_string(),
                "--limit".to_string(),
                format!("{}/s", self.denied_logs_per_sec),
                "--limit-burst".to_string(),
                self.denied_logs_per_sec.to_string(),
                "--jump".to_string(),
                "LOG".to_string(),
                "--log-prefix".to_string(),
                format!("\"DENY_{container_handle} \""),
            ]));
        }
        rules.push(IpTablesRule::from([
            "--jump",
            "REJECT",
            "--reject-with",
            "icmp-port-unreachable",
        ]));
        rules
    }

    /// Composes the container's egress rules and inserts them at the head of
    /// its net-out chain: converted allow rules, deny-network rejects, the
    /// optional outbound connection limit, then the stateful defaults.
    pub fn bulk_insert_rules(
        &self,
        net_out_chain: &str,
        container_handle: &str,
        user_rules: &[NetOutRule],
    ) -> Result<(), NetOutError> {
        let log_chain = self
            .chain_namer
            .postfix(net_out_chain, "log")
            .map_err(NetOutError::ChainName)?;

        let mut rules = self
            .converter
            .bulk_convert(user_rules, &log_chain, self.asg_logging);

        for network in self
            .deny_networks
            .always
            .iter()
            .chain(self.deny_networks.for_workload(self.container_workload))
        {
            rules.push(IpTablesRule::new([
                "-d".to_string(),
                network.to_string(),
                "--jump".to_string(),
                "REJECT".to_string(),
                "--reject-with".to_string(),
                "icmp-port-unreachable".to_string(),
            ]));
        }

        if self.conn.limit {
            let target = if self.conn.logging {
                self.chain_namer
                    .postfix(net_out_chain, "rl-log")
                    .map_err(NetOutError::ChainName)?
            } else {
                "REJECT".to_string()
            };
            rules.push(self.rate_limit_rule(container_handle, &target));
        }

        // Stateful defaults are always the last two, in this order.
        rules.push(IpTablesRule::from([
            "-p", "tcp", "-m", "state", "--state", "INVALID", "-j", "DROP",
        ]));
        rules.push(IpTablesRule::from([
            "-m",
            "state",
            "--state",
            "RELATED,ESTABLISHED",
            "-j",
            "ACCEPT",
        ]));

        self.iptables
            .bulk_insert(FILTER_TABLE, net_out_chain, 1, &rules)
            .map_err(NetOutError::BulkInsert)
    }

    fn rate_limit_rule(&self, container_handle: &str, target: &str) -> IpTablesRule {
        IpTablesRule::new([
            "-p".to_string(),
            "tcp".to_string(),
            "-m".to_string(),
            "conntrack".to_string(),
            "--ctstate".to_string(),
            "NEW".to_string(),
            "-m".to_string(),
            "hashlimit".to_string(),
            "--hashlimit-above".to_string(),
            format!("{}/sec", self.conn.rate_per_sec),
            "--hashlimit-burst".to_string(),
            self.conn.burst.to_string(),
            "--hashlimit-mode".to_string(),
            "dstip,dstport".to_string(),
            "--hashlimit-name".to_string(),
            container_handle.to_string(),
            "--hashlimit-htable-expire".to_string(),
            "5000".to_string(),
            "-j".to_string(),
            target.to_string(),
        ])
    }
}
