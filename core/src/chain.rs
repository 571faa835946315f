use crate::rule::IpTablesRule;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The only table the agent manages chains in.
pub const FILTER_TABLE: &str = "filter";

/// Matches the per-handle prefix of any ASG generation chain, regardless of
/// which process created it. Reaping by live kernel text rather than by cache
/// is what lets a restarted agent collect leftovers from a crashed
/// predecessor.
pub const ASG_MANAGED_CHAINS_REGEX: &str = "asg-[0-9a-f]{6}-";

/// The numeric suffix appended to a chain prefix for each generation.
pub const GENERATION_SUFFIX_PATTERN: &str = "([0-9]{10,16})";

/// A managed chain descriptor: where generations are parented, how they are
/// named, and how superseded ones are recognized. Used by value as a cache
/// key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Chain {
    pub table: String,
    pub parent_chain: String,
    pub prefix: String,
    /// Pattern identifying live chains this descriptor owns; defaults to
    /// `prefix`.
    pub managed_chains_regex: Option<String>,
    /// Strip residual parent-chain rules after a successful swap.
    pub cleanup_parent_chain: bool,
}

impl Chain {
    pub fn managed_chains_regex(&self) -> &str {
        self.managed_chains_regex.as_deref().unwrap_or(&self.prefix)
    }
}

/// A concrete kernel chain.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LiveChain {
    pub table: String,
    pub name: String,
}

/// Application log routing carried alongside a rule set. Opaque to the
/// enforcement path.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    pub guid: String,
    pub index: u32,
    pub source_name: String,
}

/// A planner's desired state for one managed chain: the descriptor and the
/// ordered rules to install under it.
#[derive(Clone, Debug, Default)]
pub struct RulesWithChain {
    pub chain: Chain,
    pub rules: Vec<IpTablesRule>,
    pub log_config: LogConfig,
}

// Equality is chain equality plus per-position token equality of the rules;
// the log config never participates.
impl PartialEq for RulesWithChain {
    fn eq(&self, other: &Self) -> bool {
        self.chain == other.chain && self.rules == other.rules
    }
}

impl Eq for RulesWithChain {}

/// The name of a fresh generation chain: the prefix followed by a
/// microseconds-since-epoch timestamp. Generation ordering is numeric on the
/// suffix.
pub fn generation_chain_name(prefix: &str, micros: i64) -> String {
    format!("{prefix}{micros}")
}

/// The stable per-handle prefix under which a container's ASG generations are
/// named: `asg-` followed by the first six hex digits of the handle's digest.
/// Must stay stable across processes and releases; the managed-chains regex
/// relies on its shape.
pub fn asg_chain_prefix(container_handle: &str) -> String {
    let digest = Sha256::digest(container_handle.as_bytes());
    format!("asg-{:02x}{:02x}{:02x}-", digest[0], digest[1], digest[2])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules_with_chain(prefix: &str, rules: Vec<IpTablesRule>) -> RulesWithChain {
        RulesWithChain {
            chain: Chain {
                table: FILTER_TABLE.to_string(),
                parent_chain: "FORWARD".to_string(),
                prefix: prefix.to_string(),
                ..Default::default()
            },
            rules,
            log_config: LogConfig::default(),
        }
    }

    #[test]
    fn equality_requires_identical_chain_and_rules() {
        let a = rules_with_chain("vpa--", vec![IpTablesRule::from(["-j", "ACCEPT"])]);
        let b = rules_with_chain("vpa--", vec![IpTablesRule::from(["-j", "ACCEPT"])]);
        assert_eq!(a, b);

        let different_chain = rules_with_chain("vpe--", vec![IpTablesRule::from(["-j", "ACCEPT"])]);
        assert_ne!(a, different_chain);

        let different_rules = rules_with_chain("vpa--", vec![IpTablesRule::from(["-j", "DROP"])]);
        assert_ne!(a, different_rules);

        let extra_rule = rules_with_chain(
            "vpa--",
            vec![
                IpTablesRule::from(["-j", "ACCEPT"]),
                IpTablesRule::from(["-j", "ACCEPT"]),
            ],
        );
        assert_ne!(a, extra_rule);
    }

    #[test]
    fn equality_ignores_log_config() {
        let a = rules_with_chain("vpa--", vec![]);
        let mut b = rules_with_chain("vpa--", vec![]);
        b.log_config = LogConfig {
            guid: "some-app-guid".to_string(),
            index: 2,
            source_name: "CELL".to_string(),
        };
        assert_eq!(a, b);
    }

    #[test]
    fn generation_names_are_prefix_plus_timestamp() {
        assert_eq!(
            generation_chain_name("vpa--", 1700000000000000),
            "vpa--1700000000000000"
        );
    }

    #[test]
    fn asg_prefixes_are_stable_and_regex_shaped() {
        let prefix = asg_chain_prefix("some-container-handle");
        assert_eq!(prefix, asg_chain_prefix("some-container-handle"));
        assert_ne!(prefix, asg_chain_prefix("another-container-handle"));

        // asg- + 6 hex + trailing dash: the shape ASG_MANAGED_CHAINS_REGEX
        // matches, and short enough to carry a 16-digit generation suffix
        // within the kernel's 28-byte chain name budget.
        assert_eq!(prefix.len(), 11);
        assert!(prefix.starts_with("asg-"));
        assert!(prefix.ends_with('-'));
        assert!(prefix[4..10].chars().all(|c| c.is_ascii_hexdigit()));
    }
}
