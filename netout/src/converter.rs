use crate::rule::{NetOutRule, Protocol};
use ahash::AHashSet as HashSet;
use policy_agent_core::IpTablesRule;

/// Converts user allow rules into iptables rule bodies.
pub trait RuleConverter: Send + Sync {
    fn convert(
        &self,
        rule: &NetOutRule,
        log_chain_name: &str,
        global_logging: bool,
    ) -> Vec<IpTablesRule>;

    fn bulk_convert(
        &self,
        rules: &[NetOutRule],
        log_chain_name: &str,
        global_logging: bool,
    ) -> Vec<IpTablesRule>;
}

/// The production converter: one iptables rule per (network, port-range)
/// combination, ending in an ACCEPT jump, or in a goto into the container's
/// log subchain when the rule (or the global toggle) asks for logging.
#[derive(Clone, Copy, Debug, Default)]
pub struct Converter;

impl RuleConverter for Converter {
    fn convert(
        &self,
        rule: &NetOutRule,
        log_chain_name: &str,
        global_logging: bool,
    ) -> Vec<IpTablesRule> {
        let logged = rule.log || global_logging;
        let mut converted = Vec::new();

        for network in &rule.networks {
            match rule.protocol {
                Protocol::Tcp | Protocol::Udp => {
                    let proto = match rule.protocol {
                        Protocol::Tcp => "tcp",
                        _ => "udp",
                    };
                    if rule.ports.is_empty() {
                        let mut tokens = vec![
                            "-m".to_string(),
                            "iprange".to_string(),
                            "-p".to_string(),
                            proto.to_string(),
                            "--dst-range".to_string(),
                            network.to_string(),
                        ];
                        push_target(&mut tokens, logged, log_chain_name);
                        converted.push(IpTablesRule::new(tokens));
                    }
                    for ports in &rule.ports {
                        let mut tokens = vec![
                            "-m".to_string(),
                            "iprange".to_string(),
                            "-p".to_string(),
                            proto.to_string(),
                            "--dst-range".to_string(),
                            network.to_string(),
                            "-m".to_string(),
                            proto.to_string(),
                            "--destination-port".to_string(),
                            format!("{}:{}", ports.start, ports.end),
                        ];
                        push_target(&mut tokens, logged, log_chain_name);
                        converted.push(IpTablesRule::new(tokens));
                    }
                }
                Protocol::Icmp => {
                    let mut tokens = vec![
                        "-m".to_string(),
                        "iprange".to_string(),
                        "-p".to_string(),
                        "icmp".to_string(),
                        "--dst-range".to_string(),
                        network.to_string(),
                    ];
                    if let Some(icmp) = &rule.icmp {
                        tokens.push("-m".to_string());
                        tokens.push("icmp".to_string());
                        tokens.push("--icmp-type".to_string());
                        tokens.push(match icmp.code {
                            Some(code) => format!("{}/{}", icmp.icmp_type, code),
                            None => icmp.icmp_type.to_string(),
                        });
                    }
                    push_target(&mut tokens, logged, log_chain_name);
                    converted.push(IpTablesRule::new(tokens));
                }
                Protocol::All => {
                    let mut tokens = vec![
                        "-m".to_string(),
                        "iprange".to_string(),
                        "--dst-range".to_string(),
                        network.to_string(),
                    ];
                    push_target(&mut tokens, logged, log_chain_name);
                    converted.push(IpTablesRule::new(tokens));
                }
            }
        }

        converted
    }

    fn bulk_convert(
        &self,
        rules: &[NetOutRule],
        log_chain_name: &str,
        global_logging: bool,
    ) -> Vec<IpTablesRule> {
        let converted = rules
            .iter()
            .flat_map(|rule| self.convert(rule, log_chain_name, global_logging));
        deduplicate(converted)
    }
}

fn push_target(tokens: &mut Vec<String>, logged: bool, log_chain_name: &str) {
    if logged {
        tokens.push("-g".to_string());
        tokens.push(log_chain_name.to_string());
    } else {
        tokens.push("--jump".to_string());
        tokens.push("ACCEPT".to_string());
    }
}

/// Drops repeated rule bodies, keeping the first occurrence. Overlapping user
/// rules routinely expand to identical iptables rules; installing them twice
/// only slows the kernel's linear match.
fn deduplicate(rules: impl IntoIterator<Item = IpTablesRule>) -> Vec<IpTablesRule> {
    let mut seen = HashSet::new();
    rules
        .into_iter()
        .filter(|rule| seen.insert(rule.clone()))
        .collect()
}
