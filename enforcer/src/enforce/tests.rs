use super::*;
use ahash::AHashMap as HashMap;
use anyhow::anyhow;
use parking_lot::Mutex;

const ASG_PATTERN: &str = policy_agent_core::ASG_MANAGED_CHAINS_REGEX;

#[derive(Clone, Debug, PartialEq)]
enum Call {
    NewChain(String, String),
    BulkInsert(String, String, usize, Vec<IpTablesRule>),
    BulkAppend(String, String, Vec<IpTablesRule>),
    List(String, String),
    ListChains(String),
    Delete(String, String, IpTablesRule),
    DeleteChain(String, String),
    ClearChain(String, String),
    DeleteAfterRuleNumKeepReject(String, String, usize),
}

#[derive(Default)]
struct FakeIpTables {
    calls: Mutex<Vec<Call>>,
    list_results: HashMap<(String, String), Vec<String>>,
    chains: Vec<String>,
    fail_op: Option<&'static str>,
}

impl FakeIpTables {
    fn with_listing(mut self, table: &str, chain: &str, lines: &[&str]) -> Self {
        self.list_results.insert(
            (table.to_string(), chain.to_string()),
            lines.iter().map(|l| l.to_string()).collect(),
        );
        self
    }

    fn with_chains(mut self, chains: &[&str]) -> Self {
        self.chains = chains.iter().map(|c| c.to_string()).collect();
        self
    }

    fn failing(mut self, op: &'static str) -> Self {
        self.fail_op = Some(op);
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    fn record(&self, call: Call, op: &'static str) -> Result<()> {
        self.calls.lock().push(call);
        if self.fail_op == Some(op) {
            Err(anyhow!("{op} went wrong"))
        } else {
            Ok(())
        }
    }
}

impl IpTables for FakeIpTables {
    fn new_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.record(
            Call::NewChain(table.to_string(), chain.to_string()),
            "new-chain",
        )
    }

    fn bulk_insert(
        &self,
        table: &str,
        chain: &str,
        position: usize,
        rules: &[IpTablesRule],
    ) -> Result<()> {
        self.record(
            Call::BulkInsert(table.to_string(), chain.to_string(), position, rules.to_vec()),
            "bulk-insert",
        )
    }

    fn bulk_append(&self, table: &str, chain: &str, rules: &[IpTablesRule]) -> Result<()> {
        self.record(
            Call::BulkAppend(table.to_string(), chain.to_string(), rules.to_vec()),
            "bulk-append",
        )
    }

    fn list(&self, table: &str, chain: &str) -> Result<Vec<String>> {
        self.record(Call::List(table.to_string(), chain.to_string()), "list")?;
        Ok(self
            .list_results
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn list_chains(&self, table: &str) -> Result<Vec<String>> {
        self.record(Call::ListChains(table.to_string()), "list-chains")?;
        Ok(self.chains.clone())
    }

    fn delete(&self, table: &str, chain: &str, rule: &IpTablesRule) -> Result<()> {
        self.record(
            Call::Delete(table.to_string(), chain.to_string(), rule.clone()),
            "delete",
        )
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.record(
            Call::DeleteChain(table.to_string(), chain.to_string()),
            "delete-chain",
        )
    }

    fn clear_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.record(
            Call::ClearChain(table.to_string(), chain.to_string()),
            "clear-chain",
        )
    }

    fn delete_after_rule_num_keep_reject(
        &self,
        table: &str,
        chain: &str,
        keep: usize,
    ) -> Result<()> {
        self.record(
            Call::DeleteAfterRuleNumKeepReject(table.to_string(), chain.to_string(), keep),
            "delete-after-rule-num",
        )
    }
}

struct FixedTimestamper(i64);

impl Timestamper for FixedTimestamper {
    fn current_micros(&self) -> i64 {
        self.0
    }
}

fn enforcer(iptables: Arc<FakeIpTables>, micros: i64) -> Enforcer {
    Enforcer::new(
        iptables,
        Arc::new(FixedTimestamper(micros)),
        EnforcerConfig::default(),
    )
}

fn policy_chain() -> Chain {
    Chain {
        table: "filter".to_string(),
        parent_chain: "FORWARD".to_string(),
        prefix: "vpa--".to_string(),
        ..Default::default()
    }
}

fn accept_rule() -> IpTablesRule {
    IpTablesRule::from(["-s", "10.0.0.1", "-j", "ACCEPT"])
}

#[test]
fn first_enforce_installs_a_generation_and_swaps_it_live() {
    let iptables = Arc::new(FakeIpTables::default().with_listing(
        "filter",
        "FORWARD",
        &["-A FORWARD -j vpa--1700000000000000"],
    ));
    let enforcer = enforcer(iptables.clone(), 1700000000000000);

    let chain = enforcer
        .enforce_on_chain(&policy_chain(), &[accept_rule()])
        .unwrap();
    assert_eq!(chain, "vpa--1700000000000000");

    assert_eq!(
        iptables.calls(),
        vec![
            Call::NewChain("filter".into(), "vpa--1700000000000000".into()),
            Call::BulkInsert(
                "filter".into(),
                "FORWARD".into(),
                1,
                vec![IpTablesRule::jump("vpa--1700000000000000")],
            ),
            Call::BulkAppend(
                "filter".into(),
                "vpa--1700000000000000".into(),
                vec![accept_rule()],
            ),
            Call::List("filter".into(), "FORWARD".into()),
        ]
    );
}

#[test]
fn a_newer_generation_reaps_the_older_one() {
    let iptables = Arc::new(FakeIpTables::default().with_listing(
        "filter",
        "FORWARD",
        &[
            "-A FORWARD -j vpa--1700000000000001",
            "-A FORWARD -j vpa--1700000000000000",
        ],
    ));
    let enforcer = enforcer(iptables.clone(), 1700000000000001);

    let chain = enforcer
        .enforce_on_chain(&policy_chain(), &[accept_rule()])
        .unwrap();
    assert_eq!(chain, "vpa--1700000000000001");

    let calls = iptables.calls();
    let cleanup = &calls[4..];
    assert_eq!(
        cleanup,
        &[
            Call::Delete(
                "filter".into(),
                "FORWARD".into(),
                IpTablesRule::jump("vpa--1700000000000000"),
            ),
            Call::List("filter".into(), "vpa--1700000000000000".into()),
            Call::ClearChain("filter".into(), "vpa--1700000000000000".into()),
            Call::DeleteChain("filter".into(), "vpa--1700000000000000".into()),
        ]
    );
}

#[test]
fn disabling_container_network_policy_prepends_the_overlay_accept() {
    let iptables = Arc::new(FakeIpTables::default());
    let enforcer = Enforcer::new(
        iptables.clone(),
        Arc::new(FixedTimestamper(1700000000000000)),
        EnforcerConfig {
            disable_container_network_policy: true,
            overlay_network: Some("10.255.0.0/16".parse().unwrap()),
        },
    );

    enforcer
        .enforce_on_chain(&policy_chain(), &[accept_rule()])
        .unwrap();

    let appended = iptables.calls().into_iter().find_map(|call| match call {
        Call::BulkAppend(_, _, rules) => Some(rules),
        _ => None,
    });
    assert_eq!(
        appended.unwrap(),
        vec![
            IpTablesRule::from(["-s", "10.255.0.0/16", "-j", "ACCEPT"]),
            accept_rule(),
        ]
    );
}

#[test]
fn chain_creation_failure_aborts_before_touching_the_parent() {
    let iptables = Arc::new(FakeIpTables::default().failing("new-chain"));
    let enforcer = enforcer(iptables.clone(), 1700000000000000);

    let err = enforcer
        .enforce_on_chain(&policy_chain(), &[accept_rule()])
        .unwrap_err();
    assert!(err.to_string().starts_with("creating chain:"));
    assert!(err.applied_chain().is_none());
    assert_eq!(iptables.calls().len(), 1);
}

#[test]
fn jump_insertion_failure_rolls_back_the_new_chain() {
    let iptables = Arc::new(FakeIpTables::default().failing("bulk-insert"));
    let enforcer = enforcer(iptables.clone(), 1700000000000000);

    let err = enforcer
        .enforce_on_chain(&policy_chain(), &[accept_rule()])
        .unwrap_err();
    assert!(err.to_string().starts_with("inserting chain:"));

    let calls = iptables.calls();
    assert!(calls.contains(&Call::DeleteChain(
        "filter".into(),
        "vpa--1700000000000000".into()
    )));
    // The jump never landed, so there is no parent reference to remove.
    assert!(!calls
        .iter()
        .any(|c| matches!(c, Call::Delete(_, parent, _) if parent == "FORWARD")));
}

#[test]
fn append_failure_unlinks_and_rolls_back_the_new_chain() {
    let iptables = Arc::new(FakeIpTables::default().failing("bulk-append"));
    let enforcer = enforcer(iptables.clone(), 1700000000000000);

    let err = enforcer
        .enforce_on_chain(&policy_chain(), &[accept_rule()])
        .unwrap_err();
    assert!(err.to_string().starts_with("bulk appending:"));

    let calls = iptables.calls();
    assert!(calls.contains(&Call::Delete(
        "filter".into(),
        "FORWARD".into(),
        IpTablesRule::jump("vpa--1700000000000000"),
    )));
    assert!(calls.contains(&Call::DeleteChain(
        "filter".into(),
        "vpa--1700000000000000".into()
    )));
}

#[test]
fn cleanup_failures_still_report_the_live_chain() {
    // Listing the parent for the reap pass is the first cleanup step.
    let iptables = Arc::new(FakeIpTables::default().failing("list"));
    let enforcer = enforcer(iptables.clone(), 1700000000000000);

    let err = enforcer
        .enforce_on_chain(&policy_chain(), &[accept_rule()])
        .unwrap_err();

    assert!(err.to_string().starts_with("cleaning up:"));
    assert_eq!(err.applied_chain(), Some("vpa--1700000000000000"));
}

#[test]
fn parent_chain_residue_is_stripped_when_configured() {
    let mut chain = policy_chain();
    chain.parent_chain = "netout-some-handle".to_string();
    chain.cleanup_parent_chain = true;

    let iptables = Arc::new(FakeIpTables::default().with_listing(
        "filter",
        "netout-some-handle",
        &["-A netout-some-handle -j vpa--1700000000000000"],
    ));
    let enforcer = enforcer(iptables.clone(), 1700000000000000);
    enforcer.enforce_on_chain(&chain, &[accept_rule()]).unwrap();

    assert_eq!(
        iptables.calls().last(),
        Some(&Call::DeleteAfterRuleNumKeepReject(
            "filter".into(),
            "netout-some-handle".into(),
            2,
        ))
    );
}

#[test]
fn deleting_a_generation_follows_its_log_subchain_gotos() {
    let iptables = Arc::new(
        FakeIpTables::default()
            .with_listing(
                "filter",
                "FORWARD",
                &[
                    "-A FORWARD -j vpa--1700000000000001",
                    "-A FORWARD -j vpa--1700000000000000",
                ],
            )
            .with_listing(
                "filter",
                "vpa--1700000000000000",
                &["-A vpa--1700000000000000 -p tcp -g netout-some-handle-log"],
            ),
    );
    let enforcer = enforcer(iptables.clone(), 1700000000000001);
    enforcer
        .enforce_on_chain(&policy_chain(), &[accept_rule()])
        .unwrap();

    assert!(iptables.calls().contains(&Call::DeleteChain(
        "filter".into(),
        "netout-some-handle-log".into()
    )));
}

#[test]
fn clean_chains_matching_deletes_only_undesired_matches() {
    let iptables = Arc::new(FakeIpTables::default().with_chains(&[
        "FORWARD",
        "asg-aaaaaa-1700000000000000",
        "asg-bbbbbb-1700000000000000",
        "netout-some-handle",
    ]));
    let enforcer = enforcer(iptables.clone(), 1700000000000000);

    let desired = vec![LiveChain {
        table: "filter".to_string(),
        name: "asg-aaaaaa-1700000000000000".to_string(),
    }];
    let deleted = enforcer
        .clean_chains_matching(&Regex::new(ASG_PATTERN).unwrap(), &desired)
        .unwrap();

    assert_eq!(
        deleted,
        vec![LiveChain {
            table: "filter".to_string(),
            name: "asg-bbbbbb-1700000000000000".to_string(),
        }]
    );
    assert!(iptables.calls().contains(&Call::DeleteChain(
        "filter".into(),
        "asg-bbbbbb-1700000000000000".into()
    )));
    assert!(!iptables.calls().contains(&Call::DeleteChain(
        "filter".into(),
        "asg-aaaaaa-1700000000000000".into()
    )));
}
