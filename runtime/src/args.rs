use anyhow::Result;
use ipnet::IpNet;
use policy_agent_enforcer::EnforcerConfig;
use policy_agent_iptables::LockedIpTables;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Poll cadence and enforcement toggles. Embedding daemons flatten this into
/// their own command line.
#[derive(Clone, Debug, clap::Args)]
pub struct AgentArgs {
    /// Seconds between policy poll cycles.
    #[clap(
        long,
        env = "POLICY_AGENT_POLL_INTERVAL",
        default_value = "30",
        value_name = "SECONDS"
    )]
    pub policy_poll_interval: u64,

    /// Seconds between full ASG sweeps.
    #[clap(
        long,
        env = "POLICY_AGENT_ASG_POLL_INTERVAL",
        default_value = "60",
        value_name = "SECONDS"
    )]
    pub asg_poll_interval: u64,

    /// Replace container network policy with a blanket accept on the overlay
    /// network.
    #[clap(long, env = "POLICY_AGENT_DISABLE_CONTAINER_NETWORK_POLICY")]
    pub disable_container_network_policy: bool,

    /// The overlay network the blanket accept applies to.
    #[clap(long, env = "POLICY_AGENT_OVERLAY_NETWORK")]
    pub overlay_network: Option<IpNet>,
}

impl AgentArgs {
    pub fn policy_interval(&self) -> Duration {
        Duration::from_secs(self.policy_poll_interval)
    }

    pub fn asg_interval(&self) -> Duration {
        Duration::from_secs(self.asg_poll_interval)
    }

    pub fn enforcer_config(&self) -> EnforcerConfig {
        EnforcerConfig {
            disable_container_network_policy: self.disable_container_network_policy,
            overlay_network: self.overlay_network,
        }
    }
}

#[derive(Clone, Debug, clap::Args)]
pub struct IpTablesArgs {
    /// Manage the IPv6 packet filter (ip6tables) instead of IPv4.
    #[clap(long, env = "POLICY_AGENT_IPTABLES_IPV6")]
    pub iptables_ipv6: bool,
}

impl IpTablesArgs {
    pub fn executor(&self) -> Result<LockedIpTables> {
        LockedIpTables::with_family(self.iptables_ipv6)
    }
}

#[derive(Clone, Debug, clap::Args)]
pub struct AdminArgs {
    /// Address the admin server (metrics, liveness) listens on.
    #[clap(long, env = "POLICY_AGENT_ADMIN_ADDR", default_value = "0.0.0.0:9090")]
    pub admin_addr: SocketAddr,
}

#[derive(Clone, Debug, clap::Args)]
pub struct LogArgs {
    #[clap(
        long,
        env = "POLICY_AGENT_LOG_LEVEL",
        default_value = "policy_agent=info,warn"
    )]
    pub log_level: String,

    #[clap(long, env = "POLICY_AGENT_LOG_FORMAT", default_value = "plain")]
    pub log_format: LogFormat,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plain" => Ok(Self::Plain),
            "json" => Ok(Self::Json),
            _ => Err(anyhow::anyhow!("invalid log format {s:?}; expected plain or json")),
        }
    }
}

impl LogArgs {
    /// Installs the global tracing subscriber.
    pub fn try_init(&self) -> Result<()> {
        let filter = EnvFilter::try_new(&self.log_level)?;
        let registry = tracing_subscriber::registry().with(filter);
        match self.log_format {
            LogFormat::Plain => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
            LogFormat::Json => registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()?,
        }
        Ok(())
    }
}
