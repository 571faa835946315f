#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Deterministic assembly of per-container egress chains from user allow
//! rules, deny-network lists, rate limits, logging, and stateful-connection
//! defaults.

mod chain;
mod converter;
mod namer;
mod rule;

pub use self::{
    chain::{DenyNetworks, NetOutChain, NetOutError, OutConn, Workload},
    converter::{Converter, RuleConverter},
    namer::{ChainNamer, Namer, NamerError, MAX_CHAIN_NAME_LENGTH},
    rule::{IcmpControl, IpRange, NetOutRule, PortRange, Protocol},
};
