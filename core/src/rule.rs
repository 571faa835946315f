use serde::{Deserialize, Serialize};
use std::fmt;

/// An argv-style iptables rule body: an ordered sequence of tokens passed
/// verbatim to the kernel adapter. Equality is token-wise. Quoting inside a
/// single token (e.g. a log prefix with embedded spaces) is the caller's
/// responsibility.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IpTablesRule(Vec<String>);

impl IpTablesRule {
    pub fn new(tokens: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(tokens.into_iter().map(Into::into).collect())
    }

    /// A `-j <target>` rule, as inserted into parent chains to make a
    /// generation chain live.
    pub fn jump(target: &str) -> Self {
        Self::new(["-j", target])
    }

    pub fn tokens(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for IpTablesRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

impl<T: Into<String>, const N: usize> From<[T; N]> for IpTablesRule {
    fn from(tokens: [T; N]) -> Self {
        Self::new(tokens)
    }
}
