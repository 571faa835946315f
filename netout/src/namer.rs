use anyhow::Result;
use thiserror::Error;

/// The kernel rejects chain names longer than this.
pub const MAX_CHAIN_NAME_LENGTH: usize = 28;

/// Derives kernel chain names from container handles and suffixes, keeping
/// them within the kernel's length budget.
pub trait ChainNamer: Send + Sync {
    /// `<prefix>-<handle>`, truncated to fit.
    fn prefix(&self, prefix: &str, handle: &str) -> String;

    /// `<body>-<suffix>`, truncating the body (never the suffix) to fit.
    fn postfix(&self, body: &str, suffix: &str) -> Result<String>;
}

#[derive(Debug, Error)]
pub enum NamerError {
    #[error("suffix {suffix:?} leaves no room for a chain name")]
    SuffixTooLong { suffix: String },
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Namer;

impl ChainNamer for Namer {
    fn prefix(&self, prefix: &str, handle: &str) -> String {
        let mut name = format!("{prefix}-{handle}");
        name.truncate(MAX_CHAIN_NAME_LENGTH);
        name
    }

    fn postfix(&self, body: &str, suffix: &str) -> Result<String> {
        // The suffix is what distinguishes the subchain; keep it whole and
        // trim the body instead.
        let budget = MAX_CHAIN_NAME_LENGTH
            .checked_sub(suffix.len() + 1)
            .filter(|&n| n > 0)
            .ok_or_else(|| NamerError::SuffixTooLong {
                suffix: suffix.to_string(),
            })?;

        let body = &body[..body.len().min(budget)];
        Ok(format!("{body}-{suffix}"))
    }
}
