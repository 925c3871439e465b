use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    domain::{AccountId, SiteId, Username},
    Result,
};

/// A reputation observation from an external site.
#[derive(Clone, Copy, Debug)]
pub struct Reputation {
    pub value: i64,
    pub at: DateTime<Utc>,
}

/// Port for an external reputation source (Stack Exchange API today).
///
/// The concrete protocol lives in adapter crates; the poller only sees this.
#[async_trait]
pub trait ReputationSource: Send + Sync {
    /// Look up the site account for a username. `Ok(None)` means the username
    /// does not exist on that site (permanent); `Err` is transient.
    async fn resolve_account(&self, site: &SiteId, username: &Username)
        -> Result<Option<AccountId>>;

    /// Fetch the current reputation of a resolved account.
    async fn fetch_reputation(&self, site: &SiteId, account: AccountId) -> Result<Reputation>;
}
