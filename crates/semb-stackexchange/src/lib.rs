//! Stack Exchange API adapter.
//!
//! Implements the core `ReputationSource` port against the Stack Exchange
//! API 2.3 (`/users` for resolution, `/users/{id}` for reputation) and honors
//! the API's `backoff` field by pausing requests to that site.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::{sync::Mutex, time::Instant};
use tracing::debug;

use semb_core::{
    config::Config,
    domain::{AccountId, SiteId, Username},
    errors::Error,
    ports::{Reputation, ReputationSource},
    Result,
};

pub struct StackExchangeClient {
    http: reqwest::Client,
    api_base: String,
    app_key: Option<String>,
    /// Per-site not-before instants from the API's `backoff` field.
    backoff_until: Mutex<HashMap<SiteId, Instant>>,
}

#[derive(Debug, Deserialize)]
struct ApiWrapper<T> {
    #[serde(default)]
    items: Vec<T>,
    backoff: Option<u64>,
    error_id: Option<u32>,
    error_message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiUser {
    user_id: u64,
    display_name: String,
    reputation: i64,
}

impl StackExchangeClient {
    pub fn new(cfg: &Config) -> Self {
        let http = reqwest::Client::builder()
            .timeout(cfg.fetch_timeout)
            .build()
            .expect("reqwest client build");
        Self {
            http,
            api_base: cfg.se_api_base.clone(),
            app_key: cfg.se_app_key.clone(),
            backoff_until: Mutex::new(HashMap::new()),
        }
    }

    async fn check_backoff(&self, site: &SiteId) -> Result<()> {
        let map = self.backoff_until.lock().await;
        if let Some(until) = map.get(site) {
            if Instant::now() < *until {
                return Err(Error::Fetch {
                    site: site.clone(),
                    reason: "site backoff in effect".to_string(),
                });
            }
        }
        Ok(())
    }

    async fn note_backoff(&self, site: &SiteId, seconds: Option<u64>) {
        let Some(seconds) = seconds else {
            return;
        };
        debug!(%site, seconds, "stack exchange requested backoff");
        let mut map = self.backoff_until.lock().await;
        map.insert(
            site.clone(),
            Instant::now() + std::time::Duration::from_secs(seconds),
        );
    }

    async fn get_users(&self, site: &SiteId, path: &str, extra: &[(&str, &str)]) -> Result<Vec<ApiUser>> {
        self.check_backoff(site).await?;

        let url = format!("{}/{path}", self.api_base);
        let mut query: Vec<(&str, &str)> = vec![("site", site.0.as_str())];
        query.extend_from_slice(extra);
        if let Some(key) = &self.app_key {
            query.push(("key", key.as_str()));
        }

        let resp = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| Error::Fetch {
                site: site.clone(),
                reason: format!("request error: {e}"),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Fetch {
                site: site.clone(),
                reason: format!(
                    "http {status}: {}",
                    body.chars().take(200).collect::<String>()
                ),
            });
        }

        let wrapper: ApiWrapper<ApiUser> = resp.json().await.map_err(|e| Error::Fetch {
            site: site.clone(),
            reason: format!("json error: {e}"),
        })?;

        self.note_backoff(site, wrapper.backoff).await;

        if let Some(error_id) = wrapper.error_id {
            return Err(Error::Fetch {
                site: site.clone(),
                reason: format!(
                    "api error {error_id}: {}",
                    wrapper.error_message.unwrap_or_default()
                ),
            });
        }

        Ok(wrapper.items)
    }
}

#[async_trait]
impl ReputationSource for StackExchangeClient {
    async fn resolve_account(
        &self,
        site: &SiteId,
        username: &Username,
    ) -> Result<Option<AccountId>> {
        let users = self
            .get_users(
                site,
                "users",
                &[
                    ("inname", username.0.as_str()),
                    ("pagesize", "20"),
                    ("sort", "name"),
                    ("order", "asc"),
                ],
            )
            .await?;

        // `inname` is a substring match; only exact display-name matches count.
        let matching = exact_matches(&users, &username.0);
        match matching.len() {
            0 => Ok(None),
            1 => Ok(Some(AccountId(matching[0].user_id))),
            n => Err(Error::Resolution {
                site: site.clone(),
                username: username.clone(),
                reason: format!("{n} candidates share this username"),
            }),
        }
    }

    async fn fetch_reputation(&self, site: &SiteId, account: AccountId) -> Result<Reputation> {
        let users = self
            .get_users(site, &format!("users/{}", account.0), &[])
            .await?;

        let Some(user) = users.first() else {
            return Err(Error::Fetch {
                site: site.clone(),
                reason: format!("no such user id {account}"),
            });
        };

        Ok(Reputation {
            value: user.reputation,
            at: Utc::now(),
        })
    }
}

fn exact_matches<'a>(users: &'a [ApiUser], username: &str) -> Vec<&'a ApiUser> {
    users
        .iter()
        .filter(|u| u.display_name.eq_ignore_ascii_case(username))
        .collect()
}
