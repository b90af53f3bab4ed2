//! Akerun access API client
//!
//! Fetches door-access history for the configured organization. The trait
//! seam lets the poller run against a mock source in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::PollerError;
use crate::config::AkerunConfig;
use crate::daily_bonus::AccessRecord;

#[async_trait]
pub trait AccessEventSource: Send + Sync {
    /// Access events in the half-open interval `[from, to)`, oldest first.
    async fn fetch_accesses(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AccessRecord>, PollerError>;
}

pub struct AkerunClient {
    http: reqwest::Client,
    config: AkerunConfig,
}

impl AkerunClient {
    pub fn new(config: AkerunConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl AccessEventSource for AkerunClient {
    async fn fetch_accesses(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AccessRecord>, PollerError> {
        let url = format!(
            "{}/organizations/{}/accesses",
            self.config.base_url, self.config.organization_id
        );

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.config.api_token)
            .query(&[
                ("accessed_at_from", from.to_rfc3339()),
                ("accessed_at_to", to.to_rfc3339()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PollerError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let payload: AccessesResponse = response.json().await?;
        let mut records = Vec::with_capacity(payload.accesses.len());
        for access in payload.accesses {
            let Some(name) = access.user.and_then(|u| u.name) else {
                tracing::debug!(access_id = access.id, "Access entry without a user name - skipping");
                continue;
            };
            // The API range is inclusive on both ends; keep our half-open
            // contract so adjacent windows never hand over the same event.
            if access.accessed_at < from || access.accessed_at >= to {
                continue;
            }
            records.push(AccessRecord {
                external_id: access.id.to_string(),
                user_name: name,
                accessed_at: access.accessed_at,
            });
        }

        tracing::debug!(
            count = records.len(),
            %from,
            %to,
            "Fetched access events"
        );
        Ok(records)
    }
}

#[derive(Debug, Deserialize)]
struct AccessesResponse {
    #[serde(default)]
    accesses: Vec<AccessDto>,
}

#[derive(Debug, Deserialize)]
struct AccessDto {
    id: i64,
    accessed_at: DateTime<Utc>,
    user: Option<AkerunUserDto>,
}

#[derive(Debug, Deserialize)]
struct AkerunUserDto {
    name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parsing() {
        let json = r#"{
            "accesses": [
                {"id": 101, "accessed_at": "2026-03-02T08:15:00Z", "user": {"name": "Alice"}},
                {"id": 102, "accessed_at": "2026-03-02T08:20:00Z", "user": null},
                {"id": 103, "accessed_at": "2026-03-02T08:25:00Z", "user": {"name": null}}
            ]
        }"#;
        let parsed: AccessesResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.accesses.len(), 3);
        assert_eq!(
            parsed.accesses[0].user.as_ref().unwrap().name.as_deref(),
            Some("Alice")
        );
        assert!(parsed.accesses[1].user.is_none());
    }

    #[test]
    fn test_empty_response() {
        let parsed: AccessesResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.accesses.is_empty());
    }
}
