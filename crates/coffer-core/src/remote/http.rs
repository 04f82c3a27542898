use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;

use super::{RemoteBackend, RemoteRow};
use crate::auth::Principal;
use crate::error::{Result, VaultError};

/// REST transport:
/// `GET|PUT|DELETE {base}/vault/{user_id}/rows/{key}` and
/// `GET {base}/vault/{user_id}/keys`, bearer-authenticated.
#[derive(Clone)]
pub struct HttpRemoteBackend {
    client: reqwest::Client,
    base_url: Url,
}

#[derive(Deserialize)]
struct KeyList {
    keys: Vec<String>,
}

impl HttpRemoteBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| VaultError::RemoteUnavailable(format!("invalid remote url: {e}")))?;
        let client = reqwest::Client::builder()
            .user_agent("coffer-core/0.1")
            .timeout(timeout)
            .build()?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| VaultError::RemoteUnavailable("remote url cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn row_url(&self, principal: &Principal, key: &str) -> Result<Url> {
        self.endpoint(&["vault", &principal.user_id, "rows", key])
    }

    fn authorize(&self, req: RequestBuilder, principal: &Principal) -> RequestBuilder {
        match &principal.access_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

fn check_status(status: StatusCode, op: &str) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(VaultError::Unauthenticated);
    }
    Err(VaultError::RemoteUnavailable(format!(
        "{op} failed with status {status}"
    )))
}

#[async_trait]
impl RemoteBackend for HttpRemoteBackend {
    async fn fetch(&self, principal: &Principal, key: &str) -> Result<Option<RemoteRow>> {
        let url = self.row_url(principal, key)?;
        let res = self
            .authorize(self.client.get(url), principal)
            .send()
            .await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        check_status(res.status(), "fetch")?;
        let row: RemoteRow = res.json().await?;
        if row.user_id != principal.user_id || row.key != key {
            return Err(VaultError::RemoteUnavailable(
                "server returned a row for another owner".into(),
            ));
        }
        Ok(Some(row))
    }

    async fn upsert(&self, principal: &Principal, row: RemoteRow) -> Result<()> {
        let url = self.row_url(principal, &row.key)?;
        let res = self
            .authorize(self.client.put(url), principal)
            .json(&row)
            .send()
            .await?;
        check_status(res.status(), "upsert")
    }

    async fn delete(&self, principal: &Principal, key: &str) -> Result<()> {
        let url = self.row_url(principal, key)?;
        let res = self
            .authorize(self.client.delete(url), principal)
            .send()
            .await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(res.status(), "delete")
    }

    async fn list_keys(&self, principal: &Principal) -> Result<Vec<String>> {
        let url = self.endpoint(&["vault", &principal.user_id, "keys"])?;
        let res = self
            .authorize(self.client.get(url), principal)
            .send()
            .await?;
        check_status(res.status(), "list keys")?;
        let body: KeyList = res.json().await?;
        Ok(body.keys)
    }
}
