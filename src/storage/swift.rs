use super::traits::{ObjectInfo, ObjectStore, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;

const AUTH_HEADER: &str = "X-Auth-Token";
const LISTING_LIMIT: usize = 10_000;

/// Object store backed by the Swift REST API.
#[derive(Debug, Clone)]
pub struct SwiftStore {
    base_url: Url,
    auth_token: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ListingEntry {
    name: String,
    #[serde(default)]
    bytes: u64,
    last_modified: Option<String>,
    hash: Option<String>,
}

impl SwiftStore {
    /// `storage_url` is the API root without the account, e.g.
    /// `https://swift.example.com/v1`.
    pub fn new(storage_url: &str, auth_token: &str, timeout: Duration) -> Result<Self, StorageError> {
        let base_url = Url::parse(storage_url)
            .map_err(|e| StorageError::Backend(format!("invalid storage_url '{}': {}", storage_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(StorageError::Backend(format!(
                "storage_url '{}' cannot be used as a base URL",
                storage_url
            )));
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            base_url,
            auth_token: auth_token.to_string(),
            client,
        })
    }

    fn url(&self, account: &str, container: &str, name: Option<&str>) -> Result<Url, StorageError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| StorageError::Backend("storage_url cannot be a base".to_string()))?;
            segments.pop_if_empty().push(account).push(container);
            if let Some(name) = name {
                segments.extend(name.split('/'));
            }
        }
        Ok(url)
    }

    fn check(response: &reqwest::Response, path: &str) -> Result<(), StorageError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            return Err(StorageError::Status {
                status: status.as_u16(),
                path: path.to_string(),
            });
        }
        Ok(())
    }
}

fn parse_last_modified(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[async_trait]
impl ObjectStore for SwiftStore {
    async fn list(
        &self,
        account: &str,
        container: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<ObjectInfo>, StorageError> {
        let path = format!("{}/{}", account, container);
        let mut objects = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut url = self.url(account, container, None)?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("format", "json");
                query.append_pair("limit", &LISTING_LIMIT.to_string());
                if let Some(prefix) = prefix {
                    query.append_pair("prefix", prefix);
                }
                if let Some(marker) = &marker {
                    query.append_pair("marker", marker);
                }
            }

            let response = self
                .client
                .get(url)
                .header(AUTH_HEADER, &self.auth_token)
                .send()
                .await?;

            if response.status() == StatusCode::NOT_FOUND {
                return Ok(Vec::new());
            }
            Self::check(&response, &path)?;
            if response.status() == StatusCode::NO_CONTENT {
                break;
            }

            let page: Vec<ListingEntry> = response.json().await?;
            let page_len = page.len();
            marker = page.last().map(|entry| entry.name.clone());

            objects.extend(page.into_iter().map(|entry| ObjectInfo {
                last_modified: entry.last_modified.as_deref().and_then(parse_last_modified),
                name: entry.name,
                size: entry.bytes,
                etag: entry.hash,
            }));

            if page_len < LISTING_LIMIT {
                break;
            }
        }

        tracing::debug!(path = %path, count = objects.len(), "Listed container");
        Ok(objects)
    }

    async fn get(&self, account: &str, container: &str, name: &str) -> Result<Bytes, StorageError> {
        let path = format!("{}/{}/{}", account, container, name);
        let response = self
            .client
            .get(self.url(account, container, Some(name))?)
            .header(AUTH_HEADER, &self.auth_token)
            .send()
            .await?;
        Self::check(&response, &path)?;
        Ok(response.bytes().await?)
    }

    async fn put(
        &self,
        account: &str,
        container: &str,
        name: &str,
        data: Bytes,
    ) -> Result<(), StorageError> {
        let path = format!("{}/{}/{}", account, container, name);
        let response = self
            .client
            .put(self.url(account, container, Some(name))?)
            .header(AUTH_HEADER, &self.auth_token)
            .body(data)
            .send()
            .await?;
        Self::check(&response, &path)
    }

    async fn delete(&self, account: &str, container: &str, name: &str) -> Result<(), StorageError> {
        let path = format!("{}/{}/{}", account, container, name);
        let response = self
            .client
            .delete(self.url(account, container, Some(name))?)
            .header(AUTH_HEADER, &self.auth_token)
            .send()
            .await?;
        Self::check(&response, &path)
    }

    async fn create_container(&self, account: &str, container: &str) -> Result<(), StorageError> {
        let path = format!("{}/{}", account, container);
        let response = self
            .client
            .put(self.url(account, container, None)?)
            .header(AUTH_HEADER, &self.auth_token)
            .send()
            .await?;
        Self::check(&response, &path)
    }
}
