use crate::config::PublisherConfig;
use crate::snapshot::{HealthSnapshot, SnapshotRecord, DATE_TIME_FORMAT};
use chrono::NaiveDateTime;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("request to document store failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("document store answered {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("invalid document store URL: {0}")]
    Url(String),
    #[error("failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A record as inserted: the snapshot fields plus its document type.
#[derive(Debug, Clone, Serialize)]
pub struct Document<'a> {
    pub doctype: &'a str,
    #[serde(flatten)]
    pub record: &'a SnapshotRecord,
}

/// Persistence collaborator for snapshot documents.
#[allow(async_fn_in_trait)]
pub trait DocumentStore {
    /// Inserts one document and returns the store's status code.
    async fn insert(&self, doc: &Document<'_>) -> Result<u16, PublishError>;
    /// Deletes documents of `doctype` created before `cutoff`; returns how many.
    async fn delete_older_than(
        &self,
        doctype: &str,
        cutoff: NaiveDateTime,
    ) -> Result<usize, PublishError>;
}

pub struct RestStore {
    client: Client,
    base_url: Url,
    authorization: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    data: Vec<ListedDocument>,
}

#[derive(Debug, Deserialize)]
struct ListedDocument {
    name: String,
}

impl RestStore {
    pub fn new(cfg: &PublisherConfig, authorization: String) -> Result<Self, PublishError> {
        let base_url =
            Url::parse(cfg.url.trim()).map_err(|err| PublishError::Url(err.to_string()))?;
        let client = Client::builder()
            .user_agent(concat!("resmon/", env!("CARGO_PKG_VERSION")))
            .timeout(cfg.timeout())
            .build()?;
        Ok(Self {
            client,
            base_url,
            authorization,
        })
    }

    fn resource_url(&self, doctype: &str, name: Option<&str>) -> Result<Url, PublishError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| PublishError::Url(self.base_url.to_string()))?;
            segments.pop_if_empty().push("api").push("resource").push(doctype);
            if let Some(name) = name {
                segments.push(name);
            }
        }
        Ok(url)
    }
}

impl DocumentStore for RestStore {
    async fn insert(&self, doc: &Document<'_>) -> Result<u16, PublishError> {
        let url = self.resource_url(doc.doctype, None)?;
        let resp = self
            .client
            .post(url)
            .header(AUTHORIZATION, &self.authorization)
            .json(doc)
            .send()
            .await?;
        ensure_success(resp).await
    }

    async fn delete_older_than(
        &self,
        doctype: &str,
        cutoff: NaiveDateTime,
    ) -> Result<usize, PublishError> {
        let cutoff_text = cutoff.format(DATE_TIME_FORMAT).to_string();
        let filters = serde_json::to_string(&[["creation", "<", cutoff_text.as_str()]])?;
        let list_url = self.resource_url(doctype, None)?;
        let resp = self
            .client
            .get(list_url)
            .header(AUTHORIZATION, &self.authorization)
            .query(&[("filters", filters.as_str()), ("limit_page_length", "0")])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PublishError::Status { status, body });
        }
        let listed: ListResponse = resp.json().await?;

        let mut deleted = 0;
        for doc in &listed.data {
            let url = self.resource_url(doctype, Some(&doc.name))?;
            let resp = self
                .client
                .delete(url)
                .header(AUTHORIZATION, &self.authorization)
                .send()
                .await?;
            ensure_success(resp).await?;
            debug!(doctype = %doctype, name = %doc.name, "deleted expired document");
            deleted += 1;
        }
        Ok(deleted)
    }
}

async fn ensure_success(resp: reqwest::Response) -> Result<u16, PublishError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(status.as_u16());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(PublishError::Status { status, body })
}

/// Prints documents instead of storing them.
pub struct StdoutStore;

impl DocumentStore for StdoutStore {
    async fn insert(&self, doc: &Document<'_>) -> Result<u16, PublishError> {
        println!("{}", serde_json::to_string_pretty(doc)?);
        Ok(StatusCode::OK.as_u16())
    }

    async fn delete_older_than(
        &self,
        doctype: &str,
        cutoff: NaiveDateTime,
    ) -> Result<usize, PublishError> {
        println!("would delete '{doctype}' documents created before {cutoff}");
        Ok(0)
    }
}

/// Stores one snapshot under `doctype`. One attempt, no retry.
pub async fn publish<S: DocumentStore>(
    store: &S,
    doctype: &str,
    snapshot: &HealthSnapshot,
) -> Result<u16, PublishError> {
    let record = snapshot.to_record();
    let doc = Document {
        doctype,
        record: &record,
    };
    let status = store.insert(&doc).await?;
    info!(
        site = %snapshot.server_information,
        status,
        "snapshot published"
    );
    Ok(status)
}

/// Removes snapshots older than `retention_days` relative to `now`.
pub async fn prune<S: DocumentStore>(
    store: &S,
    doctype: &str,
    retention_days: u32,
    now: NaiveDateTime,
) -> Result<usize, PublishError> {
    let cutoff = now - chrono::Duration::days(i64::from(retention_days));
    let deleted = store.delete_older_than(doctype, cutoff).await?;
    info!(doctype = %doctype, cutoff = %cutoff, deleted, "expired snapshots removed");
    Ok(deleted)
}
