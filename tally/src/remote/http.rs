//! HTTP remote store
//!
//! Talks to a PostgREST-style endpoint (`{base}/rest/v1/{table}`). Transport
//! failures and HTTP statuses are turned into [`RemoteError`] tags here and
//! nowhere else.

use super::{PageRequest, RemoteError, RemoteResult, RemoteStore};
use crate::database::Table;
use crate::error::{AppError, Result};
use crate::session::Session;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

/// Error body returned by the REST layer
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
    api_key: String,
    session: Session,
}

impl HttpRemote {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        timeout: Duration,
        session: Session,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Generic(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            session,
        })
    }

    fn table_url(&self, table: Table) -> String {
        format!("{}/rest/v1/{}", self.base_url, table.as_str())
    }

    /// Attach the api key and, when signed in, the actor's bearer token
    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        let token = self
            .session
            .actor()
            .map(|actor| actor.access_token)
            .unwrap_or_else(|| self.api_key.clone());

        builder
            .header("apikey", &self.api_key)
            .bearer_auth(token)
    }

    async fn send(&self, builder: RequestBuilder) -> RemoteResult<Response> {
        let response = self
            .authorize(builder)
            .send()
            .await
            .map_err(transport_error)?;

        check_status(response).await
    }

    /// Send a request that returns `representation` rows
    async fn send_rows(&self, builder: RequestBuilder) -> RemoteResult<Vec<Value>> {
        let response = self.send(builder).await?;
        response
            .json::<Vec<Value>>()
            .await
            .map_err(|e| RemoteError::rejected("invalid_response", e.to_string()))
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn insert(&self, table: Table, row: &Value) -> RemoteResult<Value> {
        let builder = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "return=representation")
            .json(row);

        first_row(self.send_rows(builder).await?, table)
    }

    async fn update(&self, table: Table, id: &str, patch: &Value) -> RemoteResult<Value> {
        let builder = self
            .client
            .patch(self.table_url(table))
            .query(&[("id", format!("eq.{}", id))])
            .header("Prefer", "return=representation")
            .json(patch);

        first_row(self.send_rows(builder).await?, table)
    }

    async fn soft_delete(
        &self,
        table: Table,
        id: &str,
        deleted_at: DateTime<Utc>,
    ) -> RemoteResult<()> {
        let stamp = deleted_at.to_rfc3339_opts(SecondsFormat::Millis, true);
        let builder = self
            .client
            .patch(self.table_url(table))
            .query(&[("id", format!("eq.{}", id))])
            .header("Prefer", "return=minimal")
            .json(&serde_json::json!({ "deleted_at": stamp, "updated_at": stamp }));

        self.send(builder).await?;
        Ok(())
    }

    async fn list(&self, table: Table, page: &PageRequest) -> RemoteResult<Vec<Value>> {
        let direction = if page.ascending { "asc" } else { "desc" };
        let mut query = vec![
            ("select", "*".to_string()),
            ("order", format!("updated_at.{},id.asc", direction)),
            ("offset", page.offset.to_string()),
            ("limit", page.limit.to_string()),
        ];
        if let Some(after) = page.updated_after {
            query.push((
                "updated_at",
                format!("gt.{}", after.to_rfc3339_opts(SecondsFormat::Micros, true)),
            ));
        }

        let builder = self.client.get(self.table_url(table)).query(&query);
        self.send_rows(builder).await
    }

    async fn get_one(&self, table: Table, id: &str) -> RemoteResult<Option<Value>> {
        let builder = self
            .client
            .get(self.table_url(table))
            .query(&[("id", format!("eq.{}", id)), ("limit", "1".to_string())]);

        Ok(self.send_rows(builder).await?.into_iter().next())
    }

    async fn ping(&self) -> RemoteResult<()> {
        let builder = self.client.head(format!("{}/rest/v1/", self.base_url));
        self.authorize(builder)
            .send()
            .await
            .map_err(transport_error)?;
        Ok(())
    }
}

fn first_row(rows: Vec<Value>, table: Table) -> RemoteResult<Value> {
    rows.into_iter().next().ok_or_else(|| {
        RemoteError::rejected("404", format!("No {} row returned", table.as_str()))
    })
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        RemoteError::connectivity(err.to_string())
    } else {
        RemoteError::rejected("transport", err.to_string())
    }
}

async fn check_status(response: Response) -> RemoteResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    Err(status_error(status, &text))
}

/// Build a tagged error from a failed response status and body
fn status_error(status: StatusCode, body: &str) -> RemoteError {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|b| b.message.clone())
        .unwrap_or_else(|| body.to_string());

    match RemoteError::from_status(status.as_u16(), message) {
        RemoteError::Rejected { code, message } => RemoteError::Rejected {
            code: parsed.and_then(|b| b.code).unwrap_or(code),
            message,
        },
        other => other,
    }
}
