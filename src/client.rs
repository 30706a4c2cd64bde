//! Thin HTTP client behind the `query`, `ingest`, and `metrics` CLI
//! commands. Talks to a running `finrag serve`.

use anyhow::{bail, Context, Result};
use finrag_core::models::NewDocument;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct WithKey<'a, T: Serialize> {
    api_key: &'a str,
    #[serde(flatten)]
    body: &'a T,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn query(&self, company: &str, question: &str, api_key: &str) -> Result<Value> {
        let body = serde_json::json!({
            "company": company,
            "question": question,
            "api_key": api_key,
        });
        self.post("/query", &body).await
    }

    pub async fn ingest(&self, doc: &NewDocument, api_key: &str) -> Result<Value> {
        self.post("/ingest", &WithKey { api_key, body: doc }).await
    }

    pub async fn ingest_batch(&self, docs: &[NewDocument], api_key: &str) -> Result<Value> {
        let body: Vec<WithKey<'_, NewDocument>> = docs
            .iter()
            .map(|doc| WithKey { api_key, body: doc })
            .collect();
        self.post("/ingest/batch", &body).await
    }

    pub async fn metrics(&self) -> Result<Value> {
        let resp = self
            .http
            .get(format!("{}/metrics", self.base_url))
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.base_url))?;
        read_json(resp).await
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Value> {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.base_url))?;
        read_json(resp).await
    }
}

async fn read_json(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    let body: Value = resp.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        let message = body
            .pointer("/error/message")
            .and_then(|m| m.as_str())
            .unwrap_or("no error message");
        bail!("server returned {}: {}", status, message);
    }
    Ok(body)
}

/// Read documents from a JSON file holding one object or an array.
pub fn load_documents(path: &Path) -> Result<Vec<NewDocument>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    let docs = match value {
        Value::Array(_) => serde_json::from_value(value)?,
        Value::Object(_) => vec![serde_json::from_value(value)?],
        _ => bail!("{} must contain a JSON object or array", path.display()),
    };
    Ok(docs)
}
