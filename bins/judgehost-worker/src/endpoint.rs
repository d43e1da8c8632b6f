// HTTP client for the judging endpoint
//
// Every request carries basic auth and the judgehost name header. The
// pipeline only depends on the `Endpoint` trait; `HttpEndpoint` is the
// reqwest-backed implementation used by the daemon.

use crate::config::SystemConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use judgehost_common::api;
use judgehost_common::types::{JudgeInfo, RunResult, TestcaseInfo};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("request error status code {status}: {body}")]
    Status { status: u16, body: String },
}

/// Calls the pipeline makes while judging one submission.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// `None` once every testcase of the judging has been handed out.
    async fn next_testcase(&self, judging_id: i64) -> Result<Option<TestcaseInfo>>;
    async fn compile_ok(&self, judging_id: i64) -> Result<()>;
    async fn compile_error(&self, judging_id: i64, message: &str) -> Result<()>;
    /// Operational failure of the judgehost, not a grading verdict.
    async fn judge_error(&self, judging_id: i64, error: &str) -> Result<()>;
    async fn post_result(&self, result: &RunResult) -> Result<()>;
}

/// True for bodies the endpoint uses to say "nothing here":
/// empty, `null`, `[]`, or an object whose `key` is missing or zero.
fn is_empty_payload(value: &Value, key: &str) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => match map.get(key) {
            None | Some(Value::Null) => true,
            Some(Value::Number(n)) => n.as_i64() == Some(0),
            Some(Value::String(s)) => s.trim().is_empty() || s.trim() == "0",
            Some(_) => false,
        },
        _ => false,
    }
}

fn parse_optional<T: DeserializeOwned>(body: &str, key: &str) -> Result<Option<T>> {
    let body = body.trim();
    if body.is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(body).context("json decode error")?;
    if is_empty_payload(&value, key) {
        return Ok(None);
    }
    // Some endpoint versions wrap single objects in an array
    let value = match value {
        Value::Array(mut items) => items.swap_remove(0),
        other => other,
    };
    Ok(Some(serde_json::from_value(value).context("json decode error")?))
}

#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    client: Client,
    base_url: String,
    host_name: String,
    user: String,
    password: String,
}

impl HttpEndpoint {
    pub fn new(config: &SystemConfig) -> Result<Self> {
        Self::with_credentials(
            &config.endpoint_url,
            &config.host_name,
            &config.endpoint_user,
            &config.endpoint_password,
        )
    }

    pub fn with_credentials(base_url: &str, host_name: &str, user: &str, password: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            host_name: host_name.to_string(),
            user: user.to_string(),
            password: password.to_string(),
        })
    }

    fn request(&self, method: Method, route: &str) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, route))
            .header(api::HOSTNAME_HEADER, &self.host_name);
        if !self.user.is_empty() {
            builder = builder.basic_auth(&self.user, Some(&self.password));
        }
        builder
    }

    async fn send(&self, builder: RequestBuilder, route: &str) -> Result<Response> {
        debug!(route, "Endpoint request");
        let response = builder
            .send()
            .await
            .with_context(|| format!("request error URL={}{}", self.base_url, route))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EndpointError::Status {
                status: status.as_u16(),
                body,
            })
            .with_context(|| format!("request error URL={}{}", self.base_url, route));
        }
        Ok(response)
    }

    pub async fn get_text(&self, route: &str) -> Result<String> {
        let response = self.send(self.request(Method::GET, route), route).await?;
        response.text().await.context("Failed to read response body")
    }

    pub async fn get_json<T: DeserializeOwned>(&self, route: &str) -> Result<T> {
        let body = self.get_text(route).await?;
        serde_json::from_str(&body).with_context(|| format!("json decode error for {}", route))
    }

    /// The endpoint answers at all. Any HTTP status counts as reachable.
    pub async fn ping(&self) -> Result<()> {
        self.request(Method::GET, "/")
            .send()
            .await
            .with_context(|| format!("endpoint {} unreachable", self.base_url))?;
        Ok(())
    }

    pub async fn register(&self) -> Result<()> {
        let form = [("hostname", self.host_name.as_str())];
        self.send(self.request(Method::POST, api::JUDGEHOSTS).form(&form), api::JUDGEHOSTS)
            .await
            .context("register judgehost error")?;
        Ok(())
    }

    /// Ask for new work. `None` when the endpoint has nothing queued.
    pub async fn fetch_judging(&self) -> Result<Option<JudgeInfo>> {
        let builder = self
            .request(Method::POST, api::JUDGINGS)
            .query(&[(api::JUDGEHOST_PARAM, self.host_name.as_str())]);
        let response = self.send(builder, api::JUDGINGS).await?;
        let body = response.text().await.context("Failed to read response body")?;
        parse_optional(&body, "submitid").context("decode judging error")
    }

    async fn update_judging(&self, judging_id: i64, success: bool, output: &str) -> Result<()> {
        let route = api::judging(judging_id);
        let form = [
            ("compile_success", if success { "1" } else { "0" }.to_string()),
            ("output_compile", general_purpose::STANDARD.encode(output)),
            ("judgehost", self.host_name.clone()),
        ];
        self.send(self.request(Method::PUT, &route).form(&form), &route).await?;
        Ok(())
    }
}

#[async_trait]
impl Endpoint for HttpEndpoint {
    async fn next_testcase(&self, judging_id: i64) -> Result<Option<TestcaseInfo>> {
        let route = api::next_testcase(judging_id);
        let body = self.get_text(&route).await?;
        parse_optional(&body, "testcaseid").context("decode testcase error")
    }

    async fn compile_ok(&self, judging_id: i64) -> Result<()> {
        self.update_judging(judging_id, true, "")
            .await
            .context("put Compile OK error")
    }

    async fn compile_error(&self, judging_id: i64, message: &str) -> Result<()> {
        self.update_judging(judging_id, false, message)
            .await
            .context("put Compile Errors error")
    }

    async fn judge_error(&self, judging_id: i64, error: &str) -> Result<()> {
        // Older endpoints only understand judge errors as failed compilations
        self.update_judging(judging_id, false, error)
            .await
            .context("put Judging Errors error")
    }

    async fn post_result(&self, result: &RunResult) -> Result<()> {
        let form = result.to_form(&self.host_name);
        self.send(
            self.request(Method::POST, api::JUDGING_RUNS).form(&form),
            api::JUDGING_RUNS,
        )
        .await
        .context("Post result error")?;
        Ok(())
    }
}
