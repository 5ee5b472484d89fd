use crate::error::{AaError, Result};
use anyhow::{anyhow, Context};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const BREADCRUMB_HEADER: &str = "X-Client-Breadcrumb";

/// Per-request metadata attached to outgoing HTTP calls.
///
/// Passed explicitly into each transport; nothing is mutated on a shared client.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Breadcrumb trail, newest last, sent joined by `>`.
    pub breadcrumbs: Vec<String>,
}

impl RequestContext {
    pub fn with_breadcrumb(&self, crumb: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.breadcrumbs.push(crumb.into());
        next
    }

    pub fn header_value(&self) -> Option<String> {
        (!self.breadcrumbs.is_empty()).then(|| self.breadcrumbs.join(" > "))
    }
}

/// Plain JSON-RPC 2.0 over HTTP POST.
#[derive(Debug, Clone)]
pub struct JsonRpcTransport {
    url: String,
    http: reqwest::Client,
    next_id: Arc<AtomicU64>,
}

impl JsonRpcTransport {
    pub fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn request(&self, method: &str, params: Value, ctx: &RequestContext) -> Result<Value> {
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });

        let mut builder = self.http.post(&self.url).json(&req);
        if let Some(crumbs) = ctx.header_value() {
            builder = builder.header(BREADCRUMB_HEADER, crumbs);
        }

        tracing::debug!(method, url = %self.url, "json-rpc request");
        let resp = builder
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.url))?;

        let status = resp.status();
        let body: Value = resp.json().await.context("failed to decode JSON")?;

        if let Some(err) = body.get("error") {
            return Err(rpc_error(method, err));
        }

        if !status.is_success() {
            return Err(anyhow!("HTTP {}: {}", status, body).into());
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| anyhow!("missing result field").into())
    }
}

/// Converts a JSON-RPC error object into `AaError::Rpc`, keeping its contents verbatim.
pub fn rpc_error(method: &str, err: &Value) -> AaError {
    AaError::Rpc {
        method: method.to_string(),
        code: err.get("code").and_then(Value::as_i64).unwrap_or_default(),
        message: err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string()),
        data: err.get("data").cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rpc_error_is_verbatim() {
        let err = rpc_error(
            "eth_sendUserOperation",
            &json!({ "code": -32602, "message": "AA21 didn't pay prefund", "data": { "reason": "x" } }),
        );
        match err {
            AaError::Rpc {
                method,
                code,
                message,
                data,
            } => {
                assert_eq!(method, "eth_sendUserOperation");
                assert_eq!(code, -32602);
                assert_eq!(message, "AA21 didn't pay prefund");
                assert_eq!(data, Some(json!({ "reason": "x" })));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn breadcrumbs_are_explicit() {
        let root = RequestContext::default();
        assert_eq!(root.header_value(), None);
        let ctx = root
            .with_breadcrumb("sendUserOperation")
            .with_breadcrumb("waitForUserOperationTransaction");
        assert_eq!(
            ctx.header_value().as_deref(),
            Some("sendUserOperation > waitForUserOperationTransaction")
        );
        assert!(root.breadcrumbs.is_empty());
    }
}
