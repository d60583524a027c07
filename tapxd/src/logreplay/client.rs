//! HTTP client for the LogReplay collector gateway: JSON in, JSON out,
//! gateway auth headers on every call.

use anyhow::{anyhow, Context, Result};
use hyper::{Body, Client, Method, Request};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use super::models::*;

const GATEWAY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct GatewayClient {
    gateway: String,
    app_id: String,
    app_key: String,
    env: String,
    client: Client<hyper::client::HttpConnector>,
}

impl GatewayClient {
    pub fn new(gateway: &str, app_id: &str, app_key: &str, env: &str) -> Self {
        Self {
            gateway: gateway.to_string(),
            app_id: app_id.to_string(),
            app_key: app_key.to_string(),
            env: env.to_string(),
            client: Client::new(),
        }
    }

    async fn post<Req: Serialize, Rsp: DeserializeOwned>(
        &self,
        uri: &str,
        request: &Req,
    ) -> Result<Rsp> {
        let url = format!("http://{}{}", self.gateway, uri);
        let body = serde_json::to_vec(request)?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(&url)
            .header("Content-Type", "application/json")
            .header("AppId", &self.app_id)
            .header("AppKey", &self.app_key)
            .header("EPP-Gateway-Env", &self.env)
            .header("Rewrite-Request", "true")
            .body(Body::from(body))
            .context("build gateway request")?;

        let response = timeout(GATEWAY_TIMEOUT, self.client.request(request))
            .await
            .with_context(|| format!("gateway call timed out: {url}"))?
            .with_context(|| format!("gateway call failed: {url}"))?;
        if response.status() != hyper::StatusCode::OK {
            return Err(anyhow!("gateway status {}: {url}", response.status()));
        }
        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .context("read gateway response")?;
        debug!(%url, response = %String::from_utf8_lossy(&bytes), "gateway call");
        serde_json::from_slice(&bytes).with_context(|| format!("decode gateway response: {url}"))
    }

    /// Fails fast when the module's credentials do not match the collector.
    pub async fn check_module_auth(&self, module_id: &str) -> Result<()> {
        let rsp: AuthRsp = self
            .post(
                GET_CAS_KEY_URL,
                &AuthReq {
                    module_id: module_id.to_string(),
                },
            )
            .await
            .context("module auth lookup")?;
        if rsp.id != self.app_id || rsp.key != self.app_key {
            return Err(anyhow!("appid/appkey do not match module {module_id}"));
        }
        Ok(())
    }

    /// `app.module` name pair registered for the module.
    pub async fn module_service_name(&self, module_id: &str) -> Result<String> {
        let rsp: GetModuleRsp = self
            .post(
                GET_MODULE_URL,
                &GetModuleReq {
                    module_id: module_id.to_string(),
                },
            )
            .await
            .context("module lookup")?;
        if rsp.module.app_name_en.is_empty() || rsp.module.module_name_en.is_empty() {
            return Err(anyhow!("module {module_id} has no registered names"));
        }
        Ok(format!(
            "{}.{}",
            rsp.module.app_name_en, rsp.module.module_name_en
        ))
    }

    pub async fn create_task(&self, request: &GoReplayTaskReq) -> Result<u32> {
        let rsp: TaskRsp = self
            .post(GO_REPLAY_TASK_URL, request)
            .await
            .context("create replay task")?;
        Ok(rsp.task_id)
    }

    pub async fn report(&self, batch: Vec<ReportItem>) -> Result<u64> {
        let rsp: ReportRsp = self.post(REPORT_URL, &ReportData { batch }).await?;
        Ok(rsp.succeed)
    }

    pub async fn heartbeat(&self, listen_addr: &str) -> Result<()> {
        let _: ReportStatusRsp = self
            .post(
                REPORT_STATUS_URL,
                &ReportStatusReq {
                    ip_port: listen_addr.to_string(),
                },
            )
            .await?;
        Ok(())
    }
}
