//! Wire types of the LogReplay collector API.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const REPORT_URL: &str = "/dataproxy/Report";
pub const GET_CAS_KEY_URL: &str = "/logreplay/app/GetCasKey";
pub const GET_MODULE_URL: &str = "/logreplay/app/GetModule";
pub const GO_REPLAY_TASK_URL: &str = "/logreplay/replay/GoReplay";
pub const REPORT_STATUS_URL: &str =
    "/goreplayserver/grpc.logreplay.goreplay_server.info_service/ReportGoreplayStatus";

pub const REPORT_TYPE: &str = "goReplay";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BaseRsp {
    pub code: i32,
    pub msg: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportData {
    pub batch: Vec<ReportItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportItem {
    #[serde(rename = "type")]
    pub item_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ReportRsp {
    pub base_rsp: Option<BaseRsp>,
    #[serde(default)]
    pub succeed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthReq {
    pub module_id: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthRsp {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetModuleReq {
    pub module_id: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Module {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub module_id: String,
    #[serde(default)]
    pub module_name_en: String,
    #[serde(default)]
    pub app_name_en: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GetModuleRsp {
    #[serde(default)]
    pub module: Module,
}

#[derive(Debug, Clone, Serialize)]
pub struct GoReplayTaskReq {
    pub module_id: String,
    pub operator: String,
    pub total: u64,
    pub rate: u32,
    pub record_commit_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub comment: String,
    pub addrs: String,
    pub replay_type: u32,
    pub target_module_id: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TaskRsp {
    #[serde(default)]
    pub task_id: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportStatusReq {
    pub ip_port: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ReportStatusRsp {
    pub base_rsp: Option<BaseRsp>,
    #[serde(rename = "goreplayStatus", default)]
    pub goreplay_status: String,
}

/// One recorded request/response exchange, serialised into a report item.
#[derive(Debug, Clone, Serialize, Default)]
pub struct GoReplayMessage {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub module_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub commit_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub service_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub instance_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub api_name: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub time: f64,
    /// Raw captured bytes, base64-encoded for the JSON body.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub request_bytes: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub response_bytes: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub src: String,
    pub task_id: u32,
    pub replay_bytes: String,
    pub protocol_service_name: String,
    pub method_name: String,
    pub interface_name: String,
    pub serialize_type: String,
    pub tag: HashMap<String, String>,
    pub success: u32,
    pub send_failed: u32,
    pub dial_failed: u32,
    pub write_failed: u32,
    pub read_failed: u32,
}

fn is_zero(value: &f64) -> bool {
    *value == 0.0
}
