//! Data types exchanged with the server.
//! Keep this module minimal and stable — it defines the wire format.

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Clone)]
pub struct CpuReport {
    pub usage: f32,
    #[serde(rename = "perCore")]
    pub per_core: Vec<f32>,
}

#[derive(Debug, Serialize, Clone, Copy)]
pub struct MemReport {
    pub total: u64,
    pub used: u64,
}

#[derive(Debug, Serialize, Clone, Copy)]
pub struct DiskReport {
    pub total: u64,
    pub used: u64,
}

#[derive(Debug, Serialize, Clone, Copy)]
pub struct LoadReport {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
}

#[derive(Debug, Serialize, Clone, Copy)]
pub struct NetworkReport {
    /// Instantaneous upload speed, bytes per second.
    pub up: u64,
    /// Instantaneous download speed, bytes per second.
    pub down: u64,
    #[serde(rename = "totalUp")]
    pub total_up: u64,
    #[serde(rename = "totalDown")]
    pub total_down: u64,
}

#[derive(Debug, Serialize, Clone, Copy)]
pub struct ConnectionsReport {
    pub tcp: usize,
    pub udp: usize,
}

#[derive(Debug, Serialize, Clone)]
pub struct GpuReport {
    pub name: String,
    /// Utilization percent, 0..100.
    pub usage: u32,
    pub mem_used: u64,
    pub mem_total: u64,
}

/// One telemetry tick. Fields are sampled together but are not atomic
/// across each other.
#[derive(Debug, Serialize, Clone)]
pub struct TelemetryReport {
    pub message: &'static str,
    pub cpu: CpuReport,
    pub ram: MemReport,
    pub swap: MemReport,
    pub disk: DiskReport,
    pub load: LoadReport,
    pub network: NetworkReport,
    pub connections: ConnectionsReport,
    pub process: usize,
    pub uptime: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuReport>,
    /// Unix milliseconds.
    pub timestamp: i64,
}

/// Slowly-changing host identity, posted over HTTP at a coarser cadence
/// than telemetry.
#[derive(Debug, Serialize, Clone)]
pub struct BasicInfo {
    pub cpu_name: String,
    pub cpu_cores: usize,
    pub os: String,
    pub kernel_version: String,
    pub arch: &'static str,
    pub hostname: String,
    pub version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_name: Option<String>,
    pub mem_total: u64,
    pub swap_total: u64,
    pub disk_total: u64,
    pub mountpoints: Vec<String>,
    pub interfaces: Vec<String>,
}

/// Control frames pushed by the server. Unrecognized discriminators decode
/// to `Unknown` and are ignored, never an error.
#[derive(Debug, Deserialize)]
#[serde(tag = "message")]
pub enum ControlMessage {
    #[serde(rename = "ping")]
    Ping {
        #[serde(default)]
        id: Option<serde_json::Value>,
    },
    #[serde(rename = "terminal")]
    Terminal { request_id: String },
    #[serde(rename = "exec")]
    Exec { data: String, task_id: String },
    #[serde(rename = "update")]
    Update,
    #[serde(rename = "reinstall")]
    Reinstall,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Serialize)]
pub struct Pong {
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
}

impl Pong {
    pub fn reply_to(id: Option<serde_json::Value>) -> Self {
        Self {
            message: "pong",
            id,
        }
    }
}

/// Reply to an `exec` control message, tagged with the originating task.
#[derive(Debug, Serialize)]
pub struct ExecResult {
    pub message: &'static str,
    pub task_id: String,
    pub result: String,
    pub exit_code: i32,
    /// Unix seconds.
    pub finished_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_message_dispatch_by_discriminator() {
        let m: ControlMessage = serde_json::from_str(r#"{"message":"ping","id":7}"#).unwrap();
        assert!(matches!(m, ControlMessage::Ping { id: Some(_) }));

        let m: ControlMessage =
            serde_json::from_str(r#"{"message":"terminal","request_id":"abc"}"#).unwrap();
        match m {
            ControlMessage::Terminal { request_id } => assert_eq!(request_id, "abc"),
            other => panic!("unexpected: {other:?}"),
        }

        let m: ControlMessage =
            serde_json::from_str(r#"{"message":"exec","data":"uptime","task_id":"t1"}"#).unwrap();
        match m {
            ControlMessage::Exec { data, task_id } => {
                assert_eq!(data, "uptime");
                assert_eq!(task_id, "t1");
            }
            other => panic!("unexpected: {other:?}"),
        }

        let m: ControlMessage = serde_json::from_str(r#"{"message":"update"}"#).unwrap();
        assert!(matches!(m, ControlMessage::Update));
    }

    #[test]
    fn unknown_discriminator_is_not_an_error() {
        let m: ControlMessage =
            serde_json::from_str(r#"{"message":"frobnicate","x":1}"#).unwrap();
        assert!(matches!(m, ControlMessage::Unknown));
    }

    #[test]
    fn report_uses_server_field_spellings() {
        let report = TelemetryReport {
            message: "report",
            cpu: CpuReport {
                usage: 12.5,
                per_core: vec![10.0, 15.0],
            },
            ram: MemReport {
                total: 16,
                used: 8,
            },
            swap: MemReport { total: 4, used: 0 },
            disk: DiskReport {
                total: 100,
                used: 40,
            },
            load: LoadReport {
                load1: 0.5,
                load5: 0.4,
                load15: 0.3,
            },
            network: NetworkReport {
                up: 1,
                down: 2,
                total_up: 3,
                total_down: 4,
            },
            connections: ConnectionsReport { tcp: 5, udp: 6 },
            process: 42,
            uptime: 1000,
            gpu: None,
            timestamp: 1_700_000_000_000,
        };
        let v: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&report).unwrap()).unwrap();
        assert_eq!(v["message"], "report");
        assert_eq!(v["network"]["totalUp"], 3);
        assert_eq!(v["network"]["totalDown"], 4);
        assert_eq!(v["cpu"]["perCore"][1], 15.0);
        assert_eq!(v["load"]["load1"], 0.5);
        assert!(v.get("gpu").is_none());
    }

    #[test]
    fn pong_echoes_correlation_id() {
        let pong = Pong::reply_to(Some(serde_json::json!("req-9")));
        let v: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&pong).unwrap()).unwrap();
        assert_eq!(v["message"], "pong");
        assert_eq!(v["id"], "req-9");
    }
}
