//! The session controller: owns the WebSocket to the server, pushes
//! telemetry, dispatches inbound control messages and reconnects forever.
//!
//! Exactly one writer task owns the socket; every other producer (sampler,
//! pong replies, exec results) goes through an mpsc channel, which keeps
//! outbound frames FIFO and applies backpressure.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::AgentConfig;
use crate::dialer::to_ascii_url;
use crate::state::AgentState;
use crate::types::{BasicInfo, ControlMessage, ExecResult, Pong};
use crate::{exec, gpu, ip, metrics, terminal, update};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_QUEUE: usize = 64;

/// Rewrite the configured endpoint with the given scheme kind and path.
/// `ws` selects ws/wss, otherwise http/https; TLS-ness is preserved.
fn endpoint_url(cfg: &AgentConfig, ws: bool, path: &str) -> Result<Url> {
    let ascii = to_ascii_url(&cfg.endpoint)?;
    let mut url = Url::parse(&ascii).context("parsing endpoint")?;
    let scheme = match (url.scheme(), ws) {
        ("http" | "ws", true) => "ws",
        ("https" | "wss", true) => "wss",
        ("http" | "ws", false) => "http",
        ("https" | "wss", false) => "https",
        (other, _) => bail!("unsupported endpoint scheme {other}"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot apply scheme {scheme}"))?;
    url.set_path(path);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

pub(crate) fn report_url(cfg: &AgentConfig) -> Result<String> {
    Ok(endpoint_url(cfg, true, "/api/clients/report")?.to_string())
}

pub(crate) fn terminal_url(cfg: &AgentConfig, request_id: &str) -> Result<String> {
    let mut url = endpoint_url(cfg, true, "/api/clients/terminal")?;
    url.query_pairs_mut().append_pair("id", request_id);
    Ok(url.to_string())
}

fn basic_info_url(cfg: &AgentConfig) -> Result<String> {
    Ok(endpoint_url(cfg, false, "/api/clients/uploadBasicInfo")?.to_string())
}

/// Open a WebSocket through the agent's dialer, attaching the auth and
/// Cloudflare Access headers.
pub(crate) async fn connect_ws(state: &AgentState, url_str: &str) -> Result<WsStream> {
    let url = Url::parse(url_str).context("parsing websocket url")?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("websocket url has no host"))?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("websocket url has no port"))?;

    let mut request = url_str
        .into_client_request()
        .context("building websocket request")?;
    let headers = request.headers_mut();
    if !state.cfg.token.is_empty() {
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", state.cfg.token))
                .context("invalid token header")?,
        );
    }
    if !state.cfg.cf_access_client_id.is_empty() {
        headers.insert(
            "CF-Access-Client-Id",
            HeaderValue::from_str(&state.cfg.cf_access_client_id)?,
        );
        headers.insert(
            "CF-Access-Client-Secret",
            HeaderValue::from_str(&state.cfg.cf_access_client_secret)?,
        );
    }

    let stream = state.dialer.connect(&host, port).await?;
    let (ws, _response) = client_async_tls_with_config(
        request,
        stream,
        None,
        Some(state.dialer.tls_connector()),
    )
    .await
    .with_context(|| format!("websocket handshake with {host}:{port}"))?;
    Ok(ws)
}

/// Maintain the report connection until the process exits.
///
/// Only the initial connection honors `max_retries`; once a connection has
/// succeeded the agent reconnects indefinitely.
pub async fn run(state: Arc<AgentState>) -> Result<()> {
    let mut connected_once = false;
    let mut attempts: u32 = 0;
    loop {
        let connect = async {
            let url = report_url(&state.cfg)?;
            connect_ws(&state, &url).await
        };
        match connect.await {
            Ok(ws) => {
                info!("connected to {}", state.cfg.endpoint);
                connected_once = true;
                attempts = 0;
                if run_connection(&state, ws).await {
                    return Ok(());
                }
                warn!(
                    "connection lost, reconnecting in {}s",
                    state.cfg.reconnect_interval
                );
            }
            Err(e) => {
                attempts += 1;
                warn!("connection attempt {attempts} failed: {e:#}");
                if !connected_once && attempts >= state.cfg.max_retries.max(1) {
                    bail!(
                        "giving up after {attempts} failed attempts to reach {}",
                        state.cfg.endpoint
                    );
                }
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(state.cfg.reconnect_interval)) => {}
            _ = state.wait_shutdown() => return Ok(()),
        }
    }
}

/// Drive one established connection to completion. All tasks spawned here
/// are tied to the connection and cancelled when it drops. Returns true
/// when the connection ended because shutdown was requested.
async fn run_connection(state: &Arc<AgentState>, ws: WsStream) -> bool {
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let sampler = {
        let state = Arc::clone(state);
        let tx = out_tx.clone();
        tokio::spawn(async move {
            // The speed measurement inside collect_report blocks ~1s on its
            // own, independent of the configured interval.
            let interval = Duration::from_secs_f64(state.cfg.interval.max(0.1));
            loop {
                let report = metrics::collect_report(&state).await;
                match serde_json::to_string(&report) {
                    Ok(json) => {
                        if tx.send(Message::Text(json)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("report serialization failed: {e}"),
                }
                tokio::time::sleep(interval).await;
            }
        })
    };

    let info_reporter = {
        let state = Arc::clone(state);
        tokio::spawn(async move {
            let interval = Duration::from_secs(state.cfg.info_report_interval.max(1) * 60);
            loop {
                if let Err(e) = upload_basic_info(&state).await {
                    warn!("basic info upload failed: {e:#}");
                }
                tokio::time::sleep(interval).await;
            }
        })
    };

    let mut session_tasks: Vec<JoinHandle<()>> = Vec::new();
    let mut shutting_down = false;
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    dispatch(state, &out_tx, &text, &mut session_tasks).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("websocket read error: {e}");
                    break;
                }
            },
            _ = state.wait_shutdown() => {
                shutting_down = true;
                let _ = out_tx.send(Message::Close(None)).await;
                break;
            }
        }
        session_tasks.retain(|t| !t.is_finished());
    }

    sampler.abort();
    info_reporter.abort();
    drop(out_tx);
    if shutting_down {
        // Flush the normal-closure frame, then give sessions up to five
        // seconds before killing them.
        let _ = tokio::time::timeout(Duration::from_secs(2), writer).await;
        let mut tasks = session_tasks;
        let all = futures_util::future::join_all(tasks.iter_mut());
        if tokio::time::timeout(Duration::from_secs(5), all).await.is_err() {
            for task in &tasks {
                task.abort();
            }
        }
    } else {
        // Connection gone: everything attached to it goes too.
        writer.abort();
        for task in session_tasks {
            task.abort();
        }
    }
    shutting_down
}

async fn dispatch(
    state: &Arc<AgentState>,
    out_tx: &mpsc::Sender<Message>,
    text: &str,
    session_tasks: &mut Vec<JoinHandle<()>>,
) {
    let message: ControlMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            debug!("undecodable control frame ({e}): {text}");
            return;
        }
    };
    match message {
        ControlMessage::Ping { id } => {
            if let Ok(json) = serde_json::to_string(&Pong::reply_to(id)) {
                let _ = out_tx.send(Message::Text(json)).await;
            }
        }
        ControlMessage::Terminal { request_id } => {
            info!("terminal session requested: {request_id}");
            session_tasks.push(tokio::spawn(terminal::run_session(
                Arc::clone(state),
                request_id,
            )));
        }
        ControlMessage::Exec { data, task_id } => {
            let state = Arc::clone(state);
            let tx = out_tx.clone();
            session_tasks.push(tokio::spawn(async move {
                handle_exec(&state, &tx, data, task_id).await;
            }));
        }
        ControlMessage::Update => {
            info!("server requested an update check");
            let state = Arc::clone(state);
            tokio::spawn(async move {
                if let Err(e) = update::check_and_update(&state).await {
                    warn!("server-triggered update failed: {e:#}");
                }
            });
        }
        ControlMessage::Reinstall => {
            let state = Arc::clone(state);
            tokio::spawn(async move {
                update::reinstall(&state).await;
            });
        }
        ControlMessage::Unknown => {
            debug!("ignoring unknown control message: {text}");
        }
    }
}

async fn handle_exec(
    state: &AgentState,
    out_tx: &mpsc::Sender<Message>,
    script: String,
    task_id: String,
) {
    let result = if state.cfg.disable_web_ssh {
        ExecResult {
            message: "exec_result",
            task_id,
            result: "Remote command execution is disabled by --disable-web-ssh".into(),
            exit_code: -1,
            finished_at: time::OffsetDateTime::now_utc().unix_timestamp(),
        }
    } else {
        info!("exec task {task_id}: {script}");
        let outcome = exec::run(&script).await;
        ExecResult {
            message: "exec_result",
            task_id,
            result: outcome.combined(),
            exit_code: outcome.exit_code,
            finished_at: outcome.finished_at.unix_timestamp(),
        }
    };
    if let Ok(json) = serde_json::to_string(&result) {
        let _ = out_tx.send(Message::Text(json)).await;
    }
}

/// POST the slowly-changing host identity to the server.
pub async fn upload_basic_info(state: &AgentState) -> Result<()> {
    let info = build_basic_info(state).await;
    let url = basic_info_url(&state.cfg)?;
    let mut request = state.http.post(&url).json(&info);
    if !state.cfg.token.is_empty() {
        request = request.bearer_auth(&state.cfg.token);
    }
    if !state.cfg.cf_access_client_id.is_empty() {
        request = request
            .header("CF-Access-Client-Id", &state.cfg.cf_access_client_id)
            .header("CF-Access-Client-Secret", &state.cfg.cf_access_client_secret);
    }
    let response = request.send().await.context("posting basic info")?;
    response
        .error_for_status()
        .context("basic info rejected")?;
    debug!("basic info uploaded");
    Ok(())
}

async fn build_basic_info(state: &AgentState) -> BasicInfo {
    let (cpu_name, cpu_cores, mem_total, swap_total) = {
        let mut sys = state.sys.lock().await;
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        let name = sys
            .cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .unwrap_or_else(|| "unknown".into());
        (name, sys.cpus().len(), sys.total_memory(), sys.total_swap())
    };
    let (disk_total, _) = metrics::disk_usage(&state.cfg);
    let (ipv4, ipv6) = ip::public_addresses(state).await;

    BasicInfo {
        cpu_name,
        cpu_cores,
        os: format!(
            "{} {}",
            sysinfo::System::name().unwrap_or_else(|| std::env::consts::OS.into()),
            sysinfo::System::os_version().unwrap_or_default()
        )
        .trim()
        .to_string(),
        kernel_version: sysinfo::System::kernel_version().unwrap_or_else(|| "unknown".into()),
        arch: std::env::consts::ARCH,
        hostname: hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".into()),
        version: update::CURRENT_VERSION,
        ipv4,
        ipv6,
        gpu_name: if state.cfg.gpu { gpu::model_name() } else { None },
        mem_total,
        swap_total,
        disk_total,
        mountpoints: metrics::mountpoint_list(&state.cfg),
        interfaces: metrics::interface_list(&state.cfg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    fn cfg_with_endpoint(endpoint: &str) -> AgentConfig {
        AgentConfig {
            endpoint: endpoint.into(),
            ..AgentConfig::default()
        }
    }

    #[test]
    fn report_url_switches_to_websocket_scheme() {
        let cfg = cfg_with_endpoint("https://mon.example.com");
        assert_eq!(
            report_url(&cfg).unwrap(),
            "wss://mon.example.com/api/clients/report"
        );
        let cfg = cfg_with_endpoint("http://mon.example.com:8080");
        assert_eq!(
            report_url(&cfg).unwrap(),
            "ws://mon.example.com:8080/api/clients/report"
        );
    }

    #[test]
    fn idn_endpoint_is_dialed_in_ascii_form() {
        let cfg = cfg_with_endpoint("https://例え.test:8443");
        assert_eq!(
            report_url(&cfg).unwrap(),
            "wss://xn--r8jz45g.test:8443/api/clients/report"
        );
    }

    #[test]
    fn terminal_url_carries_the_request_id() {
        let cfg = cfg_with_endpoint("https://mon.example.com");
        assert_eq!(
            terminal_url(&cfg, "req-42").unwrap(),
            "wss://mon.example.com/api/clients/terminal?id=req-42"
        );
    }

    #[test]
    fn basic_info_stays_on_http() {
        let cfg = cfg_with_endpoint("https://mon.example.com");
        assert_eq!(
            basic_info_url(&cfg).unwrap(),
            "https://mon.example.com/api/clients/uploadBasicInfo"
        );
    }

    #[test]
    fn empty_endpoint_is_an_error_not_a_panic() {
        let cfg = cfg_with_endpoint("");
        assert!(report_url(&cfg).is_err());
    }
}
