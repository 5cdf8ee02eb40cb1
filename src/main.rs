//! Entry point for the hostbeat agent. Parses flags, runs the startup
//! handshake (discovery, traffic accounting, update check) and hands off to
//! the session controller until a shutdown signal arrives.

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hostbeat_agent::config;
use hostbeat_agent::dialer::Dialer;
use hostbeat_agent::net_stats::ConfigPatch;
use hostbeat_agent::{discovery, metrics, session, update, AgentState};

#[tokio::main]
async fn main() {
    let mut cfg = match config::parse_args(std::env::args()) {
        Ok(cfg) => cfg,
        Err(message) => {
            // Help is a normal exit; anything else is a config error.
            if message.starts_with("Usage:") {
                println!("{message}");
                return;
            }
            eprintln!("{message}");
            std::process::exit(2);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // One process-wide TLS crypto provider, before any client config is
    // built.
    let _ = rustls::crypto::ring::default_provider().install_default();

    if cfg.show_warning {
        show_warning();
        return;
    }

    info!("hostbeat agent {}", update::CURRENT_VERSION);
    info!("upstream repository: {}", update::REPO);

    if cfg.custom_dns.is_empty() {
        info!("using system DNS resolver");
    } else {
        info!("using custom DNS server {}", cfg.custom_dns);
    }

    if !cfg.auto_discovery.is_empty() {
        let dialer = match Dialer::new(&cfg.custom_dns, cfg.ignore_unsafe_cert) {
            Ok(dialer) => dialer,
            Err(e) => {
                error!("invalid connection configuration: {e:#}");
                std::process::exit(1);
            }
        };
        match discovery::exchange(&dialer, &cfg.auto_discovery).await {
            Ok((endpoint, token)) => {
                cfg.endpoint = endpoint;
                cfg.token = token;
            }
            Err(e) => {
                error!("auto-discovery failed: {e:#}");
                std::process::exit(1);
            }
        }
    }

    let state = match AgentState::new(cfg) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!("unrecoverable configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    if state.cfg.month_rotate != 0 {
        if let Err(e) = state.traffic.start_or_continue() {
            warn!("traffic accounting failed to start: {e:#}");
        }
        state.traffic.set_config(ConfigPatch {
            nics: Some(metrics::interface_list(&state.cfg)),
            ..ConfigPatch::default()
        });
    }

    info!(
        "monitoring mountpoints: {:?}",
        metrics::mountpoint_list(&state.cfg)
    );
    info!(
        "monitoring interfaces: {:?}",
        metrics::interface_list(&state.cfg)
    );

    #[cfg(windows)]
    if !state.cfg.disable_web_ssh {
        spawn_security_warning();
    }

    if !state.cfg.disable_auto_update {
        if let Err(e) = update::check_and_update(&state).await {
            warn!("startup update check failed: {e:#}");
        }
        update::spawn_update_timer(Arc::clone(&state));
    }

    let mut session_task = tokio::spawn(session::run(Arc::clone(&state)));
    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            state.request_shutdown();
            // Normal closure plus up to five seconds of PTY grace happen
            // inside the session teardown.
            if tokio::time::timeout(std::time::Duration::from_secs(8), &mut session_task)
                .await
                .is_err()
            {
                session_task.abort();
            }
            state.traffic.stop();
        }
        result = &mut session_task => {
            state.traffic.stop();
            if let Ok(Err(e)) = result {
                error!("{e:#}");
                std::process::exit(1);
            }
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// `--show-warning` runs the agent as a one-shot dialog subprocess on
/// Windows; elsewhere the flag is a no-op that still exits cleanly.
fn show_warning() {
    #[cfg(windows)]
    {
        let script = "Add-Type -AssemblyName System.Windows.Forms; \
                      [System.Windows.Forms.MessageBox]::Show(\
                      'A hostbeat agent with remote shell access is running on this machine. \
                      If you did not install it, remove it now.', 'hostbeat agent')";
        let _ = std::process::Command::new("powershell")
            .args(["-NoProfile", "-Command", script])
            .status();
    }
}

/// Remote control is on: surface the single-shot security dialog without
/// blocking the agent.
#[cfg(windows)]
fn spawn_security_warning() {
    if let Ok(exe) = std::env::current_exe() {
        let _ = std::process::Command::new(exe).arg("--show-warning").spawn();
    }
}
