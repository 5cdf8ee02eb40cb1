//! CLI surface tests: the binary's help output plus the parse behavior the
//! deployment scripts rely on (legacy flags, unknown flags, short forms).

use std::process::Command;

use hostbeat_agent::config::parse_args;

fn argv(args: &[&str]) -> Vec<String> {
    std::iter::once("hostbeat_agent")
        .chain(args.iter().copied())
        .map(String::from)
        .collect()
}

#[test]
fn help_mentions_documented_flags() {
    let output = Command::new(env!("CARGO_BIN_EXE_hostbeat_agent"))
        .arg("--help")
        .output()
        .expect("run hostbeat_agent --help");
    assert!(output.status.success(), "--help must exit zero");
    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    for flag in [
        "--token",
        "--endpoint",
        "--auto-discovery",
        "--interval",
        "--month-rotate",
        "--custom-dns",
        "--disable-web-ssh",
        "--include-mountpoint",
    ] {
        assert!(text.contains(flag), "help text missing {flag}\n{text}");
    }
}

#[test]
fn legacy_auto_update_flag_warns_and_is_stripped() {
    let output = Command::new(env!("CARGO_BIN_EXE_hostbeat_agent"))
        .args(["--autoUpdate", "--help"])
        .output()
        .expect("run hostbeat_agent");
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("deprecated"),
        "expected a deprecation warning, got: {stderr}"
    );
}

#[test]
fn unknown_flags_do_not_fail_startup() {
    let output = Command::new(env!("CARGO_BIN_EXE_hostbeat_agent"))
        .args(["--some-future-flag", "--help"])
        .output()
        .expect("run hostbeat_agent");
    assert!(output.status.success());
}

#[test]
fn full_flag_set_parses() {
    let cfg = parse_args(argv(&[
        "-t",
        "tok",
        "-e",
        "https://mon.example.com",
        "--auto-discovery",
        "key",
        "--disable-auto-update",
        "--disable-web-ssh",
        "-i",
        "0.5",
        "-u",
        "-r",
        "7",
        "-c",
        "9",
        "--info-report-interval",
        "10",
        "--include-nics",
        "eth0,eth1",
        "--exclude-nics",
        "wg0",
        "--include-mountpoint",
        "/;/data",
        "--month-rotate",
        "1",
        "--cf-access-client-id",
        "cid",
        "--cf-access-client-secret",
        "csec",
        "--memory-include-cache",
        "--custom-dns",
        "9.9.9.9",
        "--gpu",
        "--get-ip-from-nic",
    ]))
    .unwrap();
    assert_eq!(cfg.token, "tok");
    assert_eq!(cfg.endpoint, "https://mon.example.com");
    assert_eq!(cfg.auto_discovery, "key");
    assert!(cfg.disable_auto_update && cfg.disable_web_ssh);
    assert_eq!(cfg.interval, 0.5);
    assert!(cfg.ignore_unsafe_cert);
    assert_eq!(cfg.max_retries, 7);
    assert_eq!(cfg.reconnect_interval, 9);
    assert_eq!(cfg.info_report_interval, 10);
    assert_eq!(cfg.include_nics, "eth0,eth1");
    assert_eq!(cfg.exclude_nics, "wg0");
    assert_eq!(cfg.include_mountpoints, "/;/data");
    assert_eq!(cfg.month_rotate, 1);
    assert_eq!(cfg.cf_access_client_id, "cid");
    assert_eq!(cfg.cf_access_client_secret, "csec");
    assert!(cfg.memory_include_cache && cfg.gpu && cfg.get_ip_from_nic);
    assert_eq!(cfg.custom_dns, "9.9.9.9");
}
