//! CLI flag parsing and the process-wide agent configuration.
//!
//! The flag surface deliberately tolerates unknown flags (they warn and are
//! skipped) and rewrites two legacy spellings kept for compatibility with old
//! deployment scripts.

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub token: String,
    pub endpoint: String,
    pub auto_discovery: String,
    pub disable_auto_update: bool,
    pub disable_web_ssh: bool,
    /// Seconds between telemetry reports.
    pub interval: f64,
    pub ignore_unsafe_cert: bool,
    /// Initial-connection retry cap; steady-state reconnects never give up.
    pub max_retries: u32,
    /// Seconds.
    pub reconnect_interval: u64,
    /// Minutes.
    pub info_report_interval: u64,
    pub include_nics: String,
    pub exclude_nics: String,
    /// Semicolon-separated mountpoints; empty means auto-detect.
    pub include_mountpoints: String,
    /// Day of month on which monthly traffic totals reset; 0 disables.
    pub month_rotate: u8,
    pub cf_access_client_id: String,
    pub cf_access_client_secret: String,
    pub memory_include_cache: bool,
    pub custom_dns: String,
    pub gpu: bool,
    pub show_warning: bool,
    pub get_ip_from_nic: bool,
    /// `HOST_PROC` override for containerized deployments.
    pub host_proc: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            endpoint: String::new(),
            auto_discovery: String::new(),
            disable_auto_update: false,
            disable_web_ssh: false,
            interval: 1.0,
            ignore_unsafe_cert: false,
            max_retries: 3,
            reconnect_interval: 5,
            info_report_interval: 5,
            include_nics: String::new(),
            exclude_nics: String::new(),
            include_mountpoints: String::new(),
            month_rotate: 0,
            cf_access_client_id: String::new(),
            cf_access_client_secret: String::new(),
            memory_include_cache: false,
            custom_dns: String::new(),
            gpu: false,
            show_warning: false,
            get_ip_from_nic: false,
            host_proc: std::env::var("HOST_PROC").ok(),
        }
    }
}

fn usage(prog: &str) -> String {
    format!(
        "Usage: {prog} [-t|--token TOKEN] [-e|--endpoint URL] [--auto-discovery KEY]\n\
         \x20        [-i|--interval SECS] [-c|--reconnect-interval SECS] [-r|--max-retries N]\n\
         \x20        [--info-report-interval MIN] [--include-nics a,b] [--exclude-nics a,b]\n\
         \x20        [--include-mountpoint /a;/b] [--month-rotate DAY] [--custom-dns HOST[:PORT]]\n\
         \x20        [--cf-access-client-id ID] [--cf-access-client-secret SECRET]\n\
         \x20        [-u|--ignore-unsafe-cert] [--disable-web-ssh] [--disable-auto-update]\n\
         \x20        [--memory-include-cache] [--gpu] [--get-ip-from-nic] [--show-warning]\n"
    )
}

/// Parse the process argument list into an [`AgentConfig`].
///
/// `Err` carries a user-facing message (help text or a flag error) and means
/// the process should exit without starting.
pub fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<AgentConfig, String> {
    let mut it = args.into_iter();
    let prog = it.next().unwrap_or_else(|| "hostbeat_agent".into());
    let mut cfg = AgentConfig::default();

    // Legacy rewrites happen inline: the flag is consumed, a deprecation
    // warning goes to stderr, and parsing continues.
    while let Some(arg) = it.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((f, v)) => (f.to_string(), Some(v.to_string())),
            None => (arg.clone(), None),
        };
        let mut take = |name: &str| -> Result<String, String> {
            match inline.clone().or_else(|| it.next()) {
                Some(v) => Ok(v),
                None => Err(format!("flag {name} requires a value\n{}", usage(&prog))),
            }
        };
        match flag.as_str() {
            "-h" | "--help" => return Err(usage(&prog)),
            "-t" | "--token" => cfg.token = take("--token")?,
            "-e" | "--endpoint" => cfg.endpoint = take("--endpoint")?,
            "--auto-discovery" => cfg.auto_discovery = take("--auto-discovery")?,
            "--disable-auto-update" => cfg.disable_auto_update = true,
            "--disable-web-ssh" => cfg.disable_web_ssh = true,
            "-i" | "--interval" => {
                cfg.interval = take("--interval")?
                    .parse()
                    .map_err(|_| "invalid --interval value".to_string())?;
            }
            "-u" | "--ignore-unsafe-cert" => cfg.ignore_unsafe_cert = true,
            "-r" | "--max-retries" => {
                cfg.max_retries = take("--max-retries")?
                    .parse()
                    .map_err(|_| "invalid --max-retries value".to_string())?;
            }
            "-c" | "--reconnect-interval" => {
                cfg.reconnect_interval = take("--reconnect-interval")?
                    .parse()
                    .map_err(|_| "invalid --reconnect-interval value".to_string())?;
            }
            "--info-report-interval" => {
                cfg.info_report_interval = take("--info-report-interval")?
                    .parse()
                    .map_err(|_| "invalid --info-report-interval value".to_string())?;
            }
            "--include-nics" => cfg.include_nics = take("--include-nics")?,
            "--exclude-nics" => cfg.exclude_nics = take("--exclude-nics")?,
            "--include-mountpoint" => cfg.include_mountpoints = take("--include-mountpoint")?,
            "--month-rotate" => {
                let day: u8 = take("--month-rotate")?
                    .parse()
                    .map_err(|_| "invalid --month-rotate value".to_string())?;
                if day > 31 {
                    return Err("--month-rotate must be within 0..=31".into());
                }
                cfg.month_rotate = day;
            }
            "--cf-access-client-id" => cfg.cf_access_client_id = take("--cf-access-client-id")?,
            "--cf-access-client-secret" => {
                cfg.cf_access_client_secret = take("--cf-access-client-secret")?;
            }
            "--memory-include-cache" => cfg.memory_include_cache = true,
            "--custom-dns" => cfg.custom_dns = take("--custom-dns")?,
            "--gpu" => cfg.gpu = true,
            "--show-warning" => cfg.show_warning = true,
            "--get-ip-from-nic" => cfg.get_ip_from_nic = true,
            "-autoUpdate" | "--autoUpdate" => {
                eprintln!(
                    "WARNING: the -autoUpdate flag is deprecated; auto-update is on by default, \
                     use --disable-auto-update to turn it off"
                );
            }
            "-memory-mode-available" | "--memory-mode-available" => {
                eprintln!(
                    "WARNING: the --memory-mode-available flag is deprecated; \
                     use --memory-include-cache to count cache/buffers as used"
                );
            }
            other if other.starts_with('-') => {
                eprintln!("WARNING: unknown flag {other} ignored");
            }
            other => {
                return Err(format!(
                    "unexpected argument {other}\n{}",
                    usage(&prog)
                ));
            }
        }
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("hostbeat_agent")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = parse_args(argv(&[])).unwrap();
        assert_eq!(cfg.interval, 1.0);
        assert_eq!(cfg.reconnect_interval, 5);
        assert_eq!(cfg.info_report_interval, 5);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.month_rotate, 0);
        assert!(!cfg.disable_web_ssh);
        assert!(!cfg.gpu);
    }

    #[test]
    fn short_long_and_assign_forms() {
        let cfg = parse_args(argv(&[
            "-t",
            "secret",
            "--endpoint=https://mon.example.com",
            "-i",
            "2.5",
            "--month-rotate",
            "15",
            "-u",
        ]))
        .unwrap();
        assert_eq!(cfg.token, "secret");
        assert_eq!(cfg.endpoint, "https://mon.example.com");
        assert_eq!(cfg.interval, 2.5);
        assert_eq!(cfg.month_rotate, 15);
        assert!(cfg.ignore_unsafe_cert);
    }

    #[test]
    fn legacy_flags_are_stripped() {
        let cfg = parse_args(argv(&["--autoUpdate", "-t", "x", "--memory-mode-available"]))
            .unwrap();
        assert_eq!(cfg.token, "x");
        assert!(!cfg.disable_auto_update);
        assert!(!cfg.memory_include_cache);
    }

    #[test]
    fn unknown_flags_are_tolerated() {
        let cfg = parse_args(argv(&["--future-flag", "-t", "x"])).unwrap();
        assert_eq!(cfg.token, "x");
    }

    #[test]
    fn month_rotate_range_is_enforced() {
        assert!(parse_args(argv(&["--month-rotate", "32"])).is_err());
        assert!(parse_args(argv(&["--month-rotate", "31"])).is_ok());
        assert!(parse_args(argv(&["--month-rotate", "0"])).is_ok());
    }

    #[test]
    fn help_returns_usage() {
        let err = parse_args(argv(&["--help"])).unwrap_err();
        assert!(err.contains("Usage:"));
        assert!(err.contains("--month-rotate"));
    }

    #[test]
    fn positional_arguments_are_rejected() {
        assert!(parse_args(argv(&["stray"])).is_err());
    }
}
