//! Outbound connection policy: custom DNS resolution, IDN host conversion
//! and TLS verification settings, shared by the WebSocket connector and
//! every HTTP client the agent builds.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tokio::net::TcpStream;
use tokio_tungstenite::Connector;

/// Convert a URL's hostname to ASCII Compatible Encoding (Punycode),
/// preserving scheme, userinfo, port, path, query and fragment. IP literals
/// pass through unchanged.
pub fn to_ascii_url(url_str: &str) -> Result<String> {
    // Url::parse normalizes unicode hosts to their ACE form, and leaves
    // IPv4/IPv6 literals alone.
    let url = url::Url::parse(url_str).with_context(|| format!("invalid url: {url_str}"))?;
    Ok(url.to_string())
}

/// Convert a bare `host` or `host:port` (IPv6 possibly bracketed) to ACE.
/// IP literals pass through unchanged.
pub fn to_ascii_host(host: &str) -> Result<String> {
    let (name, port) = split_host_port(host);
    if name.parse::<IpAddr>().is_ok() {
        return Ok(host.to_string());
    }
    let ascii = idna::domain_to_ascii(name).map_err(|e| anyhow!("idna: {e}"))?;
    Ok(match port {
        Some(p) => format!("{ascii}:{p}"),
        None => ascii,
    })
}

fn split_host_port(host: &str) -> (&str, Option<&str>) {
    if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6, optionally followed by :port.
        if let Some(end) = rest.find(']') {
            let name = &rest[..end];
            let tail = &rest[end + 1..];
            return (name, tail.strip_prefix(':'));
        }
        return (host, None);
    }
    match host.rfind(':') {
        // More than one colon without brackets: bare IPv6 literal.
        Some(_) if host.matches(':').count() > 1 => (host, None),
        Some(idx) => (&host[..idx], Some(&host[idx + 1..])),
        None => (host, None),
    }
}

fn parse_dns_server(server: &str) -> Result<SocketAddr> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = server.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, 53));
    }
    Err(anyhow!("invalid DNS server address: {server}"))
}

/// Dials TCP connections on behalf of the agent, honoring the configured
/// DNS server and the certificate-verification switch.
pub struct Dialer {
    resolver: Option<Arc<TokioAsyncResolver>>,
    insecure: bool,
}

impl Dialer {
    /// `custom_dns` is `host[:port]` (port defaults to 53); empty uses the
    /// system resolver. `insecure` disables certificate verification for
    /// all outbound TLS.
    pub fn new(custom_dns: &str, insecure: bool) -> Result<Self> {
        let resolver = if custom_dns.is_empty() {
            None
        } else {
            let addr = parse_dns_server(custom_dns)?;
            let group = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
            let config = ResolverConfig::from_parts(None, vec![], group);
            Some(Arc::new(TokioAsyncResolver::tokio(
                config,
                ResolverOpts::default(),
            )))
        };
        Ok(Self { resolver, insecure })
    }

    pub fn insecure(&self) -> bool {
        self.insecure
    }

    /// Resolve `host` to addresses through the configured resolver.
    pub async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        match &self.resolver {
            Some(resolver) => {
                let lookup = resolver
                    .lookup_ip(host)
                    .await
                    .with_context(|| format!("resolving {host}"))?;
                Ok(lookup.iter().collect())
            }
            None => {
                let addrs = tokio::net::lookup_host((host, 0))
                    .await
                    .with_context(|| format!("resolving {host}"))?;
                Ok(addrs.map(|a| a.ip()).collect())
            }
        }
    }

    /// Open a TCP connection to `host:port`, trying resolved addresses in
    /// order.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        let ips = self.lookup(host).await?;
        let mut last_err = anyhow!("no addresses for {host}");
        for ip in ips {
            match TcpStream::connect(SocketAddr::new(ip, port)).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = anyhow!("connect {ip}:{port}: {e}"),
            }
        }
        Err(last_err)
    }

    /// TLS connector for WebSocket upgrades.
    pub fn tls_connector(&self) -> Connector {
        Connector::Rustls(Arc::new(self.rustls_config()))
    }

    fn rustls_config(&self) -> rustls::ClientConfig {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        if self.insecure {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoVerify::new()));
        }
        config
    }

    /// General-purpose HTTP client honoring this dialer's policy.
    pub fn http_client(&self, timeout: Duration) -> reqwest::Client {
        self.http_builder(timeout)
            .build()
            .unwrap_or_default()
    }

    /// HTTP client locked to one address family by binding the local socket,
    /// used by the public-IP probes.
    pub fn http_client_family(&self, timeout: Duration, v4: bool) -> reqwest::Client {
        let local: IpAddr = if v4 {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        self.http_builder(timeout)
            .local_address(local)
            .build()
            .unwrap_or_default()
    }

    fn http_builder(&self, timeout: Duration) -> reqwest::ClientBuilder {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .danger_accept_invalid_certs(self.insecure);
        if let Some(resolver) = &self.resolver {
            builder = builder.dns_resolver(Arc::new(HickoryDns(resolver.clone())));
        }
        builder
    }
}

/// Bridges hickory into reqwest's resolver hook.
struct HickoryDns(Arc<TokioAsyncResolver>);

impl reqwest::dns::Resolve for HickoryDns {
    fn resolve(&self, name: reqwest::dns::Name) -> reqwest::dns::Resolving {
        let resolver = self.0.clone();
        Box::pin(async move {
            let lookup = resolver
                .lookup_ip(name.as_str())
                .await
                .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { Box::new(e) })?;
            let addrs: reqwest::dns::Addrs =
                Box::new(lookup.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok(addrs)
        })
    }
}

/// Accepts any server certificate. Installed only when the operator passed
/// `--ignore-unsafe-cert`.
#[derive(Debug)]
struct NoVerify(rustls::crypto::CryptoProvider);

impl NoVerify {
    fn new() -> Self {
        Self(rustls::crypto::ring::default_provider())
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}
