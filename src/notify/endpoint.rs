//! Broker address parsing and TLS material loading for the MQTT notifier.

use anyhow::{anyhow, bail, Context, Result};
use rumqttc::Transport;
use std::path::{Path, PathBuf};

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_MQTTS_PORT: u16 = 8883;

/// Where the broker lives and whether to speak TLS to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl std::fmt::Display for MqttEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.use_tls { "mqtts" } else { "mqtt" };
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

/// Parse a broker address.
///
/// Accepted forms: `host:port`, `host` (default port), `[v6]:port`, each
/// optionally prefixed with `mqtt://`, `tcp://` (plain) or `mqtts://`,
/// `ssl://` (TLS). `force_tls` turns TLS on for schemeless addresses.
pub fn parse_mqtt_endpoint(addr: &str, force_tls: bool) -> Result<MqttEndpoint> {
    let mut use_tls = force_tls;
    let mut rest = addr.trim();
    if rest.is_empty() {
        bail!("MQTT broker address is empty");
    }

    if let Some((scheme, tail)) = rest.split_once("://") {
        match scheme.to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => bail!("unsupported MQTT scheme: {}", other),
        }
        rest = tail.trim_end_matches('/');
    }

    let default_port = if use_tls {
        DEFAULT_MQTTS_PORT
    } else {
        DEFAULT_MQTT_PORT
    };
    let (host, port) = split_host_port(rest, default_port)?;
    if host.is_empty() {
        bail!("missing MQTT host in {}", addr);
    }
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str, default_port: u16) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port, addr)?,
            None if tail.is_empty() => default_port,
            None => bail!("invalid MQTT address: {}", addr),
        };
        return Ok((host.to_string(), port));
    }

    match addr.rsplit_once(':') {
        Some((host, _)) if host.contains(':') => {
            bail!("IPv6 MQTT address must be bracketed: {}", addr)
        }
        Some((host, port)) => Ok((host.to_string(), parse_port(port, addr)?)),
        None => Ok((addr.to_string(), default_port)),
    }
}

fn parse_port(port: &str, addr: &str) -> Result<u16> {
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    if port == 0 {
        bail!("invalid MQTT port in {}", addr);
    }
    Ok(port)
}

/// PEM bytes for a custom CA and optional client certificate.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    pub ca: Option<Vec<u8>>,
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    /// Read the configured files. Client certificate and key come as a pair.
    pub fn load(
        ca_path: Option<&Path>,
        client_cert_path: Option<&Path>,
        client_key_path: Option<&Path>,
    ) -> Result<Self> {
        let ca = ca_path.map(|path| read_pem(path, "CA")).transpose()?;
        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert), Some(key)) => Some((
                read_pem(cert, "client certificate")?,
                read_pem(key, "client key")?,
            )),
            (None, None) => None,
            (Some(_), None) => bail!("MQTT TLS client certificate provided without key"),
            (None, Some(_)) => bail!("MQTT TLS client key provided without certificate"),
        };
        Ok(Self { ca, client_auth })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }

    /// Transport for `endpoint`: plain TCP, TLS with the bundled roots, or TLS
    /// with the custom CA (and client certificate, if any).
    pub fn transport_for(&self, endpoint: &MqttEndpoint) -> Result<Transport> {
        if !endpoint.use_tls {
            if self.is_configured() {
                bail!(
                    "MQTT TLS files configured but {} is not a TLS endpoint; \
                     use mqtts:// or set use_tls",
                    endpoint
                );
            }
            return Ok(Transport::tcp());
        }
        if !self.is_configured() {
            return Ok(Transport::tls_with_default_config());
        }
        let ca = self.ca.clone().ok_or_else(|| {
            anyhow!("MQTT TLS CA certificate is required when providing a client certificate")
        })?;
        Ok(Transport::tls(ca, self.client_auth.clone(), None))
    }
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path)
        .with_context(|| format!("failed to read MQTT TLS {} '{}'", what, path.display()))
}

/// Optional TLS file paths as they appear in configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsPaths {
    pub ca_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
}

impl TlsPaths {
    pub fn load(&self) -> Result<TlsMaterials> {
        TlsMaterials::load(
            self.ca_path.as_deref(),
            self.client_cert_path.as_deref(),
            self.client_key_path.as_deref(),
        )
    }
}
