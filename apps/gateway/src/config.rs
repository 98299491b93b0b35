use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use url::Url;
use wa_core::ClientIdentity;
use wa_core::client::{DEFAULT_CLIENT_ID, DEFAULT_SESSION_DIR};

use crate::cors::CorsPolicy;

const DEFAULT_PORT: u16 = 3001;
const DEFAULT_BRIDGE_URL: &str = "http://127.0.0.1:3100/";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub addr: SocketAddr,
    pub cors: CorsPolicy,
    pub identity: ClientIdentity,
    pub bridge_url: Url,
    pub upload_dir: PathBuf,
    /// Delay before the session is started on boot; `None` disables auto-start.
    pub auto_init_delay: Option<Duration>,
    pub shutdown_grace: Duration,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_addr = get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0".into());
        let ip = IpAddr::from_str(bind_addr.trim()).context("invalid BIND_ADDR")?;
        let port = match get("PORT") {
            Some(raw) => raw.trim().parse::<u16>().context("invalid PORT")?,
            None => DEFAULT_PORT,
        };

        let cors = get("CORS_ORIGINS")
            .map(|raw| CorsPolicy::parse(&raw))
            .unwrap_or_default();

        let identity = ClientIdentity {
            client_id: get("WA_CLIENT_ID").unwrap_or_else(|| DEFAULT_CLIENT_ID.into()),
            data_dir: get("WA_SESSION_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SESSION_DIR)),
        };

        let bridge_url = match get("WA_BRIDGE_URL") {
            Some(raw) => Url::parse(raw.trim()).context("invalid WA_BRIDGE_URL")?,
            None => Url::parse(DEFAULT_BRIDGE_URL)?,
        };

        let auto_init_delay = match get("WA_AUTO_INIT_DELAY_MS") {
            Some(raw) if raw.trim().eq_ignore_ascii_case("off") => None,
            Some(raw) => Some(millis(&raw).context("invalid WA_AUTO_INIT_DELAY_MS")?),
            None => Some(Duration::from_millis(2_000)),
        };
        let shutdown_grace = match get("SHUTDOWN_GRACE_MS") {
            Some(raw) => millis(&raw).context("invalid SHUTDOWN_GRACE_MS")?,
            None => Duration::from_millis(5_000),
        };

        Ok(Self {
            addr: SocketAddr::new(ip, port),
            cors,
            identity,
            bridge_url,
            upload_dir: get("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("uploads")),
            auto_init_delay,
            shutdown_grace,
        })
    }
}

fn millis(raw: &str) -> Result<Duration> {
    Ok(Duration::from_millis(raw.trim().parse::<u64>()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let config = GatewayConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.addr, "0.0.0.0:3001".parse().unwrap());
        assert_eq!(config.identity.client_id, "energenie-whatsapp");
        assert_eq!(config.identity.data_dir, PathBuf::from(".wwebjs_auth"));
        assert_eq!(config.upload_dir, PathBuf::from("uploads"));
        assert_eq!(config.auto_init_delay, Some(Duration::from_secs(2)));
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert!(config.cors.allows("https://seetech.energenie.io/whatsapp"));
    }

    #[test]
    fn reads_overrides() {
        let config = GatewayConfig::from_lookup(lookup(&[
            ("BIND_ADDR", "127.0.0.1"),
            ("PORT", "8088"),
            ("WA_CLIENT_ID", "sales-desk"),
            ("WA_SESSION_DIR", "/var/lib/wa"),
            ("WA_BRIDGE_URL", "http://bridge:9000/api"),
            ("UPLOAD_DIR", "/tmp/wa-uploads"),
            ("WA_AUTO_INIT_DELAY_MS", "off"),
            ("SHUTDOWN_GRACE_MS", "1500"),
            ("CORS_ORIGINS", "https://crm.example.com"),
        ]))
        .unwrap();
        assert_eq!(config.addr, "127.0.0.1:8088".parse().unwrap());
        assert_eq!(
            config.identity.session_path(),
            PathBuf::from("/var/lib/wa/session-sales-desk")
        );
        assert_eq!(config.bridge_url.as_str(), "http://bridge:9000/api");
        assert_eq!(config.auto_init_delay, None);
        assert_eq!(config.shutdown_grace, Duration::from_millis(1500));
        assert!(config.cors.allows("https://crm.example.com"));
        assert!(!config.cors.allows("https://seetech.energenie.io"));
    }

    #[test]
    fn rejects_malformed_values() {
        assert!(GatewayConfig::from_lookup(lookup(&[("PORT", "eighty")])).is_err());
        assert!(GatewayConfig::from_lookup(lookup(&[("BIND_ADDR", "localhost")])).is_err());
        assert!(GatewayConfig::from_lookup(lookup(&[("WA_BRIDGE_URL", "::")])).is_err());
    }
}
