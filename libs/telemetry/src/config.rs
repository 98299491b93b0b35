use std::env;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
    pub json_logs: bool,
}

impl TelemetryConfig {
    pub fn from_env(default_service_name: &str, default_service_version: &str) -> Self {
        Self::from_lookup(
            |key| env::var(key).ok(),
            default_service_name,
            default_service_version,
        )
    }

    pub fn from_lookup<F>(
        lookup: F,
        default_service_name: &str,
        default_service_version: &str,
    ) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let service_name = lookup("SERVICE_NAME")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default_service_name.to_string());
        let service_version = lookup("SERVICE_VERSION")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default_service_version.to_string());
        let environment = lookup("DEPLOYMENT_ENV").unwrap_or_else(|| "dev".into());
        let json_logs = lookup("LOG_FORMAT")
            .map(|v| !matches!(v.to_lowercase().as_str(), "text" | "pretty" | "plain"))
            .unwrap_or(true);

        Self {
            service_name,
            service_version,
            environment,
            json_logs,
        }
    }
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
    fn defaults_to_json_logs() {
        let cfg = TelemetryConfig::from_lookup(lookup(&[]), "wa-gateway", "0.1.0");
        assert!(cfg.json_logs);
        assert_eq!(cfg.service_name, "wa-gateway");
        assert_eq!(cfg.environment, "dev");
    }

    #[test]
    fn plain_formats_disable_json() {
        for format in ["text", "Pretty", "PLAIN"] {
            let cfg = TelemetryConfig::from_lookup(lookup(&[("LOG_FORMAT", format)]), "svc", "1");
            assert!(!cfg.json_logs, "{format} should select text output");
        }
        let cfg = TelemetryConfig::from_lookup(lookup(&[("LOG_FORMAT", "json")]), "svc", "1");
        assert!(cfg.json_logs);
    }

    #[test]
    fn overrides_service_identity() {
        let cfg = TelemetryConfig::from_lookup(
            lookup(&[
                ("SERVICE_NAME", "energenie-wa"),
                ("SERVICE_VERSION", "2.0.0"),
                ("DEPLOYMENT_ENV", "prod"),
            ]),
            "svc",
            "1",
        );
        assert_eq!(cfg.service_name, "energenie-wa");
        assert_eq!(cfg.service_version, "2.0.0");
        assert_eq!(cfg.environment, "prod");
    }
}
