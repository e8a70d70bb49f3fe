use crate::extractor::{VAR_GROUP, VAR_INTERNAL_REDIRECT, VAR_NAMES, VAR_URL};
use crate::gate::DEFAULT_MAX_REPLY_BYTES;
use crate::variables::is_dynamic;
use hyper::http::uri::Authority;
use hyper::Uri;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gate
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Control service settings
    #[serde(default)]
    pub control: ControlConfig,

    /// Named upstreams that internal redirects can point at (`@name`)
    #[serde(default)]
    pub upstreams: HashMap<String, String>,

    /// Variable templates inherited by every route
    #[serde(default)]
    pub defaults: HashMap<String, String>,

    /// Variable templates per host. `_` matches any host without its own route.
    #[serde(default)]
    pub routes: HashMap<String, HashMap<String, String>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 80, set to 0 to disable)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the internal admin API
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for the admin API
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Maximum idle connections per host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Max time to wait for an upstream once the gate is open (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Max time to wait for a readiness check, 0 disables (default: 0)
    ///
    /// Blocking checks are held open by the control service for up to their own
    /// timeout, so this should stay above any `sablier_blocking_timeout`.
    #[serde(default)]
    pub control_timeout_secs: u64,

    /// Largest control service reply buffered per check (default: 4 MiB)
    #[serde(default = "default_control_max_reply_bytes")]
    pub control_max_reply_bytes: usize,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn control_timeout(&self) -> Option<Duration> {
        (self.control_timeout_secs > 0).then(|| Duration::from_secs(self.control_timeout_secs))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            control_timeout_secs: 0,
            control_max_reply_bytes: default_control_max_reply_bytes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControlConfig {
    /// Control service base URL, used when a route does not set `sablier_url`
    #[serde(default = "default_control_url")]
    pub url: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            url: default_control_url(),
        }
    }
}

/// Where an internal redirect sends the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectTarget {
    /// `@name`, looked up in `[upstreams]`
    Upstream(String),
    /// `http://host:port`
    Address(String),
}

impl RedirectTarget {
    pub fn parse(target: &str) -> Result<Self, String> {
        let target = target.trim();

        if let Some(name) = target.strip_prefix('@') {
            if name.is_empty() {
                return Err("upstream name after '@' is empty".to_string());
            }
            return Ok(RedirectTarget::Upstream(name.to_string()));
        }

        let uri: Uri = target
            .parse()
            .map_err(|e| format!("'{}' is not a valid redirect target: {}", target, e))?;

        if uri.scheme_str() != Some("http") {
            return Err(format!("'{}' must use the http scheme or '@upstream'", target));
        }
        if !matches!(uri.path(), "" | "/") || uri.query().is_some() {
            return Err(format!("'{}' must not carry a path", target));
        }

        match uri.authority() {
            Some(authority) => Ok(RedirectTarget::Address(authority.to_string())),
            None => Err(format!("'{}' has no host", target)),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    30
}

fn default_control_max_reply_bytes() -> usize {
    DEFAULT_MAX_REPLY_BYTES
}

fn default_control_url() -> String {
    "http://sablier:10000".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Route templates merged over `[defaults]`
    pub fn route_templates(&self, host: &str) -> Option<HashMap<String, String>> {
        let route = self.routes.get(host)?;
        let mut merged = self.defaults.clone();
        merged.extend(route.iter().map(|(k, v)| (k.clone(), v.clone())));
        Some(merged)
    }

    /// Validate all configuration
    ///
    /// Templates that reference request values are only checked at request time.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if !is_http_url(&self.control.url) {
            errors.push(format!(
                "control.url '{}' must be an http:// URL",
                self.control.url
            ));
        }

        for (name, address) in &self.upstreams {
            if address.parse::<Authority>().is_err() {
                errors.push(format!(
                    "Upstream '{}': '{}' is not a valid host:port",
                    name, address
                ));
            }
        }

        let mut hosts: Vec<&String> = self.routes.keys().collect();
        hosts.sort();

        // Hosts are matched case-insensitively
        let mut seen: HashMap<String, &String> = HashMap::new();
        for host in &hosts {
            if let Some(other) = seen.insert(host.to_lowercase(), *host) {
                errors.push(format!(
                    "Routes '{}' and '{}' differ only in case",
                    other, host
                ));
            }
        }

        for host in hosts {
            let templates = match self.route_templates(host) {
                Some(t) => t,
                None => continue,
            };
            if let Err(e) = self.validate_route(host, &templates) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    fn validate_route(
        &self,
        host: &str,
        templates: &HashMap<String, String>,
    ) -> Result<(), String> {
        if let Some(url) = templates.get(VAR_URL) {
            if !is_dynamic(url) && !url.trim().is_empty() && !is_http_url(url) {
                return Err(format!(
                    "Route '{}': {} '{}' must be an http:// URL",
                    host, VAR_URL, url
                ));
            }
        }

        match templates.get(VAR_INTERNAL_REDIRECT) {
            None => {
                return Err(format!("Route '{}': '{}' is required", host, VAR_INTERNAL_REDIRECT));
            }
            Some(target) if !is_dynamic(target) => match RedirectTarget::parse(target) {
                Ok(RedirectTarget::Upstream(name)) if !self.upstreams.contains_key(&name) => {
                    return Err(format!("Route '{}': unknown upstream '@{}'", host, name));
                }
                Ok(_) => {}
                Err(e) => return Err(format!("Route '{}': {}", host, e)),
            },
            Some(_) => {}
        }

        let declared = |key: &str| {
            templates
                .get(key)
                .map(|t| is_dynamic(t) || !t.trim().is_empty())
                .unwrap_or(false)
        };
        let static_value = |key: &str| {
            templates
                .get(key)
                .is_some_and(|t| !is_dynamic(t) && !t.trim().is_empty())
        };

        if !declared(VAR_NAMES) && !declared(VAR_GROUP) {
            return Err(format!(
                "Route '{}': you must specify {} or {}",
                host, VAR_NAMES, VAR_GROUP
            ));
        }

        if static_value(VAR_NAMES) && static_value(VAR_GROUP) {
            return Err(format!(
                "Route '{}': you must specify either {} or {}, not both",
                host, VAR_NAMES, VAR_GROUP
            ));
        }

        Ok(())
    }
}

/// Plain `http://` URL with a host, the only kind the pooled client can reach
fn is_http_url(url: &str) -> bool {
    url.parse::<Uri>()
        .is_ok_and(|uri| uri.scheme_str() == Some("http") && uri.authority().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
[server]
port = 8080
bind = "127.0.0.1"
admin_port = 9000
control_timeout_secs = 120

[control]
url = "http://sablier.internal:10000"

[upstreams]
whoami = "127.0.0.1:3000"
api = "10.0.0.5:8080"

[defaults]
sablier_session_duration = "1m"
sablier_dynamic_theme = "hacker-terminal"

[routes."whoami.example.com"]
sablier_names = "whoami, whoami-db"
sablier_internal_redirect = "@whoami"
sablier_dynamic_theme = "ghost"

[routes."api.example.com"]
sablier_group = "api"
sablier_blocking_timeout = "30s"
sablier_internal_redirect = "http://10.0.0.5:8080"
"#;

    #[test]
    fn test_parse_config() {
        let config: Config = toml::from_str(EXAMPLE).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.admin_port, 9000);
        assert_eq!(config.server.control_timeout(), Some(Duration::from_secs(120)));
        assert_eq!(config.control.url, "http://sablier.internal:10000");
        assert_eq!(config.upstreams.len(), 2);
        assert_eq!(config.routes.len(), 2);
        config.validate().unwrap();
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 80);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.admin_port, 9999);
        assert_eq!(config.pool_max_idle_per_host, 10);
        assert_eq!(config.pool_idle_timeout_secs, 90);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.control_timeout(), None);
        assert_eq!(config.control_max_reply_bytes, 4 * 1024 * 1024);
        assert_eq!(ControlConfig::default().url, "http://sablier:10000");
    }

    #[test]
    fn test_route_templates_inherit_defaults() {
        let config: Config = toml::from_str(EXAMPLE).unwrap();

        let whoami = config.route_templates("whoami.example.com").unwrap();
        assert_eq!(whoami["sablier_session_duration"], "1m");
        assert_eq!(whoami["sablier_dynamic_theme"], "ghost");

        let api = config.route_templates("api.example.com").unwrap();
        assert_eq!(api["sablier_dynamic_theme"], "hacker-terminal");
        assert!(config.route_templates("other.example.com").is_none());
    }

    #[test]
    fn test_redirect_target_parse() {
        assert_eq!(
            RedirectTarget::parse("@app").unwrap(),
            RedirectTarget::Upstream("app".to_string())
        );
        assert_eq!(
            RedirectTarget::parse("http://127.0.0.1:3000").unwrap(),
            RedirectTarget::Address("127.0.0.1:3000".to_string())
        );
        assert_eq!(
            RedirectTarget::parse("http://backend:3000/").unwrap(),
            RedirectTarget::Address("backend:3000".to_string())
        );
        assert!(RedirectTarget::parse("@").is_err());
        assert!(RedirectTarget::parse("https://backend:3000").is_err());
        assert!(RedirectTarget::parse("http://backend:3000/app").is_err());
        assert!(RedirectTarget::parse("/internal").is_err());
    }

    #[test]
    fn test_validate_rejects_missing_target() {
        let config: Config = toml::from_str(
            r#"
[upstreams]
app = "127.0.0.1:3000"

[routes."app.local"]
sablier_names = " "
sablier_internal_redirect = "@app"
"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("you must specify sablier_names or sablier_group"));
    }

    #[test]
    fn test_validate_rejects_names_and_group() {
        let config: Config = toml::from_str(
            r#"
[upstreams]
app = "127.0.0.1:3000"

[routes."app.local"]
sablier_names = "app"
sablier_group = "web"
sablier_internal_redirect = "@app"
"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("not both"));
    }

    #[test]
    fn test_validate_allows_request_driven_targets() {
        let config: Config = toml::from_str(
            r#"
[upstreams]
app = "127.0.0.1:3000"

[routes."_"]
sablier_names = "$http_x_sablier_names"
sablier_group = "$arg_group"
sablier_internal_redirect = "@app"
"#,
        )
        .unwrap();

        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_non_http_route_url() {
        let config: Config = toml::from_str(
            r#"
[upstreams]
app = "127.0.0.1:3000"

[routes."app.local"]
sablier_url = "https://sablier.example.com"
sablier_names = "app"
sablier_internal_redirect = "@app"
"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains(
            "Route 'app.local': sablier_url 'https://sablier.example.com' must be an http:// URL"
        ));
    }

    #[test]
    fn test_validate_allows_request_driven_route_url() {
        let config: Config = toml::from_str(
            r#"
[upstreams]
app = "127.0.0.1:3000"

[routes."app.local"]
sablier_url = "$http_x_sablier_url"
sablier_names = "app"
sablier_internal_redirect = "@app"

[routes."api.local"]
sablier_url = "http://sablier.internal:10000/"
sablier_group = "api"
sablier_internal_redirect = "@app"
"#,
        )
        .unwrap();

        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_hosts_differing_in_case() {
        let config: Config = toml::from_str(
            r#"
[upstreams]
app = "127.0.0.1:3000"

[routes."app.local"]
sablier_names = "app"
sablier_internal_redirect = "@app"

[routes."App.Local"]
sablier_names = "app"
sablier_internal_redirect = "@app"
"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("Routes 'App.Local' and 'app.local' differ only in case"));
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let config: Config = toml::from_str(
            r#"
[control]
url = "sablier:10000"

[upstreams]
broken = "not a host"

[routes."a.local"]
sablier_group = "a"

[routes."b.local"]
sablier_group = "b"
sablier_internal_redirect = "@missing"
"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("control.url"));
        assert!(err.contains("Upstream 'broken'"));
        assert!(err.contains("Route 'a.local': 'sablier_internal_redirect' is required"));
        assert!(err.contains("Route 'b.local': unknown upstream '@missing'"));
    }
}
