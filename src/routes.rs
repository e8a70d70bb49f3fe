//! Host routing table with hot reload support

use crate::config::{Config, RedirectTarget};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Host that matches requests without a dedicated route
pub const CATCH_ALL_HOST: &str = "_";

/// A configured route and its merged variable templates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub host: String,
    pub templates: HashMap<String, String>,
}

/// Routes, upstreams and the control service default, swapped as one on reload
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, Arc<Route>>,
    upstreams: HashMap<String, String>,
    control_url: String,
}

/// Shared reference to the routing table (for hot reload support)
pub type SharedRoutes = Arc<RwLock<RouteTable>>;

impl RouteTable {
    pub fn from_config(config: &Config) -> Self {
        let routes = config
            .routes
            .keys()
            .filter_map(|host| {
                let templates = config.route_templates(host)?;
                // Inbound hostnames are lowercased before lookup
                let host = host.to_lowercase();
                Some((host.clone(), Arc::new(Route { host, templates })))
            })
            .collect();

        Self {
            routes,
            upstreams: config.upstreams.clone(),
            control_url: config.control.url.clone(),
        }
    }

    pub fn shared(self) -> SharedRoutes {
        Arc::new(RwLock::new(self))
    }

    /// Route for `host`, falling back to the catch-all route
    pub fn lookup(&self, host: &str) -> Option<Arc<Route>> {
        self.routes
            .get(host)
            .or_else(|| self.routes.get(CATCH_ALL_HOST))
            .cloned()
    }

    /// Resolve an internal redirect target to the `host:port` to forward to
    pub fn resolve_redirect(&self, target: &str) -> Result<String, String> {
        match RedirectTarget::parse(target)? {
            RedirectTarget::Upstream(name) => self
                .upstreams
                .get(&name)
                .cloned()
                .ok_or_else(|| format!("unknown upstream '@{}'", name)),
            RedirectTarget::Address(authority) => Ok(authority),
        }
    }

    pub fn control_url(&self) -> &str {
        &self.control_url
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// All routes, sorted by host
    pub fn routes(&self) -> Vec<Arc<Route>> {
        let mut routes: Vec<Arc<Route>> = self.routes.values().cloned().collect();
        routes.sort_by(|a, b| a.host.cmp(&b.host));
        routes
    }
}

/// Result of a configuration reload operation
#[derive(Debug, Clone, Default)]
pub struct ReloadResult {
    /// Newly added routes
    pub added: Vec<String>,
    /// Removed routes
    pub removed: Vec<String>,
    /// Routes that existed before and may have changed
    pub updated: Vec<String>,
}

/// Reload routes and upstreams from the configuration file.
///
/// Server settings (ports, pool, timeouts) are fixed at startup and ignored here.
pub fn reload<P: AsRef<Path>>(shared: &SharedRoutes, path: P) -> anyhow::Result<ReloadResult> {
    let config = Config::load(path)?;
    Ok(apply(shared, RouteTable::from_config(&config)))
}

/// Swap in a new routing table
pub fn apply(shared: &SharedRoutes, table: RouteTable) -> ReloadResult {
    let mut result = ReloadResult::default();

    let mut current = shared.write();
    let new_hosts: HashSet<&String> = table.routes.keys().collect();

    for host in current.routes.keys() {
        if !new_hosts.contains(host) {
            info!(host, "Removing route (config reload)");
            result.removed.push(host.clone());
        }
    }

    for host in table.routes.keys() {
        if current.routes.contains_key(host) {
            result.updated.push(host.clone());
        } else {
            info!(host, "Adding route (config reload)");
            result.added.push(host.clone());
        }
    }

    result.added.sort();
    result.removed.sort();
    result.updated.sort();

    *current = table;

    info!(
        added = result.added.len(),
        removed = result.removed.len(),
        updated = result.updated.len(),
        "Routes reloaded"
    );

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(toml: &str) -> RouteTable {
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        RouteTable::from_config(&config)
    }

    const BASE: &str = r#"
[upstreams]
app = "127.0.0.1:3000"

[routes."app.local"]
sablier_names = "app"
sablier_internal_redirect = "@app"

[routes."_"]
sablier_group = "default"
sablier_internal_redirect = "http://127.0.0.1:4000"
"#;

    #[test]
    fn test_lookup_falls_back_to_catch_all() {
        let routes = table(BASE);

        assert_eq!(routes.lookup("app.local").unwrap().host, "app.local");
        assert_eq!(routes.lookup("other.local").unwrap().host, "_");
        assert_eq!(routes.len(), 2);
        assert_eq!(routes.control_url(), "http://sablier:10000");
    }

    #[test]
    fn test_lookup_without_catch_all() {
        let routes = table(
            r#"
[upstreams]
app = "127.0.0.1:3000"

[routes."app.local"]
sablier_names = "app"
sablier_internal_redirect = "@app"
"#,
        );
        assert!(routes.lookup("other.local").is_none());
    }

    #[test]
    fn test_mixed_case_route_host() {
        let routes = table(
            r#"
[upstreams]
app = "127.0.0.1:3000"

[routes."App.Example.com"]
sablier_names = "app"
sablier_internal_redirect = "@app"
"#,
        );

        let route = routes.lookup("app.example.com").unwrap();
        assert_eq!(route.host, "app.example.com");
        assert_eq!(route.templates["sablier_names"], "app");
    }

    #[test]
    fn test_resolve_redirect() {
        let routes = table(BASE);

        assert_eq!(routes.resolve_redirect("@app").unwrap(), "127.0.0.1:3000");
        assert_eq!(
            routes.resolve_redirect("http://127.0.0.1:4000").unwrap(),
            "127.0.0.1:4000"
        );
        assert!(routes.resolve_redirect("@missing").unwrap_err().contains("unknown upstream"));
        assert!(routes.resolve_redirect("ftp://x").is_err());
    }

    #[test]
    fn test_apply_reports_changes() {
        let shared = table(BASE).shared();

        let result = apply(
            &shared,
            table(
                r#"
[upstreams]
app = "127.0.0.1:3000"

[routes."app.local"]
sablier_names = "app, app2"
sablier_internal_redirect = "@app"

[routes."new.local"]
sablier_group = "new"
sablier_internal_redirect = "@app"
"#,
            ),
        );

        assert_eq!(result.added, vec!["new.local".to_string()]);
        assert_eq!(result.removed, vec!["_".to_string()]);
        assert_eq!(result.updated, vec!["app.local".to_string()]);

        let routes = shared.read();
        assert_eq!(
            routes.lookup("app.local").unwrap().templates["sablier_names"],
            "app, app2"
        );
        assert!(routes.lookup("gone.local").is_none());
    }
}
