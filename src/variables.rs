//! Per-request variable scope
//!
//! Routes declare their gate settings as string templates, the same way an
//! nginx location uses `set $sablierNames ...;`. Templates may reference
//! values taken from the inbound request (`$host`, `$http_x_names`,
//! `$arg_timeout`, ...) and are rendered once per request.

use hyper::header::HeaderMap;
use hyper::Request;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Anything the extractor can read gate variables from
pub trait VariableSource {
    /// Resolve a variable by name. `None` means the variable is not declared.
    fn get(&self, name: &str) -> Option<String>;
}

impl VariableSource for HashMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        HashMap::get(self, name).cloned()
    }
}

/// Built-in values captured from the inbound request
#[derive(Debug, Clone, Default)]
pub struct RequestVariables {
    host: String,
    uri: String,
    args: String,
    scheme: &'static str,
    method: String,
    remote_addr: String,
    headers: HeaderMap,
    query: Vec<(String, String)>,
}

impl RequestVariables {
    /// Snapshot the request values templates may reference
    pub fn capture<B>(req: &Request<B>, client_addr: SocketAddr, is_tls: bool) -> Self {
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| req.uri().host())
            .map(|h| h.split(':').next().unwrap_or(h).to_lowercase())
            .unwrap_or_default();

        let args = req.uri().query().unwrap_or("").to_string();
        let query = serde_urlencoded::from_str::<Vec<(String, String)>>(&args).unwrap_or_default();

        Self {
            host,
            uri: req.uri().path().to_string(),
            args,
            scheme: if is_tls { "https" } else { "http" },
            method: req.method().to_string(),
            remote_addr: client_addr.ip().to_string(),
            headers: req.headers().clone(),
            query,
        }
    }

    /// Value of a built-in variable, empty when unknown
    pub fn builtin(&self, name: &str) -> String {
        match name {
            "host" => self.host.clone(),
            "uri" => self.uri.clone(),
            "args" | "query_string" => self.args.clone(),
            "request_uri" => {
                if self.args.is_empty() {
                    self.uri.clone()
                } else {
                    format!("{}?{}", self.uri, self.args)
                }
            }
            "scheme" => self.scheme.to_string(),
            "request_method" => self.method.clone(),
            "remote_addr" => self.remote_addr.clone(),
            _ => {
                if let Some(header) = name.strip_prefix("http_") {
                    let header = header.replace('_', "-");
                    self.headers
                        .get(header.as_str())
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string()
                } else if let Some(arg) = name.strip_prefix("arg_") {
                    self.query
                        .iter()
                        .find(|(k, _)| k == arg)
                        .map(|(_, v)| v.clone())
                        .unwrap_or_default()
                } else {
                    String::new()
                }
            }
        }
    }

    /// Render a template, substituting `$name` and `${name}` references
    pub fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut chars = template.char_indices().peekable();

        while let Some((_, c)) = chars.next() {
            if c != '$' {
                out.push(c);
                continue;
            }

            match chars.peek().copied() {
                Some((_, '$')) => {
                    chars.next();
                    out.push('$');
                }
                Some((start, '{')) => {
                    let rest = &template[start + 1..];
                    match rest.find('}') {
                        Some(end) => {
                            out.push_str(&self.builtin(&rest[..end]));
                            // skip the name and the closing brace
                            for _ in 0..rest[..=end].chars().count() + 1 {
                                chars.next();
                            }
                        }
                        None => out.push('$'),
                    }
                }
                _ => {
                    let mut name = String::new();
                    while let Some((_, n)) = chars.peek().copied() {
                        if n.is_ascii_alphanumeric() || n == '_' {
                            name.push(n);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    if name.is_empty() {
                        out.push('$');
                    } else {
                        out.push_str(&self.builtin(&name));
                    }
                }
            }
        }

        out
    }
}

/// A route's declared templates bound to one request
pub struct VariableScope<'a> {
    templates: &'a HashMap<String, String>,
    request: &'a RequestVariables,
}

impl<'a> VariableScope<'a> {
    pub fn new(templates: &'a HashMap<String, String>, request: &'a RequestVariables) -> Self {
        Self { templates, request }
    }
}

impl VariableSource for VariableScope<'_> {
    fn get(&self, name: &str) -> Option<String> {
        self.templates.get(name).map(|t| self.request.render(t))
    }
}

/// Whether a template references request values (and so cannot be checked at load time)
pub fn is_dynamic(template: &str) -> bool {
    template.contains('$')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(uri: &str) -> RequestVariables {
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .header("Host", "App.Example.com:8080")
            .header("X-Sablier-Names", "web, api")
            .body(())
            .unwrap();
        RequestVariables::capture(&req, "10.0.0.7:5555".parse().unwrap(), false)
    }

    #[test]
    fn test_builtins() {
        let vars = capture("/dashboard?timeout=30s&theme=ghost");

        assert_eq!(vars.builtin("host"), "app.example.com");
        assert_eq!(vars.builtin("uri"), "/dashboard");
        assert_eq!(vars.builtin("args"), "timeout=30s&theme=ghost");
        assert_eq!(vars.builtin("request_uri"), "/dashboard?timeout=30s&theme=ghost");
        assert_eq!(vars.builtin("scheme"), "http");
        assert_eq!(vars.builtin("request_method"), "POST");
        assert_eq!(vars.builtin("remote_addr"), "10.0.0.7");
        assert_eq!(vars.builtin("http_x_sablier_names"), "web, api");
        assert_eq!(vars.builtin("arg_timeout"), "30s");
        assert_eq!(vars.builtin("arg_missing"), "");
        assert_eq!(vars.builtin("nope"), "");
    }

    #[test]
    fn test_render_templates() {
        let vars = capture("/?timeout=1m");

        assert_eq!(vars.render("plain"), "plain");
        assert_eq!(vars.render("$arg_timeout"), "1m");
        assert_eq!(vars.render("${host}-pod"), "app.example.com-pod");
        assert_eq!(vars.render("$host/x"), "app.example.com/x");
        assert_eq!(vars.render("cost: $$5"), "cost: $5");
        assert_eq!(vars.render("trailing $"), "trailing $");
        assert_eq!(vars.render("${unclosed"), "${unclosed");
        assert_eq!(vars.render("$unknown!"), "!");
    }

    #[test]
    fn test_scope_only_exposes_declared_templates() {
        let vars = capture("/");
        let mut templates = HashMap::new();
        templates.insert("sablier_names".to_string(), "$http_x_sablier_names".to_string());

        let scope = VariableScope::new(&templates, &vars);
        assert_eq!(scope.get("sablier_names").as_deref(), Some("web, api"));
        assert_eq!(scope.get("sablier_group"), None);
    }

    #[test]
    fn test_is_dynamic() {
        assert!(is_dynamic("$host"));
        assert!(!is_dynamic("app,app2"));
    }
}
