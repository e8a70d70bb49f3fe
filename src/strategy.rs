//! Strategy selection and readiness check construction
//!
//! The control service exposes two strategies:
//!
//! - `dynamic`: answers right away, with a waiting page while the backends start
//! - `blocking`: holds the reply until the backends are ready or `timeout` elapses
//!
//! Which one is used depends only on whether a blocking timeout is configured.

use crate::error::GateError;
use crate::extractor::GateConfig;
use hyper::Uri;
use tracing::warn;

const DYNAMIC_PATH: &str = "/api/strategies/dynamic";
const BLOCKING_PATH: &str = "/api/strategies/blocking";

/// Readiness strategy requested from the control service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    Dynamic,
    Blocking { timeout: String },
}

impl Strategy {
    /// Blocking when a non-empty timeout is present, dynamic otherwise
    pub fn select(blocking_timeout: Option<&str>) -> Self {
        match blocking_timeout {
            Some(timeout) if !timeout.is_empty() => Strategy::Blocking {
                timeout: timeout.to_string(),
            },
            _ => Strategy::Dynamic,
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            Strategy::Dynamic => DYNAMIC_PATH,
            Strategy::Blocking { .. } => BLOCKING_PATH,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Dynamic => "dynamic",
            Strategy::Blocking { .. } => "blocking",
        }
    }
}

/// Which backends the check is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    /// Explicit backend names, in configured order
    Names(Vec<String>),
    /// All backends carrying a group label
    Group(String),
}

impl TargetSelector {
    /// Names take precedence over the group; with neither there is nothing to check.
    pub fn from_config(config: &GateConfig) -> Result<Self, GateError> {
        if let Some(names) = config.target_names.as_deref().filter(|n| !n.is_empty()) {
            let names: Vec<String> = names.split(',').map(|n| n.trim().to_string()).collect();
            if names.iter().any(String::is_empty) {
                warn!(names = ?names, "Target names contain an empty entry");
            }
            return Ok(TargetSelector::Names(names));
        }

        if let Some(group) = config.target_group.as_deref().filter(|g| !g.is_empty()) {
            return Ok(TargetSelector::Group(group.to_string()));
        }

        Err(GateError::MissingTarget)
    }

    fn push_params<'a>(&'a self, params: &mut Vec<(&'static str, &'a str)>) {
        match self {
            TargetSelector::Names(names) => {
                params.extend(names.iter().map(|n| ("names", n.as_str())));
            }
            TargetSelector::Group(group) => params.push(("group", group.as_str())),
        }
    }
}

/// A fully built readiness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRequest {
    pub strategy: Strategy,
    pub target: TargetSelector,
    /// Control service endpoint, without query
    pub url: String,
    /// `application/x-www-form-urlencoded` query string
    pub query: String,
}

impl CheckRequest {
    /// The complete request URI
    pub fn uri(&self) -> Result<Uri, GateError> {
        let raw = format!("{}?{}", self.url, self.query);
        let uri: Uri = raw
            .parse()
            .map_err(|source| GateError::InvalidCheckUri { uri: raw, source })?;

        // The pooled client only speaks plain HTTP
        if uri.scheme_str() != Some("http") || uri.authority().is_none() {
            return Err(GateError::UnsupportedControlUrl(self.url.clone()));
        }

        Ok(uri)
    }
}

/// Decide the strategy and build the check URL and query for a request.
pub fn build_check_request(config: &GateConfig) -> Result<CheckRequest, GateError> {
    let strategy = Strategy::select(config.blocking_timeout.as_deref());
    let target = TargetSelector::from_config(config)?;

    let mut params: Vec<(&str, &str)> = Vec::with_capacity(8);
    target.push_params(&mut params);
    params.push(("session_duration", &config.session_duration));

    match &strategy {
        Strategy::Dynamic => {
            params.push(("display_name", &config.display_name));
            params.push(("theme", &config.theme));
            params.push(("refresh_frequency", &config.refresh_frequency));
            params.push(("show_details", &config.show_details));
        }
        Strategy::Blocking { timeout } => {
            params.push(("timeout", timeout));
        }
    }

    let query = serde_urlencoded::to_string(&params)?;
    let url = format!(
        "{}{}",
        config.control_service_url.trim_end_matches('/'),
        strategy.path()
    );

    Ok(CheckRequest {
        strategy,
        target,
        url,
        query,
    })
}
