//! Builds the typed gate configuration from a request's variable scope

use crate::error::GateError;
use crate::variables::VariableSource;

pub const VAR_URL: &str = "sablier_url";
pub const VAR_NAMES: &str = "sablier_names";
pub const VAR_GROUP: &str = "sablier_group";
pub const VAR_SESSION_DURATION: &str = "sablier_session_duration";
pub const VAR_INTERNAL_REDIRECT: &str = "sablier_internal_redirect";
pub const VAR_DISPLAY_NAME: &str = "sablier_dynamic_name";
pub const VAR_SHOW_DETAILS: &str = "sablier_dynamic_show_details";
pub const VAR_THEME: &str = "sablier_dynamic_theme";
pub const VAR_REFRESH_FREQUENCY: &str = "sablier_dynamic_refresh_frequency";
pub const VAR_BLOCKING_TIMEOUT: &str = "sablier_blocking_timeout";

/// Gate settings for one inbound request
///
/// Values are copied literally from the scope. Deciding what they mean
/// (strategy, target) happens in [`crate::strategy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateConfig {
    /// Base URL of the control service
    pub control_service_url: String,
    /// Comma separated backend names
    pub target_names: Option<String>,
    /// Group label selecting backends
    pub target_group: Option<String>,
    /// How long started backends stay warm, passed through untouched
    pub session_duration: String,
    /// Where the request goes once the backends are ready
    pub internal_redirect_target: String,
    pub display_name: String,
    pub theme: String,
    pub refresh_frequency: String,
    pub show_details: String,
    /// Non-empty value selects the blocking strategy
    pub blocking_timeout: Option<String>,
}

impl GateConfig {
    /// Read the gate variables for the current request.
    ///
    /// `sablier_url` falls back to `default_control_url`. The internal
    /// redirect target is the only required value.
    pub fn from_scope(
        scope: &impl VariableSource,
        default_control_url: &str,
    ) -> Result<Self, GateError> {
        let internal_redirect_target = scope
            .get(VAR_INTERNAL_REDIRECT)
            .filter(|t| !t.trim().is_empty())
            .ok_or(GateError::MissingRedirect)?;

        let control_service_url = scope
            .get(VAR_URL)
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| default_control_url.to_string());

        Ok(Self {
            control_service_url,
            target_names: scope.get(VAR_NAMES),
            target_group: scope.get(VAR_GROUP),
            session_duration: scope.get(VAR_SESSION_DURATION).unwrap_or_default(),
            internal_redirect_target,
            display_name: scope.get(VAR_DISPLAY_NAME).unwrap_or_default(),
            theme: scope.get(VAR_THEME).unwrap_or_default(),
            refresh_frequency: scope.get(VAR_REFRESH_FREQUENCY).unwrap_or_default(),
            show_details: scope.get(VAR_SHOW_DETAILS).unwrap_or_default(),
            blocking_timeout: scope.get(VAR_BLOCKING_TIMEOUT),
        })
    }
}
