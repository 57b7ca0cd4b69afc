//! Allow-rules for outbound requests made by worker processes.
//!
//! The host consults these predicates before letting a sandboxed worker send
//! a broadcast, start an activity, or start/bind a service on its behalf. They
//! hold no state. The `enforce_*` variants turn a refusal into
//! [`SandboxError::Security`] naming the violated rule.

use std::fmt;

use crate::error::SandboxError;

/// The only action a worker may attach to broadcasts and activity starts.
pub const ALLOWED_INTENT_ACTION: &str = "sandbox.intent.action.VIEW";

/// The only package whose services a worker may start or bind.
pub const SYSTEM_SERVICES_PACKAGE: &str = "sandbox.system.services";

/// Fully qualified component name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComponentName {
    package: String,
    class: String,
}

impl ComponentName {
    /// Builds a component name.
    #[must_use]
    pub fn new(package: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            class: class.into(),
        }
    }

    /// Package hosting the component.
    #[must_use]
    pub fn package(&self) -> &str {
        self.package.as_str()
    }

    /// Component class.
    #[must_use]
    pub fn class(&self) -> &str {
        self.class.as_str()
    }
}

impl fmt::Display for ComponentName {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}/{}", self.package, self.class)
    }
}

/// Outbound request a worker wants the host to perform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Intent {
    action: Option<String>,
    component: Option<ComponentName>,
}

impl Intent {
    /// Empty intent with neither action nor component.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the action.
    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Sets an explicit target component.
    #[must_use]
    pub fn with_component(mut self, component: ComponentName) -> Self {
        self.component = Some(component);
        self
    }

    /// Action, if any.
    #[must_use]
    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    /// Target component, if explicit.
    #[must_use]
    pub const fn component(&self) -> Option<&ComponentName> {
        self.component.as_ref()
    }
}

/// Returns `true` when a worker may send this broadcast.
#[must_use]
pub fn can_broadcast(intent: &Intent) -> bool {
    action_rule(intent).is_ok()
}

/// Returns `true` when a worker may start this activity.
#[must_use]
pub fn can_start_activity(intent: &Intent) -> bool {
    action_rule(intent).is_ok()
}

/// Returns `true` when a worker may start or bind this service.
#[must_use]
pub fn can_bind_or_start_service(intent: &Intent) -> bool {
    service_rule(intent).is_ok()
}

/// Rejects broadcasts outside the allow-rule.
///
/// # Errors
///
/// Returns [`SandboxError::Security`] when the intent carries an action other
/// than [`ALLOWED_INTENT_ACTION`].
pub fn enforce_allowed_to_send_broadcast(intent: &Intent) -> Result<(), SandboxError> {
    action_rule(intent).map_err(|violation| {
        SandboxError::security(format!("sandbox may not send broadcast: {violation}"))
    })
}

/// Rejects activity starts outside the allow-rule.
///
/// # Errors
///
/// Returns [`SandboxError::Security`] when the intent carries an action other
/// than [`ALLOWED_INTENT_ACTION`].
pub fn enforce_allowed_to_start_activity(intent: &Intent) -> Result<(), SandboxError> {
    action_rule(intent).map_err(|violation| {
        SandboxError::security(format!("sandbox may not start activity: {violation}"))
    })
}

/// Rejects service starts and binds outside the allow-rule.
///
/// # Errors
///
/// Returns [`SandboxError::Security`] unless the intent names a component in
/// [`SYSTEM_SERVICES_PACKAGE`].
pub fn enforce_allowed_to_start_or_bind_service(intent: &Intent) -> Result<(), SandboxError> {
    service_rule(intent).map_err(|violation| {
        SandboxError::security(format!(
            "sandbox may not start or bind service: {violation}"
        ))
    })
}

fn action_rule(intent: &Intent) -> Result<(), String> {
    match intent.action() {
        None => Ok(()),
        Some(action) if action == ALLOWED_INTENT_ACTION => Ok(()),
        Some(action) => Err(format!(
            "only action '{ALLOWED_INTENT_ACTION}' is allowed, got '{action}'"
        )),
    }
}

fn service_rule(intent: &Intent) -> Result<(), String> {
    match intent.component() {
        None => Err(format!(
            "an explicit component in '{SYSTEM_SERVICES_PACKAGE}' is required"
        )),
        Some(component) if component.package() == SYSTEM_SERVICES_PACKAGE => Ok(()),
        Some(component) => Err(format!(
            "only components in '{SYSTEM_SERVICES_PACKAGE}' may be bound, got '{component}'"
        )),
    }
}
