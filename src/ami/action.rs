//! Outbound AMI action construction.

use crate::config::Encoding;
use crate::constants::AMI_EOL;
use crate::error::{Error, Result};
use crate::headers::Headers;

/// Validate that a user-provided string contains no newline characters.
///
/// AMI frames are line-delimited; embedded newlines would allow
/// injection of arbitrary headers or actions.
fn validate_no_newlines(s: &str, context: &str) -> Result<()> {
    if s.contains('\n') || s.contains('\r') {
        return Err(Error::protocol(format!(
            "{context} must not contain newlines"
        )));
    }
    Ok(())
}

/// Builder for an outbound AMI action.
///
/// The engine assigns the `ActionID`; headers keep insertion order and
/// variable bindings are emitted as repeated `Variable: key=value`
/// lines.
///
/// ```
/// use asterisk_control::ami::Action;
///
/// let action = Action::new("Originate")
///     .header("Channel", "SIP/100").unwrap()
///     .header("Context", "default").unwrap()
///     .variable("CALL_TAG", "42").unwrap();
/// assert_eq!(action.name(), "Originate");
/// ```
#[derive(Debug, Clone)]
pub struct Action {
    name: String,
    headers: Headers,
    variables: Vec<(String, String)>,
    completed_by: Option<String>,
}

impl Action {
    /// Start building the action with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            headers: Headers::new(),
            variables: Vec::new(),
            completed_by: None,
        }
    }

    /// Add a header.
    ///
    /// Returns an error on embedded newlines, and for `Action` /
    /// `ActionID`, which the engine emits itself.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        validate_no_newlines(name, "header name")?;
        validate_no_newlines(value, "header value")?;
        if name.eq_ignore_ascii_case("action") || name.eq_ignore_ascii_case("actionid") {
            return Err(Error::protocol(format!(
                "{name} is emitted by the engine and cannot be supplied"
            )));
        }
        self.headers.push(name, value);
        Ok(self)
    }

    /// Add a variable binding, emitted as `Variable: key=value`.
    pub fn variable(mut self, key: &str, value: &str) -> Result<Self> {
        validate_no_newlines(key, "variable name")?;
        validate_no_newlines(value, "variable value")?;
        self.variables.push((key.to_string(), value.to_string()));
        Ok(self)
    }

    /// Mark the action as list-style, terminated by the named event.
    ///
    /// Takes precedence over the engine's configured
    /// `list_action_terminators` entry for this action name.
    pub fn completed_by(mut self, event_name: impl Into<String>) -> Self {
        self.completed_by = Some(event_name.into());
        self
    }

    /// Action name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Headers added so far, in insertion order.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub(crate) fn terminator(&self) -> Option<&str> {
        self.completed_by.as_deref()
    }

    pub(crate) fn is_login(&self) -> bool {
        self.name.eq_ignore_ascii_case("login")
    }

    /// Actions permitted before authentication completes.
    pub(crate) fn is_auth(&self) -> bool {
        self.is_login() || self.name.eq_ignore_ascii_case("challenge")
    }

    /// Wire frame for this action under the given id.
    pub(crate) fn to_wire(&self, action_id: &str, encoding: Encoding) -> Result<Vec<u8>> {
        validate_no_newlines(&self.name, "action name")?;
        let mut lines = Vec::with_capacity(self.headers.len() + self.variables.len() + 4);
        lines.push(format!("Action: {}", self.name));
        lines.push(format!("ActionID: {action_id}"));
        for (name, value) in self.headers.iter() {
            lines.push(format!("{name}: {value}"));
        }
        for (key, value) in &self.variables {
            lines.push(format!("Variable: {key}={value}"));
        }
        lines.push(String::new());
        lines.push(String::new());
        encoding.encode(&lines.join(AMI_EOL))
    }
}
