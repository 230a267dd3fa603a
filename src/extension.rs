//! Extension negotiation
//!
//! Extensions are declared in an [`ExtensionRegistry`] with typed parameters. The caller
//! enables a subset with concrete values; those are serialized into the handshake as
//! `name; param=value; anonymous, other`. The server answers with the extensions it
//! accepted, which must be a subset of the enabled ones and carry only string-typed
//! parameters.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::error::{Error, Result};

/// Declared type of an extension parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterType {
    String,
    Integer,
    Boolean,
    /// Serialized as whole milliseconds
    Duration,
}

/// A typed parameter value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    Duration(Duration),
}

impl ParameterValue {
    /// The type of this value
    pub fn kind(&self) -> ParameterType {
        match self {
            ParameterValue::String(_) => ParameterType::String,
            ParameterValue::Integer(_) => ParameterType::Integer,
            ParameterValue::Boolean(_) => ParameterType::Boolean,
            ParameterValue::Duration(_) => ParameterType::Duration,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::String(s) => f.write_str(s),
            ParameterValue::Integer(i) => write!(f, "{i}"),
            ParameterValue::Boolean(b) => write!(f, "{b}"),
            ParameterValue::Duration(d) => write!(f, "{}", d.as_millis()),
        }
    }
}

impl From<&str> for ParameterValue {
    fn from(s: &str) -> Self {
        ParameterValue::String(s.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(s: String) -> Self {
        ParameterValue::String(s)
    }
}

impl From<i64> for ParameterValue {
    fn from(i: i64) -> Self {
        ParameterValue::Integer(i)
    }
}

impl From<bool> for ParameterValue {
    fn from(b: bool) -> Self {
        ParameterValue::Boolean(b)
    }
}

impl From<Duration> for ParameterValue {
    fn from(d: Duration) -> Self {
        ParameterValue::Duration(d)
    }
}

/// Declaration of one extension parameter
#[derive(Debug, Clone)]
pub struct ParameterDef {
    pub name: String,
    pub kind: ParameterType,
    /// Anonymous parameters are written as a bare value, without `name=`
    pub anonymous: bool,
}

/// Declaration of an extension and its parameters
#[derive(Debug, Clone)]
pub struct ExtensionDescriptor {
    name: String,
    parameters: Vec<ParameterDef>,
}

impl ExtensionDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
        }
    }

    /// Declare a named parameter
    pub fn parameter(mut self, name: impl Into<String>, kind: ParameterType) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind,
            anonymous: false,
        });
        self
    }

    /// Declare an anonymous parameter
    pub fn anonymous(mut self, name: impl Into<String>, kind: ParameterType) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind,
            anonymous: true,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &[ParameterDef] {
        &self.parameters
    }

    fn find(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// Known extensions, populated once and passed to the connection by construction
#[derive(Debug, Clone, Default)]
pub struct ExtensionRegistry {
    extensions: HashMap<String, ExtensionDescriptor>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an extension, replacing any previous declaration with the same name
    pub fn register(&mut self, descriptor: ExtensionDescriptor) -> &mut Self {
        self.extensions
            .insert(descriptor.name.clone(), descriptor);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ExtensionDescriptor> {
        self.extensions.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Serialize the enabled extensions for the handshake
    ///
    /// Every enabled extension must be registered and every value must match its
    /// declared type. Returns `None` when nothing is enabled.
    pub fn serialize(&self, enabled: &[EnabledExtension]) -> Result<Option<String>> {
        if enabled.is_empty() {
            return Ok(None);
        }

        let mut parts = Vec::with_capacity(enabled.len());
        for ext in enabled {
            let descriptor = self.get(&ext.name).ok_or_else(|| {
                Error::ExtensionNegotiation(format!("extension {} is not registered", ext.name))
            })?;

            let mut part = ext.name.clone();
            for (name, value) in &ext.parameters {
                let def = descriptor.find(name).ok_or_else(|| {
                    Error::ExtensionNegotiation(format!(
                        "extension {} has no parameter {name}",
                        ext.name
                    ))
                })?;
                if def.kind != value.kind() {
                    return Err(Error::ExtensionNegotiation(format!(
                        "parameter {name} of {} expects {:?}",
                        ext.name, def.kind
                    )));
                }
                if def.anonymous {
                    part.push_str(&format!("; {value}"));
                } else {
                    part.push_str(&format!("; {name}={value}"));
                }
            }
            parts.push(part);
        }

        Ok(Some(parts.join(", ")))
    }

    /// Parse and validate the server's negotiated extensions
    ///
    /// Fails when an extension was not enabled or a parameter is not declared as a
    /// string.
    pub fn negotiate(
        &self,
        enabled: &[EnabledExtension],
        header: Option<&str>,
    ) -> Result<Vec<NegotiatedExtension>> {
        let negotiated = match header {
            Some(h) => parse_extensions(h),
            None => return Ok(Vec::new()),
        };

        for ext in &negotiated {
            if !enabled.iter().any(|e| e.name == ext.name) {
                return Err(Error::ExtensionNegotiation(format!(
                    "server negotiated {} which was not enabled",
                    ext.name
                )));
            }
            let descriptor = self.get(&ext.name).ok_or_else(|| {
                Error::ExtensionNegotiation(format!("extension {} is not registered", ext.name))
            })?;

            let mut anonymous = descriptor.parameters.iter().filter(|p| p.anonymous);
            for (name, _) in &ext.parameters {
                let def = match name {
                    Some(name) => descriptor.find(name),
                    None => anonymous.next(),
                };
                match def {
                    Some(def) if def.kind == ParameterType::String => {}
                    Some(def) => {
                        return Err(Error::ExtensionNegotiation(format!(
                            "negotiated parameter {} of {} is not string-typed",
                            def.name, ext.name
                        )));
                    }
                    None => {
                        return Err(Error::ExtensionNegotiation(format!(
                            "unknown parameter {} in negotiated {}",
                            name.as_deref().unwrap_or("<anonymous>"),
                            ext.name
                        )));
                    }
                }
            }
        }

        Ok(negotiated)
    }
}

/// An extension the caller wants, with concrete parameter values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnabledExtension {
    pub name: String,
    pub parameters: Vec<(String, ParameterValue)>,
}

impl EnabledExtension {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
        }
    }

    /// Set a parameter value
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.parameters.push((name.into(), value.into()));
        self
    }
}

/// An extension accepted by the server; values are always strings on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedExtension {
    pub name: String,
    /// `(Some(name), value)` for named parameters, `(None, value)` for anonymous ones
    pub parameters: Vec<(Option<String>, String)>,
}

impl NegotiatedExtension {
    /// Value of a named parameter
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(n, _)| n.as_deref() == Some(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Parse an extensions header (`a; x=1; y, b`)
pub fn parse_extensions(header: &str) -> Vec<NegotiatedExtension> {
    header
        .split(',')
        .filter_map(|item| {
            let mut tokens = item.split(';').map(str::trim);
            let name = tokens.next().filter(|n| !n.is_empty())?;
            let parameters = tokens
                .filter(|t| !t.is_empty())
                .map(|t| match t.split_once('=') {
                    Some((k, v)) => (Some(k.trim().to_string()), unquote(v.trim()).to_string()),
                    None => (None, unquote(t).to_string()),
                })
                .collect();
            Some(NegotiatedExtension {
                name: name.to_string(),
                parameters,
            })
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}
