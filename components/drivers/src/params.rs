//! Load-time parameters
//!
//! Parameters come either from `name=value` arguments, the way module
//! parameters are passed on load, or from a TOML table with the same keys.

use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

/// IRQ line used when none is given
pub const DEFAULT_IRQ_NUMBER: u32 = 10;

/// How the fast handler decides whether an event on the shared line is ours
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClaimPolicy {
    /// Claim every event and always wake the IRQ thread
    #[default]
    Always,

    /// Consult the device status register: nothing latched is not ours,
    /// `PENDING` alone is acknowledged in place, `DATA` wakes the thread
    StatusRegister,
}

impl FromStr for ClaimPolicy {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "always" => Ok(ClaimPolicy::Always),
            "status-register" | "status_register" => Ok(ClaimPolicy::StatusRegister),
            other => Err(ParamError::InvalidValue {
                name: "claim".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("Malformed parameter '{0}', expected name=value")]
    Malformed(String),

    #[error("Unknown parameter '{0}'")]
    Unknown(String),

    #[error("Invalid value '{value}' for parameter {name}")]
    InvalidValue { name: String, value: String },
}

/// Driver parameters
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModuleParams {
    /// IRQ line to attach to
    pub irq_number: u32,

    pub claim: ClaimPolicy,
}

impl Default for ModuleParams {
    fn default() -> Self {
        Self {
            irq_number: DEFAULT_IRQ_NUMBER,
            claim: ClaimPolicy::default(),
        }
    }
}

impl ModuleParams {
    /// Build parameters from `name=value` arguments over the defaults
    pub fn parse_args<I, S>(args: I) -> Result<Self, ParamError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut params = Self::default();
        for arg in args {
            params.set(arg.as_ref())?;
        }
        Ok(params)
    }

    /// Apply one `name=value` argument
    pub fn set(&mut self, arg: &str) -> Result<(), ParamError> {
        let (name, value) = arg
            .split_once('=')
            .ok_or_else(|| ParamError::Malformed(arg.to_string()))?;

        match name.trim() {
            "irq_number" => {
                self.irq_number = parse_u32(value).ok_or_else(|| ParamError::InvalidValue {
                    name: "irq_number".to_string(),
                    value: value.to_string(),
                })?;
            }
            "claim" => self.claim = value.parse()?,
            other => return Err(ParamError::Unknown(other.to_string())),
        }
        Ok(())
    }
}

/// Decimal, or hex with a `0x` prefix
fn parse_u32(value: &str) -> Option<u32> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}
