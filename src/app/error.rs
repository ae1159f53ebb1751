use serde::Serialize;
use std::fmt;

pub const ERR_VALIDATION: &str = "ERR_VALIDATION";
pub const ERR_CHANNEL: &str = "ERR_CHANNEL";
pub const ERR_PROTOCOL: &str = "ERR_PROTOCOL";
pub const ERR_FILESYSTEM: &str = "ERR_FILESYSTEM";
pub const ERR_CONFIG: &str = "ERR_CONFIG";
pub const ERR_SYSTEM: &str = "ERR_SYSTEM";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AppError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
        }
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_VALIDATION, message, trace_id)
    }

    /// The device could not be reached or the shell invocation itself failed.
    /// Callers must treat the remote state as unknown.
    pub fn channel(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_CHANNEL, message, trace_id)
    }

    /// The device answered, but not in the shape we expected.
    pub fn protocol(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_PROTOCOL, message, trace_id)
    }

    pub fn filesystem(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_FILESYSTEM, message, trace_id)
    }

    pub fn config(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_CONFIG, message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ERR_SYSTEM, message, trace_id)
    }

    pub fn is_channel(&self) -> bool {
        self.code == ERR_CHANNEL
    }

    pub fn is_protocol(&self) -> bool {
        self.code == ERR_PROTOCOL
    }

    pub fn is_filesystem(&self) -> bool {
        self.code == ERR_FILESYSTEM
    }

    pub fn is_config(&self) -> bool {
        self.code == ERR_CONFIG
    }

    /// Re-tags an error raised by a lower layer with the caller's trace id.
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl std::error::Error for AppError {}
