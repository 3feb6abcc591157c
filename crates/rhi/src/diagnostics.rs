//! Validation-layer diagnostics routing.
//!
//! Messages from the Vulkan debug messenger are handed to a [`DiagnosticsSink`]
//! chosen when the [`Instance`](crate::instance::Instance) is created. The sink
//! travels through the messenger's user-data pointer, so there is no global
//! logger state.

use std::fmt;
use std::sync::Mutex;

use ash::vk;
use tracing::{debug, error, info, warn};

/// Severity of a diagnostic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Verbose,
    Info,
    Warning,
    Error,
}

impl Severity {
    /// Maps the most severe bit of `flags`.
    pub fn from_vk(flags: vk::DebugUtilsMessageSeverityFlagsEXT) -> Self {
        if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
            Severity::Error
        } else if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
            Severity::Warning
        } else if flags.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
            Severity::Info
        } else {
            Severity::Verbose
        }
    }
}

/// Category of a diagnostic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    General,
    Validation,
    Performance,
    Other,
}

impl MessageKind {
    pub fn from_vk(flags: vk::DebugUtilsMessageTypeFlagsEXT) -> Self {
        if flags.contains(vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION) {
            MessageKind::Validation
        } else if flags.contains(vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE) {
            MessageKind::Performance
        } else if flags.contains(vk::DebugUtilsMessageTypeFlagsEXT::GENERAL) {
            MessageKind::General
        } else {
            MessageKind::Other
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::General => "General",
            MessageKind::Validation => "Validation",
            MessageKind::Performance => "Performance",
            MessageKind::Other => "Unknown",
        };
        f.write_str(name)
    }
}

/// A single message from the validation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticMessage {
    pub severity: Severity,
    pub kind: MessageKind,
    pub text: String,
}

/// Receives validation-layer messages.
///
/// Called from the driver's thread; implementations must not panic.
pub trait DiagnosticsSink: Send + Sync {
    fn report(&self, message: DiagnosticMessage);
}

/// Forwards messages to `tracing` at the matching level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn report(&self, message: DiagnosticMessage) {
        let DiagnosticMessage {
            severity,
            kind,
            text,
        } = message;
        match severity {
            Severity::Error => error!("[Vulkan {}] {}", kind, text),
            Severity::Warning => warn!("[Vulkan {}] {}", kind, text),
            Severity::Info => info!("[Vulkan {}] {}", kind, text),
            Severity::Verbose => debug!("[Vulkan {} Verbose] {}", kind, text),
        }
    }
}

/// Stores every message for later inspection.
#[derive(Debug, Default)]
pub struct CollectingSink {
    messages: Mutex<Vec<DiagnosticMessage>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns the collected messages.
    pub fn drain(&self) -> Vec<DiagnosticMessage> {
        match self.messages.lock() {
            Ok(mut messages) => std::mem::take(&mut *messages),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    /// Number of messages at or above `severity`.
    pub fn count_at_least(&self, severity: Severity) -> usize {
        match self.messages.lock() {
            Ok(messages) => messages.iter().filter(|m| m.severity >= severity).count(),
            Err(_) => 0,
        }
    }
}

impl DiagnosticsSink for CollectingSink {
    fn report(&self, message: DiagnosticMessage) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message);
        }
    }
}
