use super::ratelimit::should_emit;
use std::collections::BTreeMap;
use tracing::{Level, debug, error, info, trace, warn};

/// Context information for log messages
#[derive(Debug, Clone)]
pub struct LogContext {
    /// Component name (e.g., "link", "bridge", "dbus")
    pub component: String,
    /// Bus device instance of the service being logged about
    pub device_instance: Option<u32>,
    /// Additional context fields, kept sorted for stable output
    pub extra_fields: BTreeMap<String, String>,
}

impl LogContext {
    /// Create a new log context
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            device_instance: None,
            extra_fields: BTreeMap::new(),
        }
    }

    /// Set device instance
    pub const fn with_device_instance(mut self, device_instance: u32) -> Self {
        self.device_instance = Some(device_instance);
        self
    }

    /// Add extra field
    pub fn with_field(mut self, key: &str, value: String) -> Self {
        self.extra_fields.insert(key.to_string(), value);
        self
    }
}

/// Structured logger with context and duplicate suppression
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    pub(crate) context: LogContext,
}

impl StructuredLogger {
    /// Create a new structured logger with context
    pub const fn new(context: LogContext) -> Self {
        Self { context }
    }

    pub fn info(&self, message: &str) {
        if self.admit(Level::INFO, message) {
            let fields = self.format_fields();
            info!(%fields, "{}", message);
        }
    }

    pub fn warn(&self, message: &str) {
        if self.admit(Level::WARN, message) {
            let fields = self.format_fields();
            warn!(%fields, "{}", message);
        }
    }

    pub fn error(&self, message: &str) {
        if self.admit(Level::ERROR, message) {
            let fields = self.format_fields();
            error!(%fields, "{}", message);
        }
    }

    pub fn debug(&self, message: &str) {
        if self.admit(Level::DEBUG, message) {
            let fields = self.format_fields();
            debug!(%fields, "{}", message);
        }
    }

    pub fn trace(&self, message: &str) {
        let fields = self.format_fields();
        trace!(%fields, "{}", message);
    }

    fn admit(&self, level: Level, message: &str) -> bool {
        should_emit(&self.context.component, level, message)
    }

    fn format_fields(&self) -> String {
        let mut fields = vec![format!("component={}", self.context.component)];
        if let Some(device_instance) = self.context.device_instance {
            fields.push(format!("device_instance={}", device_instance));
        }
        for (key, value) in &self.context.extra_fields {
            fields.push(format!("{}={}", key, value));
        }
        fields.join(",")
    }
}

/// Create a logger for a specific component
pub fn get_logger(component: &str) -> StructuredLogger {
    StructuredLogger::new(LogContext::new(component))
}

/// Create a logger with full context
pub const fn get_logger_with_context(context: LogContext) -> StructuredLogger {
    StructuredLogger::new(context)
}
