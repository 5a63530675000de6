//! Diagnostic channels
//!
//! Each planning pass can render its output on a named channel. Rendering
//! only happens when the channel is enabled and never influences the plan:
//! formatter errors are dropped.

use std::fmt;

use parking_lot::Mutex;

/// Term tree as received
pub const TERM: &str = "planning/term";
/// Row tree produced by term plan conversion
pub const ROW: &str = "planning/row";
/// Plan row catalog
pub const PLAN_ROWS: &str = "planning/planrows";
/// Row tree after rewriting
pub const REWRITE: &str = "planning/rewrite";
/// Compile tree
pub const COMPILE: &str = "planning/compile";
/// Register assignment
pub const REGISTERS: &str = "planning/registers";
/// Lowered program
pub const PROGRAM: &str = "planning/program";

/// Sink for diagnostic output
pub trait DiagnosticStream: Send + Sync {
    /// True if `channel` should be rendered
    fn is_enabled(&self, channel: &str) -> bool;

    /// Record rendered text for `channel`
    fn write(&self, channel: &str, text: &str);
}

/// Render through `render` if `channel` is enabled
pub fn emit<F>(stream: &dyn DiagnosticStream, channel: &str, render: F)
where
    F: FnOnce(&mut String) -> fmt::Result,
{
    if !stream.is_enabled(channel) {
        return;
    }
    let mut text = String::new();
    match render(&mut text) {
        Ok(()) => stream.write(channel, &text),
        Err(_) => tracing::trace!(channel, "diagnostic formatting failed"),
    }
}

fn channel_enabled(enabled: &[String], channel: &str) -> bool {
    enabled
        .iter()
        .any(|prefix| prefix == "*" || channel.starts_with(prefix.as_str()))
}

/// Stream with every channel disabled
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDiagnostics;

impl DiagnosticStream for NullDiagnostics {
    fn is_enabled(&self, _channel: &str) -> bool {
        false
    }

    fn write(&self, _channel: &str, _text: &str) {}
}

/// Stream that logs enabled channels at `debug` level
#[derive(Debug, Clone, Default)]
pub struct TracingDiagnostics {
    enabled: Vec<String>,
}

impl TracingDiagnostics {
    /// Enable channels by prefix; `"*"` enables all
    pub fn new(enabled: Vec<String>) -> Self {
        Self { enabled }
    }
}

impl DiagnosticStream for TracingDiagnostics {
    fn is_enabled(&self, channel: &str) -> bool {
        channel_enabled(&self.enabled, channel)
    }

    fn write(&self, channel: &str, text: &str) {
        tracing::debug!(target: "bitsift::diagnostics", channel, "\n{}", text);
    }
}

/// Stream that keeps everything it receives
#[derive(Debug, Default)]
pub struct BufferedDiagnostics {
    enabled: Vec<String>,
    entries: Mutex<Vec<(String, String)>>,
}

impl BufferedDiagnostics {
    /// Enable channels by prefix; `"*"` enables all
    pub fn new(enabled: Vec<String>) -> Self {
        Self {
            enabled,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Buffer every channel
    pub fn all() -> Self {
        Self::new(vec!["*".to_string()])
    }

    /// Text written to `channel`, in order
    pub fn channel(&self, channel: &str) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, text)| text.clone())
            .collect()
    }

    /// Drain all entries
    pub fn take(&self) -> Vec<(String, String)> {
        std::mem::take(&mut *self.entries.lock())
    }
}

impl DiagnosticStream for BufferedDiagnostics {
    fn is_enabled(&self, channel: &str) -> bool {
        channel_enabled(&self.enabled, channel)
    }

    fn write(&self, channel: &str, text: &str) {
        self.entries
            .lock()
            .push((channel.to_string(), text.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn test_prefix_matching() {
        let diagnostics = BufferedDiagnostics::new(vec!["planning/r".to_string()]);
        assert!(diagnostics.is_enabled(ROW));
        assert!(diagnostics.is_enabled(REWRITE));
        assert!(!diagnostics.is_enabled(COMPILE));
        assert!(BufferedDiagnostics::all().is_enabled(PROGRAM));
        assert!(!NullDiagnostics.is_enabled(TERM));
    }

    #[test]
    fn test_emit_skips_disabled_channel() {
        let diagnostics = BufferedDiagnostics::new(vec![ROW.to_string()]);
        let mut rendered = false;
        emit(&diagnostics, COMPILE, |out| {
            rendered = true;
            out.write_str("x")
        });
        assert!(!rendered);
        assert!(diagnostics.take().is_empty());
    }

    #[test]
    fn test_formatter_error_is_swallowed() {
        let diagnostics = BufferedDiagnostics::all();
        emit(&diagnostics, ROW, |out| {
            out.write_str("partial")?;
            Err(fmt::Error)
        });
        emit(&diagnostics, ROW, |out| out.write_str("complete"));
        assert_eq!(diagnostics.channel(ROW), vec!["complete".to_string()]);
    }
}
