//! A narrow logging surface.
//!
//! The actual logger (rendering, destinations, rotation) is an external collaborator, but the
//! core still needs to emit structured records. Rather than take a hard dependency on any one
//! logging runtime's macros scattered through the state machines, call sites go through this
//! single trait; the default implementation just forwards to `tracing`.

/// A single structured field, passed by reference to avoid allocating at the call site.
#[derive(Clone, Copy, Debug)]
pub enum Value<'a> {
    Str(&'a str),
    U64(u64),
    I64(i64),
    Bool(bool),
}

impl std::fmt::Display for Value<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s}"),
            Value::U64(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// One field: a static key and a borrowed value.
pub type Field<'a> = (&'static str, Value<'a>);

/// Structured logging at the four levels the engine distinguishes.
///
/// Implementations must be cheap enough to call unconditionally from hot paths (admission,
/// replication fan-out); the default `TracingLog` implementation defers the actual cost to
/// `tracing`'s own level filtering.
pub trait Log: Send + Sync {
    fn debug(&self, message: &str, fields: &[Field<'_>]);
    fn info(&self, message: &str, fields: &[Field<'_>]);
    fn warn(&self, message: &str, fields: &[Field<'_>]);
    fn error(&self, message: &str, fields: &[Field<'_>]);
}

/// Forwards to `tracing`'s global subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLog;

fn render(fields: &[Field<'_>]) -> String {
    let mut out = String::new();
    for (k, v) in fields {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(k);
        out.push('=');
        out.push_str(&v.to_string());
    }
    out
}

impl Log for TracingLog {
    fn debug(&self, message: &str, fields: &[Field<'_>]) {
        tracing::debug!(fields = %render(fields), "{message}");
    }

    fn info(&self, message: &str, fields: &[Field<'_>]) {
        tracing::info!(fields = %render(fields), "{message}");
    }

    fn warn(&self, message: &str, fields: &[Field<'_>]) {
        tracing::warn!(fields = %render(fields), "{message}");
    }

    fn error(&self, message: &str, fields: &[Field<'_>]) {
        tracing::error!(fields = %render(fields), "{message}");
    }
}
