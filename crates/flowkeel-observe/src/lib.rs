//! Observability setup for flowkeel: structured logging and optional
//! OpenTelemetry span export.

pub mod tracing_setup;
