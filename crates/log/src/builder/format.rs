//! Formatting layers for each [`Format`](crate::Format).

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{Layer, Registry};

use crate::config::{DisplayConfig, Format};

pub(super) type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Builds the output layer for `format`.
pub(super) fn layer(format: Format, display: &DisplayConfig, writer: BoxMakeWriter) -> BoxedLayer {
    let base = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(display.colors && format != Format::Json)
        .with_target(display.target)
        .with_file(display.source)
        .with_line_number(display.source)
        .with_thread_ids(display.thread_ids);

    match format {
        Format::Pretty => base.pretty().boxed(),
        Format::Compact => base.compact().boxed(),
        Format::Json => base
            .json()
            .with_current_span(true)
            .with_span_list(display.span_list)
            .flatten_event(display.flatten)
            .boxed(),
    }
}
