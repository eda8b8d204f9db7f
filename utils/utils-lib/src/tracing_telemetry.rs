use tracing_subscriber::{
    filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry,
};

/// Fmt Layer for console output.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FmtLayer {
    /// Output traces to stdout.
    Stdout,
    /// Output traces to stderr.
    Stderr,
    /// Output traces through the libtest capturing writer.
    Test,
    /// Don't output traces to console.
    None,
}

/// Tracing telemetry style.
#[derive(Debug, Clone, Copy, strum_macros::EnumString, strum_macros::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum FmtStyle {
    /// Compact style.
    Compact,
    /// Pretty Style.
    Pretty,
    /// JSON Style.
    Json,
}

/// Get the `RUST_LOG` env filter, falling back to the given directive.
pub fn rust_log_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Tracing telemetry builder.
pub struct TracingTelemetry {
    writer: FmtLayer,
    style: FmtStyle,
    colours: bool,
    filter: String,
}

impl TracingTelemetry {
    /// Tracing telemetry default builder.
    pub fn builder() -> Self {
        Self {
            writer: FmtLayer::Stdout,
            style: FmtStyle::Pretty,
            colours: true,
            filter: crate::DEFAULT_LOG_FILTER.to_string(),
        }
    }
    /// Specify writer stream.
    pub fn with_writer(self, writer: FmtLayer) -> TracingTelemetry {
        TracingTelemetry { writer, ..self }
    }
    /// Specify style.
    pub fn with_style(self, style: FmtStyle) -> TracingTelemetry {
        TracingTelemetry { style, ..self }
    }
    /// Specify whether colour is needed or not.
    pub fn with_colours(self, colours: bool) -> TracingTelemetry {
        TracingTelemetry { colours, ..self }
    }
    /// Specify the filter directive used when `RUST_LOG` is not set.
    pub fn with_default_filter(self, filter: &str) -> TracingTelemetry {
        TracingTelemetry {
            filter: filter.to_string(),
            ..self
        }
    }

    fn fmt_layer<S>(&self) -> Option<Box<dyn Layer<S> + Send + Sync + 'static>>
    where
        S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        let layer = tracing_subscriber::fmt::layer().with_ansi(self.colours);
        let layer: Box<dyn Layer<S> + Send + Sync> = match (self.writer, self.style) {
            (FmtLayer::None, _) => return None,
            (FmtLayer::Stdout, FmtStyle::Compact) => {
                layer.with_writer(std::io::stdout).compact().boxed()
            }
            (FmtLayer::Stdout, FmtStyle::Pretty) => {
                layer.with_writer(std::io::stdout).pretty().boxed()
            }
            (FmtLayer::Stdout, FmtStyle::Json) => layer.with_writer(std::io::stdout).json().boxed(),
            (FmtLayer::Stderr, FmtStyle::Compact) => {
                layer.with_writer(std::io::stderr).compact().boxed()
            }
            (FmtLayer::Stderr, FmtStyle::Pretty) => {
                layer.with_writer(std::io::stderr).pretty().boxed()
            }
            (FmtLayer::Stderr, FmtStyle::Json) => layer.with_writer(std::io::stderr).json().boxed(),
            (FmtLayer::Test, _) => layer.with_test_writer().compact().boxed(),
        };
        Some(layer)
    }

    /// Initialize the telemetry instance.
    /// Returns false if a global subscriber had already been installed.
    pub fn init(self, service_name: &str) -> bool {
        let subscriber = Registry::default()
            .with(rust_log_filter(&self.filter))
            .with(self.fmt_layer());
        let installed = subscriber.try_init().is_ok();
        if installed {
            tracing::debug!(service = service_name, "Tracing initialised");
        }
        installed
    }
}
