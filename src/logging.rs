//! Tracing setup and the host log callback

use parking_lot::RwLock;
use std::fmt::Write;
use std::sync::{Arc, OnceLock};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Receives one formatted line per log event.
pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;

type CallbackSlot = Arc<RwLock<Option<LogCallback>>>;

static CALLBACK: OnceLock<CallbackSlot> = OnceLock::new();

fn global_slot() -> &'static CallbackSlot {
    CALLBACK.get_or_init(|| Arc::new(RwLock::new(None)))
}

/// Install (or with `None`, remove) the process-wide log callback.
///
/// Installing one also runs [`init_logging`], so the host gets lines even if
/// it never set up logging itself.
pub fn set_log_callback(callback: Option<LogCallback>) {
    let installing = callback.is_some();
    *global_slot().write() = callback;
    if installing {
        init_logging();
    }
}

/// Layer that formats events as `[LEVEL] message k=v` and hands them to
/// the installed callback.
pub struct CallbackLayer {
    slot: CallbackSlot,
}

impl CallbackLayer {
    /// Layer bound to the callback set by [`set_log_callback`].
    pub fn global() -> Self {
        Self {
            slot: global_slot().clone(),
        }
    }

    fn with_slot(slot: CallbackSlot) -> Self {
        Self { slot }
    }
}

impl<S> Layer<S> for CallbackLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(callback) = self.slot.read().clone() else {
            return;
        };

        let mut message = format!("[{}] ", event.metadata().level());
        event.record(&mut MessageVisitor {
            message: &mut message,
        });
        callback(&message);
    }
}

struct MessageVisitor<'a> {
    message: &'a mut String,
}

impl Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            write!(self.message, "{:?}", value).ok();
        } else {
            write!(self.message, " {}={:?}", field.name(), value).ok();
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            write!(self.message, " {}={}", field.name(), value).ok();
        }
    }
}

/// Initialize logging (safe to call more than once)
pub fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ech_proxy=info,rustls=warn,reqwest=warn"));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(CallbackLayer::global());

    #[cfg(target_os = "android")]
    {
        match tracing_android::layer("EchProxy") {
            Ok(android) => {
                let _ = registry.with(android).try_init();
            }
            Err(_) => {
                let _ = registry.with(fmt::layer().with_ansi(false)).try_init();
            }
        }
    }

    #[cfg(not(target_os = "android"))]
    {
        let _ = registry.with(fmt::layer().with_ansi(false)).try_init();
    }
}
