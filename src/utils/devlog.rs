//! Developer bench lines ("level 6") for reads, cache decisions, overflow and bulk flushes.
//!
//! A line is a bench name plus named fields. It is logged as one JSON object on the
//! `nexus_odm::dev6` target at TRACE. Tests can also capture the lines emitted on their
//! own thread and query fields directly, without racing the housekeeping thread or the
//! global logger.

use crate::utils::logger::DEV6_TARGET;
use serde_json::{Map, Value};
use std::cell::RefCell;

#[derive(Debug, Clone, PartialEq)]
pub struct BenchLine {
    pub bench: &'static str,
    fields: Map<String, Value>,
}

impl BenchLine {
    #[must_use]
    pub fn new(bench: &'static str) -> Self {
        Self { bench, fields: Map::new() }
    }

    #[must_use]
    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// `{"bench": .., <fields>}` on one line.
    #[must_use]
    pub fn to_json(&self) -> String {
        let mut obj = Map::with_capacity(self.fields.len() + 1);
        obj.insert("bench".into(), Value::from(self.bench));
        obj.extend(self.fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        Value::Object(obj).to_string()
    }
}

thread_local! {
    static CAPTURED: RefCell<Option<Vec<BenchLine>>> = const { RefCell::new(None) };
}

/// Stops capturing on drop.
pub struct CaptureGuard;

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        CAPTURED.with(|c| *c.borrow_mut() = None);
    }
}

/// Capture bench lines emitted on the current thread until the guard drops.
pub fn capture() -> CaptureGuard {
    CAPTURED.with(|c| *c.borrow_mut() = Some(Vec::new()));
    CaptureGuard
}

pub fn emit(line: BenchLine) {
    if log::log_enabled!(target: DEV6_TARGET, log::Level::Trace) {
        log::trace!(target: DEV6_TARGET, "{}", line.to_json());
    }
    CAPTURED.with(|c| {
        if let Some(lines) = c.borrow_mut().as_mut() {
            lines.push(line);
        }
    });
}

/// Everything captured so far on this thread; clears the buffer.
pub fn take() -> Vec<BenchLine> {
    CAPTURED.with(|c| c.borrow_mut().as_mut().map(std::mem::take).unwrap_or_default())
}

/// Captured lines of one bench, left in place.
pub fn captured(bench: &str) -> Vec<BenchLine> {
    CAPTURED.with(|c| {
        c.borrow().as_ref().map_or_else(Vec::new, |lines| lines.iter().filter(|l| l.bench == bench).cloned().collect())
    })
}

/// `dev6!("flush", type_name = name, operations = n)` emits one bench line.
#[macro_export]
macro_rules! dev6 {
    ($bench:literal $(, $name:ident = $value:expr)* $(,)?) => {
        $crate::utils::devlog::emit(
            $crate::utils::devlog::BenchLine::new($bench) $(.field(stringify!($name), $value))*
        )
    };
}
