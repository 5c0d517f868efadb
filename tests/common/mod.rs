#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stepwise::{sync_unit, unit_fn, StepError, UnitOfWork, UnitOutput, Usage};

pub fn counter() -> Arc<AtomicU32> {
    Arc::new(AtomicU32::new(0))
}

pub fn count(counter: &Arc<AtomicU32>) -> u32 {
    counter.load(Ordering::SeqCst)
}

/// Returns its input wrapped under the unit's name.
pub fn echo(name: &str) -> Arc<dyn UnitOfWork> {
    let key = name.to_string();
    sync_unit(name, move |input| {
        let mut wrapped = serde_json::Map::new();
        wrapped.insert(key.clone(), input);
        Ok(Value::Object(wrapped))
    })
}

/// Returns a fixed value.
pub fn constant(name: &str, value: Value) -> Arc<dyn UnitOfWork> {
    sync_unit(name, move |_| Ok(value.clone()))
}

/// Always fails with a retryable error of kind `unavailable`.
pub fn failing(name: &str) -> Arc<dyn UnitOfWork> {
    let label = name.to_string();
    sync_unit(name, move |_| {
        Err(StepError::unit("unavailable", format!("{} is down", label)))
    })
}

/// Fails `failures` times, then returns `{"ok": true}`. `calls` counts every
/// invocation.
pub fn flaky(name: &str, failures: u32, calls: Arc<AtomicU32>) -> Arc<dyn UnitOfWork> {
    sync_unit(name, move |_| {
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= failures {
            Err(StepError::unit("unavailable", format!("attempt {} failed", call)))
        } else {
            Ok(json!({ "ok": true, "call": call }))
        }
    })
}

/// Sleeps for `delay` before answering, counting invocations.
pub fn slow(name: &str, delay: Duration, calls: Arc<AtomicU32>) -> Arc<dyn UnitOfWork> {
    let label = name.to_string();
    unit_fn(name, move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        let label = label.clone();
        async move {
            tokio::time::sleep(delay).await;
            Ok(UnitOutput::new(json!({ "done": label })))
        }
    })
}

/// Succeeds and reports the given cost.
pub fn priced(name: &str, cost: f64) -> Arc<dyn UnitOfWork> {
    unit_fn(name, move |input| async move {
        Ok(UnitOutput::new(input).with_usage(Usage::new(10, 5, cost)))
    })
}
