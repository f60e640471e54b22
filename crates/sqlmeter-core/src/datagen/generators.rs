use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use rand::Rng;

use super::value::{Value, ValueKind};
use super::{RawGenerator, RunCount};

/// Produces a uniformly-distributed integer in `[min, max]` on every call.
pub struct RandomIntGenerator {
    pub min: i64,
    pub max: i64,
}

impl RawGenerator for RandomIntGenerator {
    fn raw_values(&self, _run_count: &RunCount) -> Vec<Value> {
        let v = if self.min >= self.max {
            self.min
        } else {
            rand::thread_rng().gen_range(self.min..=self.max)
        };
        vec![Value::Int(v)]
    }

    fn kind(&self) -> ValueKind {
        ValueKind::Int
    }
}

/// Produces a monotonically increasing integer, starting at `start` and
/// incrementing by `step` each time it is rolled.
pub struct SequentialIntGenerator {
    pub start: i64,
    pub step: i64,
    counter: AtomicI64,
}

impl SequentialIntGenerator {
    pub fn new(start: i64, step: i64) -> Self {
        Self {
            start,
            step,
            counter: AtomicI64::new(start),
        }
    }
}

impl RawGenerator for SequentialIntGenerator {
    fn raw_values(&self, _run_count: &RunCount) -> Vec<Value> {
        let v = self.counter.fetch_add(self.step, Ordering::Relaxed);
        vec![Value::Int(v)]
    }

    fn kind(&self) -> ValueKind {
        ValueKind::Int
    }
}

/// Always produces the same fixed value.
pub struct ConstantGenerator {
    pub value: Value,
}

impl RawGenerator for ConstantGenerator {
    fn raw_values(&self, _run_count: &RunCount) -> Vec<Value> {
        vec![self.value.clone()]
    }

    fn kind(&self) -> ValueKind {
        match self.value {
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Str(_) => ValueKind::Str,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Null => ValueKind::Str,
        }
    }
}

/// A generator fed by `save-result`/`save-insert-id` modifiers (spec.md
/// §4.1). It holds no independent production logic — its "raw" value is
/// whatever was last scanned in, or `Value::Null` before any scan.
pub struct ColumnGenerator {
    last: Mutex<Value>,
    kind: ValueKind,
}

impl ColumnGenerator {
    pub fn new(kind: ValueKind) -> Self {
        Self {
            last: Mutex::new(Value::Null),
            kind,
        }
    }

    pub fn set(&self, value: Value) {
        *self.last.lock().expect("column generator mutex poisoned") = value;
    }
}

impl RawGenerator for ColumnGenerator {
    fn raw_values(&self, _run_count: &RunCount) -> Vec<Value> {
        vec![self.last.lock().expect("column generator mutex poisoned").clone()]
    }

    fn kind(&self) -> ValueKind {
        self.kind
    }
}
