//! Time and identifier sources

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use snowflaked::sync::Generator;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> i64;
}

/// Snowflake ids, unique across nodes as long as each node has its own instance number
pub struct SnowflakeIds {
    generator: Generator,
}

impl SnowflakeIds {
    pub fn new(instance: u16) -> Self {
        Self {
            generator: Generator::new(instance),
        }
    }
}

impl IdGenerator for SnowflakeIds {
    fn next_id(&self) -> i64 {
        self.generator.generate()
    }
}

/// Human-readable borrow number, e.g. `BR20250301-7301234567890`
pub fn borrow_number(now: DateTime<Utc>, id: i64) -> String {
    format!("BR{}-{}", now.format("%Y%m%d"), id)
}
