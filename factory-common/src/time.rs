use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

pub trait TimeSource {
    fn current_time(&self) -> DateTime<Utc>;
}

#[derive(Clone)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn current_time(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Clones share the same instant.
#[derive(Clone, Debug)]
pub struct FixedTime {
    time: Arc<RwLock<DateTime<Utc>>>,
}

impl FixedTime {
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time: Arc::new(RwLock::new(time)),
        }
    }

    pub fn set(&self, time: DateTime<Utc>) {
        let mut guard = match self.time.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = time;
    }

    pub fn advance(&self, by: Duration) {
        self.set(self.current_time() + by);
    }
}

impl TimeSource for FixedTime {
    fn current_time(&self) -> DateTime<Utc> {
        match self.time.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
