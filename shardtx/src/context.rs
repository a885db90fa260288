//! Caller identity and deadlines passed to every entry point.

use std::fmt::Display;
use std::time::Duration;

use tokio::time::Instant;

/// Who is asking. Missing parts fall into the "unknown" bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Caller {
    pub username: Option<String>,
    pub host: Option<String>,
}

impl Caller {
    pub fn new(username: impl ToString, host: impl ToString) -> Self {
        Self {
            username: Some(username.to_string()),
            host: Some(host.to_string()),
        }
    }

    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or("unknown")
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("unknown")
    }
}

impl Display for Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.username(), self.host())
    }
}

/// Request context.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub caller: Caller,
    pub deadline: Option<Instant>,
}

impl Context {
    pub fn new(caller: Caller) -> Self {
        Self {
            caller,
            deadline: None,
        }
    }

    /// Same caller, with a deadline `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Same caller, with the given deadline. An earlier existing deadline wins.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };

        Self {
            caller: self.caller.clone(),
            deadline: Some(deadline),
        }
    }

    /// Deadline already passed.
    pub fn expired(&self) -> bool {
        self.deadline
            .map(|deadline| deadline <= Instant::now())
            .unwrap_or(false)
    }

    /// Earlier of the context deadline and `timeout` from now.
    pub fn deadline_or(&self, timeout: Duration) -> Instant {
        let fallback = Instant::now() + timeout;
        match self.deadline {
            Some(deadline) if deadline < fallback => deadline,
            _ => fallback,
        }
    }
}
