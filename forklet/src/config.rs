//! Pool configuration.

/// Environment variable overriding the default concurrency ceiling.
pub const MAX_PROCESSES_ENV: &str = "FORKLET_MAX_PROCESSES";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum concurrently live child processes. Zero or negative means unbounded.
    pub ceiling: isize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            ceiling: parse_ceiling(std::env::var(MAX_PROCESSES_ENV).ok().as_deref())
                .unwrap_or_else(available_parallelism),
        }
    }
}

impl PoolConfig {
    pub fn with_ceiling(mut self, ceiling: isize) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn unbounded() -> Self {
        Self { ceiling: 0 }
    }

    pub fn is_unbounded(&self) -> bool {
        self.ceiling <= 0
    }
}

fn parse_ceiling(raw: Option<&str>) -> Option<isize> {
    let raw = raw?.trim();
    match raw.parse::<isize>() {
        Ok(ceiling) => Some(ceiling),
        Err(e) => {
            tracing::warn!(
                env = MAX_PROCESSES_ENV,
                value = raw,
                error = %e,
                "Ignoring unparseable ceiling"
            );
            None
        }
    }
}

/// Number of available processing units, or 1 when it cannot be determined.
pub fn available_parallelism() -> isize {
    std::thread::available_parallelism()
        .map(|n| n.get() as isize)
        .unwrap_or(1)
}
