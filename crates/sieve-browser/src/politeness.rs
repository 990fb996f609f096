use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Spaces out navigations to the same domain.
///
/// Callers wait for their turn instead of being rejected, so a burst of
/// subpage visits degrades into a steady crawl.
#[derive(Debug)]
pub struct PolitenessGate {
    last_access: Mutex<HashMap<String, Instant>>,
    min_delay: Duration,
}

impl PolitenessGate {
    #[must_use]
    pub fn new(min_delay: Duration) -> Self {
        Self {
            last_access: Mutex::new(HashMap::new()),
            min_delay,
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Sleep until `domain` may be contacted again, then claim the slot.
    pub async fn wait_turn(&self, domain: &str) {
        if self.min_delay.is_zero() {
            return;
        }

        let wait = {
            let mut last_access = self.last_access.lock().await;
            let now = Instant::now();
            let ready_at = last_access
                .get(domain)
                .map_or(now, |last| (*last + self.min_delay).max(now));
            last_access.insert(domain.to_string(), ready_at);
            ready_at - now
        };

        if !wait.is_zero() {
            tracing::debug!(domain, wait_ms = wait.as_millis() as u64, "politeness wait");
            tokio::time::sleep(wait).await;
        }
    }
}
