//! Per-provider sliding-window rate limiting.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

const WINDOW: Duration = Duration::from_secs(60);

/// Trailing 60-second window over request and token counts.
///
/// Admission requires room in both budgets after pruning; refusal is
/// immediate and never waits or retries.
pub struct RateLimiter {
    requests_per_minute: u32,
    tokens_per_minute: u32,
    window: Mutex<Window>,
}

#[derive(Default)]
struct Window {
    requests: Vec<Instant>,
    tokens: Vec<(Instant, u32)>,
}

impl Window {
    fn prune(&mut self, now: Instant) {
        self.requests.retain(|t| now.duration_since(*t) < WINDOW);
        self.tokens.retain(|(t, _)| now.duration_since(*t) < WINDOW);
    }
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32, tokens_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            tokens_per_minute,
            window: Mutex::new(Window::default()),
        }
    }

    /// Whether a request estimated at `estimated_tokens` fits both
    /// budgets right now.
    pub async fn can_make_request(&self, estimated_tokens: u32) -> bool {
        let now = Instant::now();
        let mut window = self.window.lock().await;
        window.prune(now);

        let token_sum: u64 = window.tokens.iter().map(|(_, t)| *t as u64).sum();
        (window.requests.len() as u32) < self.requests_per_minute
            && token_sum + estimated_tokens as u64 <= self.tokens_per_minute as u64
    }

    /// Record an admitted request and its token cost.
    pub async fn record_request(&self, tokens_used: u32) {
        let now = Instant::now();
        let mut window = self.window.lock().await;
        window.requests.push(now);
        window.tokens.push((now, tokens_used));
    }

    /// Shift every recorded entry into the past to simulate window
    /// expiry without sleeping.
    #[cfg(test)]
    pub(crate) async fn backdate(&self, delta: Duration) {
        let mut window = self.window.lock().await;
        for t in &mut window.requests {
            *t = t.checked_sub(delta).unwrap_or(*t);
        }
        for (t, _) in &mut window.tokens {
            *t = t.checked_sub(delta).unwrap_or(*t);
        }
    }
}
