use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Window {
    count: u32,
    resets_at: Instant,
}

/// Outcome of a quota check for one caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub remaining: u32,
}

/// Fixed-window counter per client address, held in process memory only.
/// A restart forgets every window.
#[derive(Clone)]
pub struct AnonymousLimiter {
    windows: Arc<Mutex<HashMap<String, Window>>>,
    limit: u32,
    window: Duration,
}

impl AnonymousLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            limit,
            window,
        }
    }

    pub fn hourly(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60 * 60))
    }

    pub async fn check(&self, client: &str) -> Admission {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        match windows.get_mut(client) {
            Some(window) if now <= window.resets_at => {
                if window.count >= self.limit {
                    return Admission {
                        allowed: false,
                        remaining: 0,
                    };
                }
                window.count += 1;
                Admission {
                    allowed: true,
                    remaining: self.limit - window.count,
                }
            }
            _ => {
                if self.limit == 0 {
                    return Admission {
                        allowed: false,
                        remaining: 0,
                    };
                }
                windows.insert(
                    client.to_string(),
                    Window {
                        count: 1,
                        resets_at: now + self.window,
                    },
                );
                Admission {
                    allowed: true,
                    remaining: self.limit - 1,
                }
            }
        }
    }

    pub async fn purge_expired(&self) {
        let now = Instant::now();
        self.windows.lock().await.retain(|_, w| now <= w.resets_at);
    }
}

/// First `x-forwarded-for` entry, then `x-real-ip`, then `"unknown"`.
pub fn client_ip(headers: &HeaderMap) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("unknown")
        .to_string()
}
