//! Duplicate message detection.
//!
//! Keeps a bounded, time-windowed cache of recently seen normalized content
//! per role. Content identical to a recent same-role entry is reported as a
//! duplicate so the interaction runtime can suppress re-delivery.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use valet_core::Role;

const MIN_CONTENT_LENGTH: usize = 3;

#[derive(Debug, Clone)]
struct Fingerprint {
    role: Role,
    normalized: String,
    seen_at: Instant,
}

pub struct DuplicateDetector {
    cache_size: usize,
    window: Duration,
    cache: VecDeque<Fingerprint>,
}

impl DuplicateDetector {
    pub fn new(cache_size: usize, window: Duration) -> Self {
        Self {
            cache_size,
            window,
            cache: VecDeque::with_capacity(cache_size),
        }
    }

    /// Collapse whitespace and lowercase for robust comparison.
    fn normalize(content: &str) -> String {
        content
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    fn evict_expired(&mut self) {
        let now = Instant::now();
        while let Some(front) = self.cache.front() {
            if now.duration_since(front.seen_at) > self.window {
                self.cache.pop_front();
            } else {
                break;
            }
        }
        while self.cache.len() > self.cache_size {
            self.cache.pop_front();
        }
    }

    pub fn is_duplicate(&mut self, role: Role, content: &str) -> bool {
        let trimmed = content.trim();
        if trimmed.len() < MIN_CONTENT_LENGTH {
            return false;
        }
        self.evict_expired();

        let normalized = Self::normalize(trimmed);
        let hit = self
            .cache
            .iter()
            .any(|fp| fp.role == role && fp.normalized == normalized);
        if hit {
            warn!(
                %role,
                content_preview = &trimmed[..trimmed.len().min(100)],
                "Duplicate message detected"
            );
        }
        hit
    }

    pub fn mark_seen(&mut self, role: Role, content: &str) {
        let trimmed = content.trim();
        if trimmed.len() < MIN_CONTENT_LENGTH {
            return;
        }
        let normalized = Self::normalize(trimmed);
        self.cache.push_back(Fingerprint {
            role,
            normalized,
            seen_at: Instant::now(),
        });
        self.evict_expired();
        debug!(%role, cache_size = self.cache.len(), "Message marked as seen");
    }

    /// Check for a duplicate and, if new, remember the message.
    pub fn check_and_mark(&mut self, role: Role, content: &str) -> bool {
        let dup = self.is_duplicate(role, content);
        if !dup {
            self.mark_seen(role, content);
        }
        dup
    }

    pub fn reset(&mut self) {
        self.cache.clear();
    }
}
