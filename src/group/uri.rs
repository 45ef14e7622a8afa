//! URI selection with failover
//!
//! A download may list several URIs for the same content. Transfer tasks
//! take URIs round-robin; a URI that keeps failing is retired.

use tracing::warn;

/// Failures before a URI is retired
const DEFAULT_MAX_FAILURES: u32 = 3;

/// Round-robin URI selector
#[derive(Debug, Clone)]
pub struct UriSelector {
    uris: Vec<String>,
    failures: Vec<u32>,
    next: usize,
    max_failures: u32,
}

impl UriSelector {
    pub fn new(uris: Vec<String>) -> Self {
        let failures = vec![0; uris.len()];
        Self {
            uris,
            failures,
            next: 0,
            max_failures: DEFAULT_MAX_FAILURES,
        }
    }

    pub fn with_max_failures(mut self, max: u32) -> Self {
        self.max_failures = max.max(1);
        self
    }

    fn is_alive(&self, idx: usize) -> bool {
        self.failures[idx] < self.max_failures
    }

    /// Next usable URI, or `None` if all have been retired
    pub fn select(&mut self) -> Option<String> {
        let len = self.uris.len();
        for offset in 0..len {
            let idx = (self.next + offset) % len;
            if self.is_alive(idx) {
                self.next = (idx + 1) % len;
                return Some(self.uris[idx].clone());
            }
        }
        None
    }

    /// Record a failure of `uri`
    pub fn report_failure(&mut self, uri: &str) {
        if let Some(idx) = self.uris.iter().position(|u| u == uri) {
            self.failures[idx] += 1;
            if self.failures[idx] == self.max_failures {
                warn!(
                    "URI {} retired after {} failures",
                    uri, self.max_failures
                );
            }
        }
    }

    /// Reset the failure count of `uri` after a successful transfer
    pub fn report_success(&mut self, uri: &str) {
        if let Some(idx) = self.uris.iter().position(|u| u == uri) {
            self.failures[idx] = 0;
        }
    }

    pub fn has_available(&self) -> bool {
        (0..self.uris.len()).any(|i| self.is_alive(i))
    }

    pub fn uris(&self) -> &[String] {
        &self.uris
    }

    pub fn is_empty(&self) -> bool {
        self.uris.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin() {
        let mut sel = UriSelector::new(vec!["a".into(), "b".into()]);
        assert_eq!(sel.select().as_deref(), Some("a"));
        assert_eq!(sel.select().as_deref(), Some("b"));
        assert_eq!(sel.select().as_deref(), Some("a"));
    }

    #[test]
    fn test_failed_uri_is_skipped() {
        let mut sel = UriSelector::new(vec!["a".into(), "b".into()]).with_max_failures(1);
        sel.report_failure("a");
        assert_eq!(sel.select().as_deref(), Some("b"));
        assert_eq!(sel.select().as_deref(), Some("b"));
        sel.report_failure("b");
        assert!(!sel.has_available());
        assert_eq!(sel.select(), None);
    }

    #[test]
    fn test_empty_selector() {
        let mut sel = UriSelector::new(Vec::new());
        assert!(sel.is_empty());
        assert_eq!(sel.select(), None);
    }
}
