//! Ordered-fallback element locators and the resolver that walks them.
//!
//! Portal markup changes often, so every logical target ("username field",
//! "next page button") is described by a [`SelectorChain`]: the preferred
//! locator first, then progressively more degraded fallbacks. The
//! [`SelectorResolver`] tries each locator with a bounded retry budget
//! before moving on, so a target costs at most
//! `chain.len() * retries * timeout` of waiting.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::browser::{BrowserError, BrowserSession};
use crate::retry::{Backoff, RetryPolicy};

/// A single way of finding an element.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    Css(String),
    XPath(String),
}

impl Locator {
    /// Classify a raw locator string. Anything rooted at `/`, `(/` or `./`
    /// is XPath, everything else is a CSS selector.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.starts_with('/') || trimmed.starts_with("(/") || trimmed.starts_with("./") {
            Locator::XPath(trimmed.to_string())
        } else {
            Locator::Css(trimmed.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Locator::Css(s) | Locator::XPath(s) => s,
        }
    }

    /// The W3C WebDriver location strategy name.
    pub fn strategy(&self) -> &'static str {
        match self {
            Locator::Css(_) => "css selector",
            Locator::XPath(_) => "xpath",
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// Every locator in the chain ran out of attempts.
    #[error("no locator for {target} matched after trying {tried} locator(s)")]
    Exhausted { target: String, tried: usize },
}

/// Locators for one logical UI target, in priority order. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorChain {
    target: String,
    locators: Vec<Locator>,
}

impl SelectorChain {
    pub fn new(target: impl Into<String>, primary: &str, fallbacks: &[&str]) -> Self {
        let locators = std::iter::once(primary)
            .chain(fallbacks.iter().copied())
            .map(Locator::parse)
            .collect();
        Self {
            target: target.into(),
            locators,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn locators(&self) -> &[Locator] {
        &self.locators
    }

    pub fn primary(&self) -> &Locator {
        &self.locators[0]
    }

    pub fn len(&self) -> usize {
        self.locators.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// The locator that matched, and its position in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub index: usize,
    pub locator: Locator,
}

/// Per-locator wait and retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvePolicy {
    /// How long a single wait for the element may take.
    pub timeout: Duration,
    /// Attempts per locator, with a fixed delay between them.
    pub retry: RetryPolicy,
}

impl Default for ResolvePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            retry: RetryPolicy::new(3, Backoff::Fixed(Duration::from_secs(2))),
        }
    }
}

impl ResolvePolicy {
    /// Upper bound on time spent waiting for elements to resolve `chain`.
    pub fn max_wait(&self, chain: &SelectorChain) -> Duration {
        self.timeout
            .saturating_mul(self.retry.max_attempts)
            .saturating_mul(chain.len() as u32)
    }
}

/// Walks selector chains against a live session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectorResolver {
    policy: ResolvePolicy,
}

impl SelectorResolver {
    pub fn new(policy: ResolvePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ResolvePolicy {
        &self.policy
    }

    /// Find the first locator in the chain whose element appears.
    pub async fn resolve(
        &self,
        session: &dyn BrowserSession,
        chain: &SelectorChain,
    ) -> Result<Resolved, ResolveError> {
        let timeout = self.policy.timeout;
        self.walk(chain, |locator| session.wait_for(locator, timeout))
            .await
    }

    /// Resolve and click. A click that throws counts as a failed attempt on
    /// that locator and is retried like a timeout.
    pub async fn click(
        &self,
        session: &dyn BrowserSession,
        chain: &SelectorChain,
    ) -> Result<Resolved, ResolveError> {
        let timeout = self.policy.timeout;
        self.walk(chain, |locator| async move {
            if !session.wait_for(locator, timeout).await? {
                return Ok(false);
            }
            session.click(locator).await?;
            Ok::<bool, BrowserError>(true)
        })
        .await
    }

    async fn walk<'c, F, Fut>(&self, chain: &'c SelectorChain, mut attempt: F) -> Result<Resolved, ResolveError>
    where
        F: FnMut(&'c Locator) -> Fut,
        Fut: Future<Output = Result<bool, BrowserError>>,
    {
        let retry = self.policy.retry;
        for (index, locator) in chain.locators().iter().enumerate() {
            for n in 1..=retry.max_attempts {
                match attempt(locator).await {
                    Ok(true) => {
                        debug!(element = chain.target(), %locator, index, attempt = n, "locator matched");
                        return Ok(Resolved {
                            index,
                            locator: locator.clone(),
                        });
                    }
                    Ok(false) => {
                        debug!(element = chain.target(), %locator, attempt = n, "locator not found yet");
                    }
                    Err(err) => {
                        debug!(element = chain.target(), %locator, attempt = n, error = %err, "attempt failed");
                    }
                }
                if retry.allows_retry_after(n) {
                    sleep(retry.delay_for_attempt(n)).await;
                }
            }
            debug!(element = chain.target(), %locator, "locator exhausted, falling back");
        }

        warn!(element = chain.target(), tried = chain.len(), "selector chain exhausted");
        Err(ResolveError::Exhausted {
            target: chain.target().to_string(),
            tried: chain.len(),
        })
    }
}
