//! Errors raised while talking to the browser-automation service.

use thiserror::Error;

/// Failures of a single browser command.
///
/// The resolver treats all of these as a failed attempt; the engine turns
/// the ones that escape a step into an automation failure for that phase.
#[derive(Debug, Error)]
pub enum BrowserError {
    /// The WebDriver endpoint answered with a W3C error object.
    #[error("webdriver error {status} ({error}): {message}")]
    Protocol {
        status: u16,
        error: String,
        message: String,
    },

    /// The locator matched nothing when an element was required.
    #[error("no element matches {0}")]
    NoSuchElement(String),

    /// `click_nth` asked for an element past the end of the match list.
    #[error("element #{index} requested but {locator} matched {count}")]
    IndexOutOfRange {
        locator: String,
        index: usize,
        count: usize,
    },

    /// The response was valid HTTP but not the shape WebDriver promises.
    #[error("malformed webdriver response: {0}")]
    MalformedResponse(String),

    #[error("browser session already closed")]
    SessionClosed,

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrowserError {
    /// Whether the failure is a protocol-level timeout rather than a
    /// missing element or a rejected command.
    pub fn is_timeout(&self) -> bool {
        match self {
            BrowserError::Network(err) => err.is_timeout(),
            BrowserError::Protocol { error, .. } => error == "timeout" || error == "script timeout",
            _ => false,
        }
    }
}
