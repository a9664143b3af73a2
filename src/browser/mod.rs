pub mod download;
pub mod error;
pub mod session;
pub mod webdriver;

pub use download::{DownloadArtifact, DownloadCollector};
pub use error::BrowserError;
pub use session::{
    BrowserSession, DownloadEvent, DownloadFeed, ENTER_KEY, InFlightDownloads, OpenedSession, SessionFactory,
};
pub use webdriver::{WebDriverFactory, WebDriverSession};
