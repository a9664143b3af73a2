//! Supported carriers, portal credentials, and each carrier's portal profile.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::selector::{Locator, SelectorChain};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CarrierError {
    #[error("unsupported carrier: {0:?}")]
    Unsupported(String),

    #[error("credentials are missing a {0}")]
    MissingField(&'static str),
}

/// Carriers whose billing portal can be automated. Parsed case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Carrier {
    Ups,
}

impl FromStr for Carrier {
    type Err = CarrierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UPS" => Ok(Carrier::Ups),
            _ => Err(CarrierError::Unsupported(s.to_string())),
        }
    }
}

impl fmt::Display for Carrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Carrier::Ups => write!(f, "UPS"),
        }
    }
}

/// Portal login for one carrier account. Lives only as long as its job.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub carrier: Carrier,
}

impl Credentials {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        carrier: &str,
    ) -> Result<Self, CarrierError> {
        let username = username.into();
        let password = password.into();
        if username.trim().is_empty() {
            return Err(CarrierError::MissingField("username"));
        }
        if password.is_empty() {
            return Err(CarrierError::MissingField("password"));
        }
        Ok(Self {
            username,
            password,
            carrier: carrier.parse()?,
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("carrier", &self.carrier)
            .finish()
    }
}

/// Where a carrier's portal lives and how to find everything on it.
#[derive(Debug, Clone)]
pub struct PortalProfile {
    pub carrier: Carrier,
    pub login_url: String,
    pub username: SelectorChain,
    pub password: SelectorChain,
    /// Collapsed main navigation toggle; absent on wide layouts.
    pub nav_toggle: SelectorChain,
    pub invoices_link: SelectorChain,
    /// The first invoice row, clicked once before paging.
    pub first_item: SelectorChain,
    /// Dismisses the dialog that sometimes follows the first selection.
    pub modal_close: SelectorChain,
    pub next_page: SelectorChain,
    pub download_button: SelectorChain,
    /// Download format choice inside the download dialog.
    pub download_option: SelectorChain,
    pub confirm_download: SelectorChain,
    /// Matches every row checkbox on the current page.
    pub item_checkbox: Locator,
}

impl PortalProfile {
    pub fn for_carrier(carrier: Carrier) -> Self {
        match carrier {
            Carrier::Ups => ups(),
        }
    }
}

const UPS_LOGIN_URL: &str = "https://www.ups.com/lasso/signin?client_id=rPfJLIzYqDE&scope=openid\
&response_type=code&redirect_uri=https%3A%2F%2Fbilling.ups.com%2Flogin%2Fcallback&state=%2F";

fn ups() -> PortalProfile {
    PortalProfile {
        carrier: Carrier::Ups,
        login_url: UPS_LOGIN_URL.to_string(),
        username: SelectorChain::new(
            "login username field",
            "input[type='text']",
            &[
                "#email",
                "//input[@id='email']",
                "//input[@name='userID']",
                ".ups-form_input.ups-check.ups-active",
            ],
        ),
        password: SelectorChain::new(
            "login password field",
            "input[type='password']",
            &[
                "#pwd",
                "//input[@id='pwd']",
                "//input[@name='password']",
                ".ups-form_input.ups-has_showhide_icon",
            ],
        ),
        nav_toggle: SelectorChain::new(
            "main navigation toggle",
            "#main-nav-bar button",
            &["//*[@id='main-nav-bar']/button"],
        ),
        invoices_link: SelectorChain::new(
            "my invoices link",
            "#side-nav-link-my-invoices",
            &[
                "//a[@id='side-nav-link-my-invoices']",
                "a[href='/ups/billing/invoice']",
                ".side-nav-icon-invoice.fa-custom.fa-file-alt",
            ],
        ),
        first_item: SelectorChain::new(
            "first invoice row",
            "//*[@id='invoice-table_wrapper']/div[2]/div/table/tbody/tr[1]/td[2]",
            &["#invoice-table tbody tr:first-child td:nth-child(2)"],
        ),
        modal_close: SelectorChain::new(
            "modal close button",
            "//button[contains(text(), 'Close')]",
            &[".modal .btn-primary"],
        ),
        next_page: SelectorChain::new(
            "next page button",
            ".paginate_button.next:not(.disabled)",
            &[
                "//a[contains(@class, 'paginate_button') and contains(@class, 'next') and not(contains(@class, 'disabled'))]",
                "//a[contains(@aria-label, 'Next Page') and not(contains(@class, 'disabled'))]",
            ],
        ),
        download_button: SelectorChain::new(
            "download invoices button",
            ".btn-download-invoices",
            &["//button[contains(@class, 'btn-download-invoices')]"],
        ),
        download_option: SelectorChain::new(
            "csv download option",
            "#downloadOptionType_csv",
            &["//input[@value='csv']"],
        ),
        confirm_download: SelectorChain::new(
            "confirm download button",
            "#download-multiple-invoice-btn-download",
            &["//button[contains(text(), 'Download')]"],
        ),
        item_checkbox: Locator::parse("table tbody tr td input[type='checkbox']"),
    }
}
