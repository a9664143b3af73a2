//! Carrier portal automation: sign in, open the invoice listing, select
//! every invoice across the result pages and trigger a bulk download.

mod engine;
mod pacing;

pub use engine::{AutomationCause, AutomationError, AutomationRun, JobWorkspace, PortalAutomationEngine};
pub use pacing::Pacer;
