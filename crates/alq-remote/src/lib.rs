//! Production HTTP clients for the queue's external collaborators.
//!
//! Deliberately thin: each client speaks the minimal slice of its service's
//! HTTP API that the core contracts need, maps failures onto
//! [`alq_queue::ClientError`], and leaves every policy decision to the core.

mod bus;
mod bugzilla;
mod oracle;

pub use bugzilla::BugzillaTracker;
pub use bus::HttpBus;
pub use oracle::HttpOracle;

use alq_queue::ClientError;

pub(crate) fn transport(e: reqwest::Error) -> ClientError {
    ClientError::Transport(e.to_string())
}

pub(crate) async fn expect_success(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(ClientError::Api(format!("{status}: {body}")))
    }
}
