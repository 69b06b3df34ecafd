//! Bounded polling

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout_at, Instant};

use crate::error::{Error, Result};

/// Poll cadence and overall bound
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Call `probe` until it yields a value.
///
/// `Ok(None)` means "not yet". A probe error aborts the wait. An in-flight
/// probe is cancelled at the deadline instead of being allowed to finish.
pub async fn poll_until<T, F, Fut>(settings: PollSettings, what: &str, mut probe: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + settings.timeout;

    loop {
        match timeout_at(deadline, probe()).await {
            Ok(Ok(Some(value))) => return Ok(value),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => break,
        }

        if Instant::now() + settings.interval >= deadline {
            break;
        }
        sleep(settings.interval).await;
    }

    Err(Error::timeout(format!(
        "{} did not complete within {:?}",
        what, settings.timeout
    )))
}
