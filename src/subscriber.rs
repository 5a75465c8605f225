//! Expiration event subscriber
//!
//! Drains an [`ExpirySubscription`] into the backlog, one append per event, in
//! delivery order. Keys are never filtered or deduplicated here.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backlog::{BacklogError, BacklogStore};
use crate::store::{ExpirySubscription, StoreError};

/// Why the subscription loop stopped without a backlog error.
#[derive(Debug)]
pub enum SubscriberExit {
    /// The subscription ended (connection closed by the server).
    Closed { received: u64 },
    /// The subscription failed; no events are received after this.
    Failed { received: u64, error: StoreError },
}

/// Task running [`EventSubscriber::run`].
pub type SubscriberHandle = JoinHandle<Result<SubscriberExit, BacklogError>>;

pub struct EventSubscriber {
    backlog: Arc<BacklogStore>,
}

impl EventSubscriber {
    pub fn new(backlog: Arc<BacklogStore>) -> Self {
        EventSubscriber { backlog }
    }

    /// Record events until the subscription ends.
    ///
    /// A failed append is returned immediately: losing an acknowledged event
    /// silently is worse than stopping.
    pub async fn run(
        &self,
        mut subscription: Box<dyn ExpirySubscription>,
    ) -> Result<SubscriberExit, BacklogError> {
        let mut received: u64 = 0;
        loop {
            match subscription.next_expired().await {
                Ok(Some(key)) => {
                    self.backlog.append(&key)?;
                    received += 1;
                    debug!("Recorded expired key {}", key);
                }
                Ok(None) => {
                    info!("Expiration subscription closed after {} events", received);
                    return Ok(SubscriberExit::Closed { received });
                }
                Err(error) => {
                    warn!(
                        "Expiration subscription failed after {} events: {}",
                        received, error
                    );
                    return Ok(SubscriberExit::Failed { received, error });
                }
            }
        }
    }

    /// Run the loop on its own task.
    pub fn spawn(self, subscription: Box<dyn ExpirySubscription>) -> SubscriberHandle {
        tokio::spawn(async move { self.run(subscription).await })
    }
}
