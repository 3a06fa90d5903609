use std::sync::Arc;

use log::*;
use tokio::time::MissedTickBehavior;

use crate::host::SessionHost;
use crate::message_handling::MessageCodec;

impl<C: MessageCodec> SessionHost<C> {
    /// Drive the host's flush ticks on a Tokio runtime until it is shut down.
    ///
    /// Ticks which can't keep up are skipped rather than bunched together.
    pub async fn flush_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!("Flushing every {:?}", self.config.tick_interval);

        while !self.is_shut_down() {
            interval.tick().await;
            let summary = self.flush_all();
            if summary.transmits > 0 {
                trace!(
                    "Tick sent {} messages in {} bytes",
                    summary.messages,
                    summary.bytes
                );
            }
        }

        debug!("Flush loop exiting");
    }
}
