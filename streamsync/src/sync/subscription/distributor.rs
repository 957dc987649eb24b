// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, trace};

use crate::sync::subscription::{LiveFilter, Registry};
use crate::types::{EventHash, StreamAndCookie, StreamId, SyncOp, SyncStreamsResponse};

/// Hashes of all events and miniblock headers of an update.
fn event_hashes(stream: &StreamAndCookie) -> HashSet<EventHash> {
    stream
        .events
        .iter()
        .map(|envelope| envelope.hash)
        .chain(
            stream
                .miniblocks
                .iter()
                .filter_map(|miniblock| miniblock.header.as_ref())
                .map(|header| header.hash),
        )
        .collect()
}

fn strip_events(stream: &mut StreamAndCookie, hashes: &HashSet<EventHash>) {
    stream
        .events
        .retain(|envelope| !hashes.contains(&envelope.hash));
    stream.miniblocks.retain(|miniblock| {
        miniblock
            .header
            .as_ref()
            .map_or(true, |header| !hashes.contains(&header.hash))
    });
}

/// Hands syncer updates to the interested subscriptions.
pub struct Distributor {
    registry: Arc<dyn Registry>,
}

impl Distributor {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }

    /// Delivers a live update to every subscriber of the stream.
    ///
    /// Subscribers waiting for their backfill are skipped. A DOWN reaches every subscriber and
    /// drops the stream from the registry.
    pub fn distribute_message(&self, stream_id: StreamId, message: SyncStreamsResponse) {
        let subscriptions = self.registry.get_subscriptions_for_stream(&stream_id);

        if message.op == SyncOp::Down {
            debug!(
                "Stream {} down, informing {} subscribers",
                stream_id,
                subscriptions.len()
            );

            for subscription in &subscriptions {
                subscription.forget_stream(&stream_id);
                subscription.send(message.clone());
            }

            self.registry.on_stream_down(&stream_id);
            return;
        }

        for subscription in subscriptions {
            match subscription.live_filter(&stream_id) {
                LiveFilter::Skip => {
                    trace!(
                        "Skip update of {} for initializing sync {}",
                        stream_id,
                        subscription.sync_id()
                    );
                }
                LiveFilter::Deliver => subscription.send(message.clone()),
                LiveFilter::Strip(hashes) => {
                    let mut message = message.clone();
                    if let Some(stream) = message.stream.as_mut() {
                        strip_events(stream, &hashes);
                    }
                    subscription.send(message);
                }
            }
        }
    }

    /// Delivers a backfill to the session at the head of its target list.
    pub fn distribute_backfill_message(&self, stream_id: StreamId, mut message: SyncStreamsResponse) {
        if message.target_sync_ids.is_empty() {
            return;
        }

        let target = message.target_sync_ids.remove(0);
        let subscription = match self.registry.get_subscription_by_id(&target) {
            Some(subscription) => subscription,
            None => {
                debug!("Drop backfill of {} for unknown sync {}", stream_id, target);
                return;
            }
        };

        let hashes = message
            .stream
            .as_ref()
            .map(event_hashes)
            .unwrap_or_default();

        subscription.send(message);
        subscription.finish_initializing(stream_id, hashes);
    }
}
