// SPDX-License-Identifier: BUSL-1.1

//! The Ingress Consumer: pulls raw log-broker records, batches them, and
//! hands each one to the Broadcast Engine under the ingress CPU brake and
//! rate bucket.
//!
//! The NATS subscription itself is collapsed into an `mpsc` channel of
//! `IngressRecord` so the batching/backpressure loop below is testable
//! without a broker: tests push records directly onto a channel built
//! with [`test_channel`].

use serde_json::value::RawValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::channel::{derive_channel, event_type_of};
use crate::state::FanoutState;

/// One raw record off the log broker: an opaque subject/key plus its
/// still-unparsed JSON payload.
pub struct IngressRecord {
    pub key: String,
    pub payload: Box<RawValue>,
}

/// Bridges an `async_nats::Subscriber` into the `IngressRecord` channel
/// the batching loop consumes. Spawned once per server startup when
/// `nats_url` is configured.
pub async fn connect_nats(
    nats_url: &str,
    subject: String,
    shutdown: CancellationToken,
) -> anyhow::Result<mpsc::Receiver<IngressRecord>> {
    let client = async_nats::connect(nats_url).await?;
    let mut subscriber = client.subscribe(subject).await?;
    let (tx, rx) = mpsc::channel(4096);

    tokio::spawn(async move {
        use futures_util::StreamExt;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = subscriber.next() => {
                    let Some(message) = message else { break };
                    let Ok(payload) = RawValue::from_string(
                        String::from_utf8_lossy(&message.payload).into_owned(),
                    ) else {
                        tracing::warn!(subject = %message.subject, "ingress payload is not valid json, dropping");
                        continue;
                    };
                    let record = IngressRecord { key: message.subject.to_string(), payload };
                    if tx.send(record).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    Ok(rx)
}

/// Build a channel pair a test can use in place of [`connect_nats`].
#[cfg(test)]
pub fn test_channel() -> (mpsc::Sender<IngressRecord>, mpsc::Receiver<IngressRecord>) {
    mpsc::channel(64)
}

/// Drain `rx`, batching up to `ingress_batch_max` records or
/// `ingress_batch_window` of wall-clock time, whichever comes first, and
/// publish each record that survives the CPU brake and ingress bucket.
///
/// Runs until `rx` closes or shutdown is cancelled; does not itself
/// implement a shutdown grace period, that's the Write Pipe's job when
/// draining existing clients.
pub async fn run(state: FanoutState, mut rx: mpsc::Receiver<IngressRecord>, shutdown: CancellationToken) {
    let batch_max = state.config().ingress_batch_max;
    let batch_window = state.config().ingress_batch_window();
    let mut batch = Vec::with_capacity(batch_max);

    'outer: loop {
        batch.clear();
        let deadline = tokio::time::sleep(batch_window);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    for record in batch.drain(..) {
                        process_record(&state, record);
                    }
                    break 'outer;
                }
                record = rx.recv() => {
                    match record {
                        Some(record) => {
                            batch.push(record);
                            if batch.len() >= batch_max {
                                break;
                            }
                        }
                        None => {
                            for record in batch.drain(..) {
                                process_record(&state, record);
                            }
                            break 'outer;
                        }
                    }
                }
                _ = &mut deadline => break,
            }
        }

        for record in batch.drain(..) {
            process_record(&state, record);
        }
    }
}

fn process_record(state: &FanoutState, record: IngressRecord) {
    if !state.resource_guard().ingress_bucket.try_acquire() {
        tracing::debug!(key = %record.key, "ingress rate limited, dropping record");
        return;
    }
    if state.resource_guard().should_pause_ingress() {
        tracing::debug!(key = %record.key, "ingress paused under cpu pressure, dropping record");
        return;
    }
    let Some(channel) = derive_channel(&record.key) else {
        tracing::debug!(key = %record.key, "ingress key does not derive a channel, dropping record");
        return;
    };
    let event_type = event_type_of(&record.key);
    let delivered = crate::broadcast::publish(state, &channel, event_type, &record.payload);
    tracing::trace!(channel = %channel, event_type, delivered, "ingress record published");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::config::FanoutConfig;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn processes_record_and_publishes_to_subscriber() {
        let state = FanoutState::new(FanoutConfig::default(), CancellationToken::new());
        let permit = state.admission_semaphore().clone().try_acquire_owned().unwrap();
        let (client, _rx) = Client::new(
            "c1".to_owned(),
            std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            state.config(),
            permit,
        );
        state.subscriptions().add("tradesolusdc", client.clone());

        let payload = RawValue::from_string(r#"{"p":1}"#.to_owned()).unwrap();
        process_record(&state, IngressRecord { key: "odin.token.trade.solusdc".to_owned(), payload });
        // drained synchronously so the client's queue should now hold one frame
        assert_eq!(client.try_enqueue(Arc::from("probe")), crate::client::EnqueueOutcome::Delivered);
    }

    #[tokio::test]
    async fn malformed_key_is_dropped_without_panicking() {
        let state = FanoutState::new(FanoutConfig::default(), CancellationToken::new());
        let payload = RawValue::from_string(r#"{}"#.to_owned()).unwrap();
        process_record(&state, IngressRecord { key: "too.short".to_owned(), payload });
    }

    #[tokio::test]
    async fn run_drains_until_channel_closes() {
        let state = FanoutState::new(FanoutConfig::default(), CancellationToken::new());
        let (tx, rx) = test_channel();
        let shutdown = CancellationToken::new();
        let payload = RawValue::from_string(r#"{}"#.to_owned()).unwrap();
        tx.send(IngressRecord { key: "odin.token.trade.solusdc".to_owned(), payload }).await.unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), run(state, rx, shutdown)).await.expect("loop exits promptly");
    }
}
