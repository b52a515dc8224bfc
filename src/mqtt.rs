// MQTT background task. Connects to the broker using `rumqttc`, keeps a
// QoS 1 subscription alive across reconnects, and hands each normalized
// message to the store writer over a bounded channel.
use prometheus::IntCounter;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, Outgoing, QoS};
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, sleep};
use tracing::{info, trace, warn};

use crate::config::MqttConfig;
use crate::ingest::{self, IngestRecord};

/// Longest pause between reconnect attempts.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct MqttCounters {
    pub received: IntCounter,
    pub rejected: IntCounter,
}

/// Start the long-running MQTT loop. Returns only when `shutdown` fires or
/// the store writer goes away. Intended to be spawned with
/// `tokio::task::spawn` from `server::run()`.
pub async fn start_mqtt_loop(
    config: MqttConfig,
    collection_prefix: String,
    records: mpsc::Sender<IngestRecord>,
    counters: MqttCounters,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(5));
    // Non-clean session: the broker keeps the subscription and queues QoS 1
    // messages while this client is away.
    options.set_clean_session(false);

    match &config.credentials {
        Some((user, password)) => {
            options.set_credentials(user, password);
            info!(user = %user, "using MQTT credentials from environment");
        }
        None => {
            info!("no MQTT credentials provided; connecting without authentication");
        }
    }

    info!(
        host = %config.host,
        port = config.port,
        client_id = %config.client_id,
        "connecting to MQTT broker"
    );

    let (client, mut eventloop) = AsyncClient::new(options, 10);
    let mut reconnect_delay = Duration::from_secs(1);

    // The subscription is (re)issued from the ConnAck handler below rather
    // than up front: it must also happen after every reconnect where the
    // broker did not resume our session.
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("shutting down; disconnecting from MQTT broker");
                client.disconnect().await.ok();
                // Keep polling until the DISCONNECT has gone out.
                while let Ok(event) = eventloop.poll().await {
                    if matches!(event, Event::Outgoing(Outgoing::Disconnect)) {
                        break;
                    }
                }
                return Ok(());
            }
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                        reconnect_delay = Duration::from_secs(1);
                        if ack.session_present {
                            info!("connected; broker resumed the existing session");
                        } else {
                            info!(topic = %config.topic, "connected with a fresh session; subscribing");
                            client.subscribe(&config.topic, QoS::AtLeastOnce).await?;
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        counters.received.inc();
                        let received = chrono::Local::now();
                        match ingest::build_record(
                            &collection_prefix,
                            &publish.topic,
                            &publish.payload,
                            received,
                        ) {
                            Ok(record) => {
                                trace!(topic = %publish.topic, collection = %record.collection, "received message");
                                // A full channel parks the event loop here,
                                // which stalls acks toward the broker until
                                // the writer catches up.
                                if records.send(record).await.is_err() {
                                    return Err(anyhow::anyhow!(
                                        "store writer is gone; stopping MQTT loop"
                                    ));
                                }
                            }
                            Err(reason) => {
                                counters.rejected.inc();
                                warn!(topic = %publish.topic, %reason, "rejecting malformed payload");
                            }
                        }
                    }
                    Ok(Event::Incoming(incoming)) => {
                        trace!(?incoming, "incoming");
                    }
                    Ok(Event::Outgoing(outgoing)) => {
                        trace!(?outgoing, "outgoing");
                    }
                    Err(e) => {
                        warn!(
                            error = %e,
                            delay_secs = reconnect_delay.as_secs(),
                            "MQTT connection error; backing off before reconnect"
                        );
                        sleep(reconnect_delay).await;
                        reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
                    }
                }
            }
        }
    }
}
