//! Redis pub/sub message bus.
//!
//! One pub/sub connection per service instance, subscribed to the policy
//! notifications channel of the namespace. Events are a closed sum (a
//! schedule, an unschedule, a hook registration or a liveness ping) and
//! each variant has its own registered dispatcher, so a payload either
//! decodes into a known shape or is skipped with a log line.
//!
//! Dispatcher errors are logged and never propagated; a broken consumer
//! must not take down the receive loop.

use std::time::Duration;

use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::ServiceError;
use crate::keys::Namespace;
use crate::period::policy::PeriodicPolicy;

/// Interval of the liveness ping published to the channel.
const PING_INTERVAL: Duration = Duration::from_secs(60);

/// Delay before a reconnect attempt after the subscription drops.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// A job-id → hook-URL registration, propagated between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookRegistration {
    /// Job the hook belongs to.
    pub job_id: String,
    /// URL notified of state changes.
    pub hook_url: String,
}

/// Typed events carried on the notifications channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A policy was created; stores should add it.
    SchedulePolicy(PeriodicPolicy),
    /// A policy was removed; stores should drop it.
    UnschedulePolicy(PeriodicPolicy),
    /// A hook URL was registered for a job.
    RegisterHook(HookRegistration),
    /// Connection liveness probe; carries nothing.
    Ping,
}

/// On-the-wire envelope. Policy events carry `periodic_job_policy`;
/// changing that layout is a compatibility break.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    periodic_job_policy: Option<PeriodicPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hook: Option<HookRegistration>,
}

impl Notification {
    /// Event name used on the wire.
    pub fn event_name(&self) -> &'static str {
        match self {
            Notification::SchedulePolicy(_) => "Schedule",
            Notification::UnschedulePolicy(_) => "UnSchedule",
            Notification::RegisterHook(_) => "RegisterHook",
            Notification::Ping => "Ping",
        }
    }

    /// Encodes to the wire envelope.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let envelope = match self {
            Notification::SchedulePolicy(p) | Notification::UnschedulePolicy(p) => Envelope {
                event: self.event_name().to_string(),
                periodic_job_policy: Some(p.clone()),
                hook: None,
            },
            Notification::RegisterHook(h) => Envelope {
                event: self.event_name().to_string(),
                periodic_job_policy: None,
                hook: Some(h.clone()),
            },
            Notification::Ping => Envelope {
                event: self.event_name().to_string(),
                ..Envelope::default()
            },
        };
        serde_json::to_string(&envelope)
    }

    /// Decodes a wire payload.
    ///
    /// Unknown event names and envelopes missing their payload decode to
    /// `None`: peers may speak a newer dialect and must not wedge us.
    pub fn decode(raw: &str) -> Result<Option<Notification>, serde_json::Error> {
        let envelope: Envelope = serde_json::from_str(raw)?;
        Ok(match envelope.event.as_str() {
            "Schedule" => envelope.periodic_job_policy.map(Notification::SchedulePolicy),
            "UnSchedule" => envelope
                .periodic_job_policy
                .map(Notification::UnschedulePolicy),
            "RegisterHook" => envelope.hook.map(Notification::RegisterHook),
            "Ping" => Some(Notification::Ping),
            _ => None,
        })
    }
}

/// Publishes one notification outside a transaction.
///
/// The scheduler publishes inside its MULTI pipelines instead; this is for
/// standalone publishers such as the hook registration path.
pub async fn publish(
    conn: &mut ConnectionManager,
    namespace: &Namespace,
    notification: &Notification,
) -> Result<(), ServiceError> {
    let payload = notification.encode()?;
    conn.publish::<_, _, ()>(namespace.periodic_notifications(), payload)
        .await?;
    Ok(())
}

/// Dispatcher for one event variant.
pub type Dispatcher<T> = Box<dyn Fn(T) -> Result<(), ServiceError> + Send + Sync>;

/// The pub/sub receive loop plus its per-variant dispatchers.
pub struct MessageBus {
    client: redis::Client,
    publisher: ConnectionManager,
    namespace: Namespace,
    on_schedule: Option<Dispatcher<PeriodicPolicy>>,
    on_unschedule: Option<Dispatcher<PeriodicPolicy>>,
    on_hook: Option<Dispatcher<HookRegistration>>,
}

impl MessageBus {
    /// Creates a bus. `client` owns the dedicated pub/sub connection;
    /// `publisher` is a shared connection used for liveness pings.
    pub fn new(client: redis::Client, publisher: ConnectionManager, namespace: Namespace) -> Self {
        Self {
            client,
            publisher,
            namespace,
            on_schedule: None,
            on_unschedule: None,
            on_hook: None,
        }
    }

    /// Registers the schedule-policy dispatcher.
    pub fn on_schedule_policy<F>(mut self, f: F) -> Self
    where
        F: Fn(PeriodicPolicy) -> Result<(), ServiceError> + Send + Sync + 'static,
    {
        self.on_schedule = Some(Box::new(f));
        self
    }

    /// Registers the unschedule-policy dispatcher.
    pub fn on_unschedule_policy<F>(mut self, f: F) -> Self
    where
        F: Fn(PeriodicPolicy) -> Result<(), ServiceError> + Send + Sync + 'static,
    {
        self.on_unschedule = Some(Box::new(f));
        self
    }

    /// Registers the hook-registration dispatcher.
    pub fn on_register_hook<F>(mut self, f: F) -> Self
    where
        F: Fn(HookRegistration) -> Result<(), ServiceError> + Send + Sync + 'static,
    {
        self.on_hook = Some(Box::new(f));
        self
    }

    /// Runs the receive loop until the shutdown signal fires.
    ///
    /// A dropped subscription is re-established after a short delay; a
    /// shutdown causes a clean unsubscribe and exit.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let channel = self.namespace.periodic_notifications();

        loop {
            let conn = match self.client.get_async_connection().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "Pub/sub dial failed");
                    if wait_or_shutdown(RECONNECT_DELAY, &mut shutdown).await {
                        return;
                    }
                    continue;
                }
            };

            let mut pubsub = conn.into_pubsub();
            if let Err(e) = pubsub.subscribe(&channel).await {
                error!(error = %e, channel = %channel, "Subscribe failed");
                if wait_or_shutdown(RECONNECT_DELAY, &mut shutdown).await {
                    return;
                }
                continue;
            }
            info!(channel = %channel, "Message bus subscribed");

            let mut ping = tokio::time::interval(PING_INTERVAL);
            ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            let clean_exit = loop {
                let mut stream = pubsub.on_message();
                tokio::select! {
                    maybe = stream.next() => {
                        drop(stream);
                        match maybe {
                            Some(msg) => self.dispatch(&msg),
                            None => break false,
                        }
                    }
                    _ = ping.tick() => {
                        drop(stream);
                        let mut conn = self.publisher.clone();
                        if let Err(e) = publish(&mut conn, &self.namespace, &Notification::Ping).await {
                            warn!(error = %e, "Liveness ping failed");
                        }
                    }
                    _ = shutdown.recv() => {
                        drop(stream);
                        break true;
                    }
                }
            };

            if clean_exit {
                if let Err(e) = pubsub.unsubscribe(&channel).await {
                    warn!(error = %e, "Unsubscribe failed during shutdown");
                }
                info!("Message bus stopped");
                return;
            }

            warn!("Pub/sub connection lost, reconnecting");
            if wait_or_shutdown(RECONNECT_DELAY, &mut shutdown).await {
                return;
            }
        }
    }

    fn dispatch(&self, msg: &redis::Msg) {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Non-text pub/sub payload skipped");
                return;
            }
        };

        let notification = match Notification::decode(&payload) {
            Ok(Some(n)) => n,
            Ok(None) => {
                debug!(payload = %payload, "Unknown event skipped");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Malformed notification skipped");
                return;
            }
        };

        let result = match notification {
            Notification::SchedulePolicy(policy) => match &self.on_schedule {
                Some(cb) => cb(policy),
                None => missing("Schedule"),
            },
            Notification::UnschedulePolicy(policy) => match &self.on_unschedule {
                Some(cb) => cb(policy),
                None => missing("UnSchedule"),
            },
            Notification::RegisterHook(hook) => match &self.on_hook {
                Some(cb) => cb(hook),
                None => missing("RegisterHook"),
            },
            Notification::Ping => {
                debug!("Liveness ping received");
                Ok(())
            }
        };

        if let Err(e) = result {
            error!(error = %e, "Notification dispatcher failed");
        }
    }
}

fn missing(event: &str) -> Result<(), ServiceError> {
    debug!(event = %event, "No dispatcher registered for event");
    Ok(())
}

/// Sleeps for `delay`, returning true when shutdown fired first.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.recv() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;

    fn sample_policy() -> PeriodicPolicy {
        let mut p = PeriodicPolicy::new(
            "fake_job",
            params::single("image", "testing:v1"),
            "5 * * * * *",
        );
        p.policy_id = "fake_ID".to_string();
        p
    }

    #[test]
    fn test_schedule_event_wire_shape() {
        let notification = Notification::SchedulePolicy(sample_policy());
        let raw = notification.encode().expect("encode");

        let value: serde_json::Value = serde_json::from_str(&raw).expect("parse");
        assert_eq!(value["event"], "Schedule");
        assert_eq!(value["periodic_job_policy"]["policy_id"], "fake_ID");
        assert_eq!(value["periodic_job_policy"]["job_name"], "fake_job");
        assert!(value.get("hook").is_none());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        for notification in [
            Notification::SchedulePolicy(sample_policy()),
            Notification::UnschedulePolicy(sample_policy()),
            Notification::RegisterHook(HookRegistration {
                job_id: "j1".into(),
                hook_url: "https://example.test/hook".into(),
            }),
            Notification::Ping,
        ] {
            let raw = notification.encode().expect("encode");
            let decoded = Notification::decode(&raw).expect("decode").expect("known");
            assert_eq!(decoded, notification);
        }
    }

    #[test]
    fn test_unknown_event_is_skipped_not_an_error() {
        let decoded =
            Notification::decode(r#"{"event":"SomethingNew","extra":1}"#).expect("decodes");
        assert!(decoded.is_none());
    }

    #[test]
    fn test_policy_event_without_payload_is_skipped() {
        let decoded = Notification::decode(r#"{"event":"Schedule"}"#).expect("decodes");
        assert!(decoded.is_none());
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        assert!(Notification::decode("{nope").is_err());
    }
}
