//! Resource observation multiplexer.
//!
//! Many logical subscriptions to one (device, resource) pair share a single
//! physical observation. The registry entry for the pair fans each
//! notification out to its subscribers, keeps the latest message so late
//! joiners get it replayed once, and stops the physical observation when the
//! last subscriber leaves.
//!
//! Every entry carries a setup lock. The subscriber that creates an entry
//! holds it until the physical observation is running, joiners and teardown
//! take it before touching the subscriber set, so a subscriber can never be
//! added to an entry that is being torn down.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ocf_core::{
    get_resource_link, Codec, Decoder, DeviceObservation, MediaType, Message, ObservationError,
    ObservationEvent, ObservationHandler,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::device_cache::{DeviceCache, DeviceLease};
use crate::error::{ClientError, Result};

pub(crate) type ObservationRegistry = Arc<DashMap<String, Arc<ResourceObservations>>>;

/// Stable registry key for a device resource.
pub fn registry_key(device_id: &str, href: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("{device_id}{href}").as_bytes()).to_string()
}

fn observation_id(key: &str, subscription_id: &str) -> String {
    format!("{key}/{subscription_id}")
}

/// Split an observation id into registry key and subscription id.
pub fn parse_observation_id(id: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = id.split('/').collect();
    if parts.len() != 2 {
        return Err(ClientError::InvalidObservationId(id.to_string()));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

enum Phase {
    /// The creating subscriber is starting the physical observation
    Pending,
    Active {
        observation_id: String,
        lease: DeviceLease,
    },
    Closed,
}

pub(crate) struct ResourceObservations {
    key: String,
    device_id: String,
    href: String,
    setup: Arc<tokio::sync::Mutex<Phase>>,
    subscribers: DashMap<String, Arc<Subscriber>>,
    last_message: Mutex<Option<Message>>,
}

impl ResourceObservations {
    fn new(key: String, device_id: &str, href: &str) -> Arc<Self> {
        Arc::new(Self {
            key,
            device_id: device_id.to_string(),
            href: href.to_string(),
            setup: Arc::new(tokio::sync::Mutex::new(Phase::Pending)),
            subscribers: DashMap::new(),
            last_message: Mutex::new(None),
        })
    }

    /// Register a subscriber, handing it the latest message for replay.
    fn add_subscriber(&self, subscription_id: &str, subscriber: Arc<Subscriber>) -> bool {
        let last = self.last_message.lock();
        let replay = last.is_some();
        subscriber.state.lock().pending = last.clone();
        self.subscribers
            .insert(subscription_id.to_string(), subscriber);
        replay
    }

    fn deliver(&self, message: Message) {
        let subscribers: Vec<Arc<Subscriber>> = {
            let mut last = self.last_message.lock();
            *last = Some(message.clone());
            self.subscribers.iter().map(|s| s.value().clone()).collect()
        };
        trace!(
            device_id = %self.device_id,
            href = %self.href,
            subscribers = subscribers.len(),
            "fanning out notification"
        );
        for subscriber in subscribers {
            subscriber.handle_message(&message);
        }
    }

    fn drain_subscribers(&self) -> Vec<Arc<Subscriber>> {
        let ids: Vec<String> = self.subscribers.iter().map(|s| s.key().clone()).collect();
        ids.into_iter()
            .filter_map(|id| self.subscribers.remove(&id).map(|(_, s)| s))
            .collect()
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[derive(Default)]
struct SubscriberState {
    closed: bool,
    /// Latest message at join time, until the first delivery
    pending: Option<Message>,
}

struct Subscriber {
    handler: Arc<dyn ObservationHandler>,
    codec: Arc<dyn Codec>,
    state: Mutex<SubscriberState>,
}

impl Subscriber {
    fn new(handler: Arc<dyn ObservationHandler>, codec: Arc<dyn Codec>) -> Arc<Self> {
        Arc::new(Self {
            handler,
            codec,
            state: Mutex::new(SubscriberState::default()),
        })
    }

    fn dispatch(&self, message: Message) {
        self.handler
            .handle(Decoder::new(message, self.codec.clone()));
    }

    // The state lock is held across the handler call so a replay and a live
    // message never interleave for one subscriber.
    fn handle_message(&self, message: &Message) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if let Some(pending) = state.pending.take() {
            self.dispatch(pending);
        }
        self.dispatch(message.clone());
    }

    fn handle_first_message(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if let Some(pending) = state.pending.take() {
            self.dispatch(pending);
        }
    }

    fn close(&self) -> bool {
        let mut state = self.state.lock();
        let was_open = !state.closed;
        state.closed = true;
        state.pending = None;
        was_open
    }

    fn on_close(&self) {
        if self.close() {
            self.handler.on_close();
        }
    }

    fn error(&self, err: ObservationError) {
        if self.close() {
            self.handler.error(err);
        }
    }
}

/// Subscribe `handler` to a device resource. Returns the observation id.
pub(crate) async fn observe_resource(
    registry: &ObservationRegistry,
    device_cache: &Arc<DeviceCache>,
    request_timeout: Duration,
    device_id: &str,
    href: &str,
    handler: Arc<dyn ObservationHandler>,
    codec: Arc<dyn Codec>,
) -> Result<String> {
    let key = registry_key(device_id, href);
    let subscription_id = Uuid::new_v4().to_string();
    let accept = codec.content_format();
    let subscriber = Subscriber::new(handler, codec);

    loop {
        let candidate = ResourceObservations::new(key.clone(), device_id, href);
        let candidate_setup = candidate.setup.clone().lock_owned().await;

        let existing = match registry.entry(key.clone()) {
            Entry::Occupied(entry) => Some(entry.get().clone()),
            Entry::Vacant(entry) => {
                entry.insert(candidate.clone());
                None
            }
        };

        let Some(resource) = existing else {
            candidate.add_subscriber(&subscription_id, subscriber);
            let creation = Creation {
                registry,
                resource: candidate.clone(),
                setup: Some(candidate_setup),
            };

            let started = tokio::time::timeout(
                request_timeout,
                start_observation(device_cache, device_id, href, accept),
            )
            .await
            .map_err(|_| ClientError::Timeout(request_timeout))
            .and_then(|result| result);

            return match started {
                Ok((observation, lease)) => {
                    debug!(device_id, href, key = %key, "physical observation started");
                    creation.activate(Phase::Active {
                        observation_id: observation.id,
                        lease,
                    });
                    tokio::spawn(run_observation(
                        registry.clone(),
                        device_cache.clone(),
                        candidate,
                        observation.events,
                    ));
                    Ok(observation_id(&key, &subscription_id))
                }
                Err(e) => {
                    debug!(device_id, href, error = %e, "failed to start observation");
                    creation.fail();
                    Err(e)
                }
            };
        };
        drop(candidate_setup);

        let mut setup = resource.setup.lock().await;
        match *setup {
            Phase::Active { .. } => {}
            Phase::Closed => {
                drop(setup);
                tokio::task::yield_now().await;
                continue;
            }
            Phase::Pending => {
                // Setup ended without recording an outcome.
                *setup = Phase::Closed;
                registry.remove_if(&key, |_, v| Arc::ptr_eq(v, &resource));
                continue;
            }
        }

        let replay = resource.add_subscriber(&subscription_id, subscriber.clone());
        drop(setup);

        trace!(device_id, href, replay, "joined existing observation");
        if replay {
            tokio::spawn(async move { subscriber.handle_first_message() });
        }
        return Ok(observation_id(&key, &subscription_id));
    }
}

/// Setup of a freshly created registry entry, holding its setup lock.
///
/// Dropped before [`Creation::activate`] (the creating caller went away),
/// it closes the entry, removes it from the registry and tells the waiting
/// subscribers the observation is over.
struct Creation<'a> {
    registry: &'a ObservationRegistry,
    resource: Arc<ResourceObservations>,
    setup: Option<OwnedMutexGuard<Phase>>,
}

impl Creation<'_> {
    fn activate(mut self, phase: Phase) {
        if let Some(mut setup) = self.setup.take() {
            *setup = phase;
        }
    }

    /// Abandon setup after a reported failure; the caller already has the error.
    fn fail(mut self) {
        if self.close() {
            drop(self.resource.drain_subscribers());
        }
    }

    fn close(&mut self) -> bool {
        let Some(mut setup) = self.setup.take() else {
            return false;
        };
        *setup = Phase::Closed;
        let resource = &self.resource;
        self.registry
            .remove_if(&resource.key, |_, v| Arc::ptr_eq(v, resource));
        true
    }
}

impl Drop for Creation<'_> {
    fn drop(&mut self) {
        if !self.close() {
            return;
        }
        debug!(
            device_id = %self.resource.device_id,
            href = %self.resource.href,
            "observation setup abandoned"
        );
        for subscriber in self.resource.drain_subscribers() {
            subscriber.on_close();
        }
    }
}

async fn start_observation(
    device_cache: &DeviceCache,
    device_id: &str,
    href: &str,
    accept: MediaType,
) -> Result<(DeviceObservation, DeviceLease)> {
    let lease = device_cache.get_ref_device(device_id).await?;

    let started = async {
        let link = get_resource_link(lease.links(), href)?;
        let observation = lease.device().observe_resource(&link, accept).await?;
        if let Err(e) = device_cache.store_to_permanent_cache(&lease) {
            if let Err(stop) = lease
                .device()
                .stop_observing_resource(&observation.id)
                .await
            {
                warn!(device_id, href, error = %stop, "failed to stop orphaned observation");
            }
            return Err(e);
        }
        Ok::<_, ClientError>(observation)
    }
    .await;

    match started {
        Ok(observation) => Ok((observation, lease)),
        Err(e) => {
            if let Err(release) = lease.release().await {
                warn!(device_id, error = %release, "failed to release device");
            }
            Err(e)
        }
    }
}

/// Stop the physical observation and give back the device references taken
/// when it started.
async fn teardown(
    device_cache: &DeviceCache,
    observation_id: &str,
    lease: DeviceLease,
) -> std::result::Result<(), ocf_core::Error> {
    let stopped = lease
        .device()
        .stop_observing_resource(observation_id)
        .await;
    device_cache.remove_from_permanent_cache(&lease).await;
    let released = lease.release().await;
    stopped.and(released)
}

async fn run_observation(
    registry: ObservationRegistry,
    device_cache: Arc<DeviceCache>,
    resource: Arc<ResourceObservations>,
    mut events: mpsc::Receiver<ObservationEvent>,
) {
    let outcome = loop {
        match events.recv().await {
            Some(ObservationEvent::Notification(message)) => {
                if message.is_empty() {
                    break Err(ObservationError::EmptyBody);
                }
                resource.deliver(message);
            }
            Some(ObservationEvent::Canceled { reason }) => {
                break match reason.filter(|r| !r.is_empty()) {
                    Some(reason) => Err(ObservationError::Canceled(reason)),
                    None => Ok(()),
                };
            }
            Some(ObservationEvent::Error(e)) => break Err(ObservationError::Transport(e.to_string())),
            None => break Ok(()),
        }
    };

    close_observation(&registry, &device_cache, &resource, outcome).await;
}

/// Terminate an entry from the observation side and notify its subscribers.
async fn close_observation(
    registry: &ObservationRegistry,
    device_cache: &DeviceCache,
    resource: &Arc<ResourceObservations>,
    outcome: std::result::Result<(), ObservationError>,
) {
    let phase = {
        let mut setup = resource.setup.lock().await;
        std::mem::replace(&mut *setup, Phase::Closed)
    };
    registry.remove_if(&resource.key, |_, v| Arc::ptr_eq(v, resource));

    if let Phase::Active {
        observation_id,
        lease,
    } = phase
    {
        match &outcome {
            Ok(()) => debug!(device_id = %resource.device_id, href = %resource.href, "observation closed"),
            Err(e) => debug!(device_id = %resource.device_id, href = %resource.href, error = %e, "observation failed"),
        }

        // Stopping fails when the device already ended the observation.
        if let Err(e) = teardown(device_cache, &observation_id, lease).await {
            trace!(device_id = %resource.device_id, error = %e, "teardown after close");
        }
    }

    for subscriber in resource.drain_subscribers() {
        match &outcome {
            Ok(()) => subscriber.on_close(),
            Err(e) => subscriber.error(e.clone()),
        }
    }
}

/// Remove one logical subscription, stopping the physical observation when
/// it was the last. Unknown ids are ignored.
pub(crate) async fn stop_observing_resource(
    registry: &ObservationRegistry,
    device_cache: &DeviceCache,
    id: &str,
) -> Result<()> {
    let (key, subscription_id) = parse_observation_id(id)?;
    let Some(resource) = registry.get(&key).map(|r| r.value().clone()) else {
        return Ok(());
    };

    let mut setup = resource.setup.lock().await;
    let Some((_, subscriber)) = resource.subscribers.remove(&subscription_id) else {
        return Ok(());
    };
    subscriber.close();

    if !resource.subscribers.is_empty() {
        trace!(key = %key, remaining = resource.subscribers.len(), "subscriber removed");
        return Ok(());
    }

    let phase = std::mem::replace(&mut *setup, Phase::Closed);
    registry.remove_if(&key, |_, v| Arc::ptr_eq(v, &resource));
    drop(setup);

    if let Phase::Active {
        observation_id,
        lease,
    } = phase
    {
        debug!(device_id = %resource.device_id, href = %resource.href, "last subscriber left, stopping observation");
        teardown(device_cache, &observation_id, lease).await?;
    }
    Ok(())
}

/// Close every observation, notifying subscribers with `on_close`.
pub(crate) async fn close_all(registry: &ObservationRegistry, device_cache: &DeviceCache) {
    let resources: Vec<Arc<ResourceObservations>> =
        registry.iter().map(|r| r.value().clone()).collect();
    for resource in resources {
        close_observation(registry, device_cache, &resource, Ok(())).await;
    }
}
