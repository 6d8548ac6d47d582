use std::sync::mpsc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Experiment, ExperimentResult};

/// An experiment exposure: a user was assigned a variation of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingEvent {
    /// The experiment the user was assigned into.
    pub experiment: Experiment,
    /// The assignment.
    pub result: ExperimentResult,
    /// When the assignment happened.
    pub timestamp: DateTime<Utc>,
}

/// Receives experiment exposures so they can be forwarded to your analytics storage.
///
/// The client calls the callback at most once per experiment key and user identity (hash
/// attribute and value) for the lifetime of the client. A panicking callback is caught and logged,
/// and evaluation continues.
///
/// Closures implement this trait:
///
/// ```
/// # use splitkit::{ClientConfig, Experiment, ExperimentResult};
/// let config = ClientConfig::from_client_key("sdk-key").tracking_callback(
///     |experiment: &Experiment, result: &ExperimentResult| {
///         println!("{} -> {}", experiment.key, result.key);
///     },
/// );
/// ```
pub trait TrackingCallback {
    /// Called on experiment exposure.
    fn on_experiment_viewed(&self, experiment: &Experiment, result: &ExperimentResult);
}

pub(crate) struct NoopTrackingCallback;
impl TrackingCallback for NoopTrackingCallback {
    fn on_experiment_viewed(&self, _experiment: &Experiment, _result: &ExperimentResult) {}
}

impl<T: Fn(&Experiment, &ExperimentResult)> TrackingCallback for T {
    fn on_experiment_viewed(&self, experiment: &Experiment, result: &ExperimentResult) {
        self(experiment, result);
    }
}

/// A [`TrackingCallback`] that queues [`TrackingEvent`]s into a channel.
///
/// Useful to hand exposures over to a separate thread that batches them for delivery.
///
/// ```
/// # use splitkit::{ChannelTracker, ClientConfig};
/// let (tracker, events) = ChannelTracker::new();
/// let config = ClientConfig::from_client_key("sdk-key").tracking_callback(tracker);
/// std::thread::spawn(move || {
///     for event in events {
///         println!("{:?}", event);
///     }
/// });
/// ```
#[derive(Debug, Clone)]
pub struct ChannelTracker {
    sender: mpsc::Sender<TrackingEvent>,
}

impl ChannelTracker {
    /// Create a tracker and the receiving end of its queue.
    pub fn new() -> (ChannelTracker, mpsc::Receiver<TrackingEvent>) {
        let (sender, receiver) = mpsc::channel();
        (ChannelTracker { sender }, receiver)
    }
}

impl TrackingCallback for ChannelTracker {
    fn on_experiment_viewed(&self, experiment: &Experiment, result: &ExperimentResult) {
        let event = TrackingEvent {
            experiment: experiment.clone(),
            result: result.clone(),
            timestamp: Utc::now(),
        };
        if self.sender.send(event).is_err() {
            log::debug!(target: "splitkit",
                        experiment_key:display = experiment.key;
                        "tracking receiver dropped, discarding event");
        }
    }
}
