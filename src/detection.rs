//! Detection events and the source that delivers them.

use crate::{ParcelId, SorterError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Channel capacity for detection broadcasts.
pub const DETECTION_CHANNEL_SIZE: usize = 1024;

/// A physical sensor event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionEvent {
    /// A parcel passed the entry sensor.
    ParcelDetected {
        /// Source-assigned parcel id.
        parcel_id: ParcelId,
        /// Sensor that fired.
        sensor_id: i64,
        /// When the sensor fired.
        detected_at: DateTime<Utc>,
    },
    /// A sensor re-fired on what is probably the same physical parcel.
    DuplicateTriggerDetected {
        /// Id assigned to the anomaly.
        parcel_id: ParcelId,
        /// Sensor that fired.
        sensor_id: i64,
        /// Gap since the previous trigger on this sensor.
        time_since_last_ms: u64,
        /// Free-text classification from the sensor driver.
        reason: String,
    },
}

impl DetectionEvent {
    /// Parcel the event refers to.
    pub fn parcel_id(&self) -> ParcelId {
        match self {
            Self::ParcelDetected { parcel_id, .. } | Self::DuplicateTriggerDetected { parcel_id, .. } => {
                *parcel_id
            }
        }
    }
}

/// Something that emits [`DetectionEvent`]s.
///
/// Each call to `subscribe` is one subscription; dropping the receiver
/// ends it.
pub trait DetectionSource: Send + Sync {
    /// Start receiving detection events.
    fn subscribe(&self) -> broadcast::Receiver<DetectionEvent>;
}

/// [`DetectionSource`] fed programmatically, used by sensor drivers,
/// simulations and tests.
pub struct ChannelDetectionSource {
    tx: broadcast::Sender<DetectionEvent>,
}

impl Default for ChannelDetectionSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelDetectionSource {
    /// Create a source with no subscribers.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DETECTION_CHANNEL_SIZE);
        Self { tx }
    }

    /// Publish a raw event.
    ///
    /// # Errors
    ///
    /// Returns [`SorterError::ChannelClosed`] if nobody is subscribed.
    pub fn publish(&self, event: DetectionEvent) -> Result<(), SorterError> {
        self.tx
            .send(event)
            .map(|_| ())
            .map_err(|_| SorterError::ChannelClosed)
    }

    /// Publish a normal detection stamped now.
    ///
    /// # Errors
    ///
    /// Returns [`SorterError::ChannelClosed`] if nobody is subscribed.
    pub fn detect(&self, parcel_id: ParcelId, sensor_id: i64) -> Result<(), SorterError> {
        self.publish(DetectionEvent::ParcelDetected {
            parcel_id,
            sensor_id,
            detected_at: Utc::now(),
        })
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl DetectionSource for ChannelDetectionSource {
    fn subscribe(&self) -> broadcast::Receiver<DetectionEvent> {
        self.tx.subscribe()
    }
}
