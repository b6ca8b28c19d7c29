// Event fan-out
//
// Events go to an optional callback and to every live channel subscriber.
// Subscribers whose receiver was dropped are pruned on the next emission.

use crate::averager::EvokedResult;
use crate::config::AveragingConfig;
use crate::types::EngineState;
use crate::windower::DropReason;
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;

/// Events emitted by the averaging engine
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum AveragingEvent {
    /// An average was updated
    Evoked(Arc<EvokedResult>),

    /// A setter committed a new configuration
    ConfigurationChanged(Box<AveragingConfig>),

    StateChanged(EngineState),

    EpochRejected { trigger_position: u64, peak: f64 },

    TriggerDropped { position: u64, reason: DropReason },
}

type EventCallback = Box<dyn Fn(AveragingEvent) + Send + Sync>;

#[derive(Default)]
pub struct EventHub {
    callback: RwLock<Option<EventCallback>>,
    subscribers: Mutex<Vec<Sender<AveragingEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set event callback function, replacing any previous one
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(AveragingEvent) + Send + Sync + 'static,
    {
        *self.callback.write() = Some(Box::new(callback));
    }

    pub fn clear_callback(&self) {
        *self.callback.write() = None;
    }

    /// New receiver of every event emitted from now on
    pub fn subscribe(&self) -> Receiver<AveragingEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn emit(&self, event: AveragingEvent) {
        {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }

        if let Some(callback) = self.callback.read_recursive().as_ref() {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_callback_and_subscribers_both_receive() {
        let hub = EventHub::new();
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            hub.set_callback(move |_| {
                seen.fetch_add(1, Ordering::Relaxed);
            });
        }
        let rx = hub.subscribe();

        hub.emit(AveragingEvent::StateChanged(EngineState::Stopped));

        assert_eq!(seen.load(Ordering::Relaxed), 1);
        assert!(matches!(
            rx.try_recv(),
            Ok(AveragingEvent::StateChanged(EngineState::Stopped))
        ));
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let hub = EventHub::new();
        let keep = hub.subscribe();
        drop(hub.subscribe());
        assert_eq!(hub.subscriber_count(), 2);

        hub.emit(AveragingEvent::TriggerDropped {
            position: 7,
            reason: DropReason::Overlapping,
        });

        assert_eq!(hub.subscriber_count(), 1);
        assert!(keep.try_recv().is_ok());
    }

    #[test]
    fn test_events_serialize_with_type_tag() {
        let event = AveragingEvent::EpochRejected {
            trigger_position: 42,
            peak: 12.5,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "EpochRejected");
        assert_eq!(json["data"]["trigger_position"], 42);
    }
}
