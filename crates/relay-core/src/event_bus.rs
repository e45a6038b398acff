//! Event bus for inter-component communication.
//!
//! A thin wrapper over a tokio broadcast channel. Components publish
//! [`RelayEvent`]s fire-and-forget; any number of observers subscribe.
//! Publishing never blocks and never fails settlement: an event with no
//! subscribers is simply dropped.

use tokio::sync::broadcast;

use relay_types::RelayEvent;

/// Broadcast bus for relay events.
#[derive(Clone)]
pub struct EventBus {
	sender: broadcast::Sender<RelayEvent>,
}

impl EventBus {
	/// Creates a bus retaining up to `capacity` undelivered events per
	/// subscriber before the oldest are dropped.
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity);
		Self { sender }
	}

	/// Publishes an event to all current subscribers.
	pub fn publish(&self, event: RelayEvent) {
		let _ = self.sender.send(event);
	}

	/// Creates a new subscription receiving events published from now on.
	pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
		self.sender.subscribe()
	}

	/// The raw sender, for components that emit events directly.
	pub fn sender(&self) -> broadcast::Sender<RelayEvent> {
		self.sender.clone()
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(1000)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use relay_types::{JobEvent, RelayEvent};

	#[tokio::test]
	async fn subscribers_receive_published_events() {
		let bus = EventBus::new(8);
		let mut receiver = bus.subscribe();
		bus.publish(RelayEvent::Job(JobEvent::Enqueued { id: "tx1".into() }));
		match receiver.recv().await.unwrap() {
			RelayEvent::Job(JobEvent::Enqueued { id }) => assert_eq!(id, "tx1"),
			other => panic!("unexpected event: {:?}", other),
		}
	}

	#[tokio::test]
	async fn publishing_without_subscribers_is_silent() {
		let bus = EventBus::new(8);
		bus.publish(RelayEvent::Job(JobEvent::Enqueued { id: "tx1".into() }));
	}
}
