//! Broadcast bus for execution lifecycle events.
//!
//! One channel carries the events of every execution the engine drives.
//! [`ExecutionEvents`] narrows a receiver to a single execution.

use rewind_types::event::ExecutionEvent;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use uuid::Uuid;

/// Multi-consumer bus for execution lifecycle events.
///
/// Cloning the bus clones the sender, allowing multiple producers.
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no subscribers, the event is silently dropped.
    pub fn publish(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }
}

/// A receiver that only yields events for one execution.
///
/// Subscribe before starting the work whose events you want, then scope the
/// receiver once the execution id is known.
pub struct ExecutionEvents {
    receiver: broadcast::Receiver<ExecutionEvent>,
    execution_id: Uuid,
}

impl ExecutionEvents {
    pub fn new(receiver: broadcast::Receiver<ExecutionEvent>, execution_id: Uuid) -> Self {
        Self {
            receiver,
            execution_id,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Wait for the next event of this execution. Cancel safe.
    pub async fn recv(&mut self) -> Result<ExecutionEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if event.execution_id() == self.execution_id {
                return Ok(event);
            }
        }
    }

    /// Take an already-buffered event of this execution, skipping lag.
    pub fn try_next(&mut self) -> Option<ExecutionEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if event.execution_id() == self.execution_id => return Some(event),
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn completed(execution_id: Uuid) -> ExecutionEvent {
        ExecutionEvent::ExecutionCompleted { execution_id }
    }

    #[tokio::test]
    async fn publish_and_subscribe_delivers_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let id = Uuid::now_v7();

        bus.publish(completed(id));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.execution_id(), id);
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(completed(Uuid::now_v7()));

        assert!(matches!(rx1.recv().await.unwrap(), ExecutionEvent::ExecutionCompleted { .. }));
        assert!(matches!(rx2.recv().await.unwrap(), ExecutionEvent::ExecutionCompleted { .. }));
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.publish(completed(Uuid::now_v7()));
    }

    #[test]
    fn lagged_receiver_reports_lag() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(completed(Uuid::now_v7()));
        }
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(_))
        ));
    }

    #[tokio::test]
    async fn scoped_receiver_skips_other_executions() {
        let bus = EventBus::new(16);
        let mine = Uuid::now_v7();
        let mut events = ExecutionEvents::new(bus.subscribe(), mine);

        bus.publish(completed(Uuid::now_v7()));
        bus.publish(ExecutionEvent::ExecutionPaused {
            execution_id: mine,
            step_index: 2,
        });
        bus.publish(completed(Uuid::now_v7()));
        bus.publish(completed(mine));

        assert!(matches!(
            events.recv().await.unwrap(),
            ExecutionEvent::ExecutionPaused { step_index: 2, .. }
        ));
        assert!(matches!(
            events.try_next(),
            Some(ExecutionEvent::ExecutionCompleted { .. })
        ));
        assert!(events.try_next().is_none());
        assert_eq!(events.execution_id(), mine);
    }

    #[test]
    fn scoped_try_next_recovers_from_lag() {
        let bus = EventBus::new(2);
        let mine = Uuid::now_v7();
        let mut events = ExecutionEvents::new(bus.subscribe(), mine);
        for _ in 0..4 {
            bus.publish(completed(Uuid::now_v7()));
        }
        bus.publish(completed(mine));
        assert!(events.try_next().is_some());
    }

    #[test]
    fn clone_shares_channel() {
        let bus = EventBus::new(16);
        let bus2 = bus.clone();
        let mut rx = bus.subscribe();

        bus2.publish(completed(Uuid::now_v7()));

        assert!(rx.try_recv().is_ok());
        assert!(format!("{bus:?}").contains("receiver_count"));
    }
}
