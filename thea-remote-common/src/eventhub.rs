use std::sync::Arc;

use tokio::sync::broadcast::error::SendError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

type SubscriptionStore<E> =
    Arc<Mutex<Vec<(Box<dyn Fn(&E) -> bool + Send + Sync>, UnboundedSender<E>)>>>;

#[derive(Clone)]
pub struct EventSender<E: Clone> {
    subscriptions: SubscriptionStore<E>,
}

impl<E: Clone> EventSender<E> {
    pub async fn send(&self, event: E) -> Result<(), SendError<E>> {
        let mut subscriptions = self.subscriptions.lock().await;
        subscriptions.retain(|(filter, sender)| {
            if filter(&event) {
                sender.send(event.clone()).is_ok()
            } else {
                true
            }
        });
        if subscriptions.is_empty() {
            Err(SendError(event))
        } else {
            Ok(())
        }
    }
}

pub struct EventSubscription<E>(UnboundedReceiver<E>);

impl<E> EventSubscription<E> {
    pub async fn recv(&mut self) -> Option<E> {
        self.0.recv().await
    }
}

pub struct EventHub<E: Clone + Send> {
    subscriptions: SubscriptionStore<E>,
}

impl<E: Clone + Send> EventHub<E> {
    pub fn setup() -> (Self, EventSender<E>) {
        let subscriptions = Arc::new(Mutex::new(vec![]));
        (
            Self {
                subscriptions: subscriptions.clone(),
            },
            EventSender { subscriptions },
        )
    }

    pub async fn subscribe<F: Fn(&E) -> bool + Send + Sync + 'static>(
        &mut self,
        filter: F,
    ) -> EventSubscription<E> {
        let (sender, receiver) = unbounded_channel();
        let mut subscriptions = self.subscriptions.lock().await;
        subscriptions.push((Box::new(filter), sender));
        EventSubscription(receiver)
    }
}
