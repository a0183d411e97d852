use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::mpsc::Receiver,
};

use tracing::{debug, error};

use crate::event::BusEvent;

/// One queue, two item shapes: typed bus events for the user callback and
/// deferred closures that went through the timer wheel.
pub(crate) enum EventItem<M> {
    Fire(BusEvent<M>),
    Run(Box<dyn FnOnce() + Send>),
    Shutdown,
}

/// Drains the event queue in FIFO order. The user callback runs here and
/// only here; a panicking callback or closure is logged and the loop keeps
/// going.
pub(crate) fn run<M>(
    queue: Receiver<EventItem<M>>,
    mut on_event: Box<dyn FnMut(BusEvent<M>) + Send>,
) {
    while let Ok(item) = queue.recv() {
        match item {
            EventItem::Fire(event) => {
                if catch_unwind(AssertUnwindSafe(|| on_event(event))).is_err() {
                    error!("event callback panicked");
                }
            }
            EventItem::Run(callback) => {
                if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                    error!("scheduled callback panicked");
                }
            }
            EventItem::Shutdown => break,
        }
    }
    debug!("event loop exiting");
}
