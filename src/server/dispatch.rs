//! Per-command dispatch registries.
//!
//! Callbacks are one-shot: the first frame for their command fires every
//! callback registered for it and empties the whole bucket. Handlers stay
//! registered until removed and fire on every matching frame.

use std::collections::HashMap;
use std::sync::Arc;

use crate::task::registry::ClientId;
use crate::transport::protocol::{Command, PayloadReader};

pub type Callback = Box<dyn FnOnce(ClientId, &mut PayloadReader<'_>) + Send>;
pub type Handler = Arc<dyn Fn(ClientId, &mut PayloadReader<'_>) + Send + Sync>;

/// Returned by `add_callback`; pass to `remove_callback`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle(u64);

/// Returned by `add_handler`; pass to `remove_handler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerHandle(u64);

#[derive(Default)]
pub(super) struct Registries {
    next_handle: u64,
    callbacks: HashMap<Command, Vec<(CallbackHandle, Callback)>>,
    handlers: HashMap<Command, Vec<(HandlerHandle, Handler)>>,
}

impl Registries {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    pub(super) fn add_callback(&mut self, command: Command, callback: Callback) -> CallbackHandle {
        let handle = CallbackHandle(self.next_handle());
        self.callbacks.entry(command).or_default().push((handle, callback));
        handle
    }

    pub(super) fn remove_callback(&mut self, handle: CallbackHandle) -> bool {
        self.callbacks.values_mut().any(|bucket| {
            let before = bucket.len();
            bucket.retain(|(h, _)| *h != handle);
            bucket.len() != before
        })
    }

    pub(super) fn add_handler(&mut self, command: Command, handler: Handler) -> HandlerHandle {
        let handle = HandlerHandle(self.next_handle());
        self.handlers.entry(command).or_default().push((handle, handler));
        handle
    }

    pub(super) fn remove_handler(&mut self, handle: HandlerHandle) -> bool {
        self.handlers.values_mut().any(|bucket| {
            let before = bucket.len();
            bucket.retain(|(h, _)| *h != handle);
            bucket.len() != before
        })
    }

    /// Empty the callback bucket for `command`, returning what it held.
    pub(super) fn take_callbacks(&mut self, command: Command) -> Vec<Callback> {
        self.callbacks
            .remove(&command)
            .unwrap_or_default()
            .into_iter()
            .map(|(_, callback)| callback)
            .collect()
    }

    pub(super) fn handlers(&self, command: Command) -> Vec<Handler> {
        self.handlers
            .get(&command)
            .map(|bucket| bucket.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback(counter: &Arc<AtomicUsize>) -> Callback {
        let counter = counter.clone();
        Box::new(move |_: ClientId, _: &mut PayloadReader<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn taking_callbacks_clears_the_bucket() {
        let mut registries = Registries::default();
        let fired = Arc::new(AtomicUsize::new(0));
        registries.add_callback(Command::Log, counting_callback(&fired));
        registries.add_callback(Command::Log, counting_callback(&fired));
        registries.add_callback(Command::Result, counting_callback(&fired));

        let taken = registries.take_callbacks(Command::Log);
        assert_eq!(taken.len(), 2);
        assert!(registries.take_callbacks(Command::Log).is_empty());
        assert_eq!(registries.take_callbacks(Command::Result).len(), 1);
    }

    #[test]
    fn removal_by_handle() {
        let mut registries = Registries::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let first = registries.add_callback(Command::Status, counting_callback(&fired));
        registries.add_callback(Command::Status, counting_callback(&fired));

        assert!(registries.remove_callback(first));
        assert!(!registries.remove_callback(first));
        assert_eq!(registries.take_callbacks(Command::Status).len(), 1);

        let handler: Handler = Arc::new(|_: ClientId, _: &mut PayloadReader<'_>| {});
        let handle = registries.add_handler(Command::Run, handler);
        assert_eq!(registries.handlers(Command::Run).len(), 1);
        assert!(registries.remove_handler(handle));
        assert!(registries.handlers(Command::Run).is_empty());
    }

    #[test]
    fn handles_are_distinct_across_kinds() {
        let mut registries = Registries::default();
        let callback = registries.add_callback(Command::Run, Box::new(|_: ClientId, _: &mut PayloadReader<'_>| {}));
        let handler = registries.add_handler(Command::Run, Arc::new(|_: ClientId, _: &mut PayloadReader<'_>| {}));
        assert_ne!(callback.0, handler.0);
    }
}
