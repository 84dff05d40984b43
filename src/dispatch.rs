//! Command dispatch tables.
//!
//! A [`DispatchTable`] maps a command name to a handler. The same structure
//! backs the client's filter registry (unsolicited pushes, keyed by command)
//! and the worker's command registry (inbound requests): dispatch is a
//! lookup-and-invoke, never dynamic dispatch through inheritance.

use std::collections::HashMap;

/// Map from command name to a handler of type `H`.
#[derive(Default)]
pub struct DispatchTable<H> {
    entries: HashMap<String, H>,
}

impl<H> DispatchTable<H> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registers a handler for `command`, replacing and returning any prior
    /// handler registered under the same name.
    pub fn attach(&mut self, command: impl Into<String>, handler: H) -> Option<H> {
        self.entries.insert(command.into(), handler)
    }

    /// Looks up the handler for `command`.
    pub fn get_mut(&mut self, command: &str) -> Option<&mut H> {
        self.entries.get_mut(command)
    }

    /// Returns true if a handler is registered for `command`.
    #[must_use]
    pub fn contains(&self, command: &str) -> bool {
        self.entries.contains_key(command)
    }

    /// Returns the number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_and_lookup() {
        let mut table: DispatchTable<u32> = DispatchTable::new();
        assert!(table.is_empty());

        assert!(table.attach("echo", 1).is_none());
        assert!(table.contains("echo"));
        assert!(!table.contains("fetch"));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get_mut("echo"), Some(&mut 1));
        assert_eq!(table.get_mut("fetch"), None);
    }

    #[test]
    fn attach_replaces_prior_handler() {
        let mut table: DispatchTable<u32> = DispatchTable::new();
        table.attach("echo", 1);

        assert_eq!(table.attach("echo", 2), Some(1));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get_mut("echo"), Some(&mut 2));
    }

    #[test]
    fn dispatch_invokes_handler() {
        let mut table: DispatchTable<Box<dyn FnMut() -> u32>> = DispatchTable::new();
        let mut calls = 0;
        table.attach("tick", Box::new(move || {
            calls += 1;
            calls
        }));

        let handler = table.get_mut("tick").unwrap();
        assert_eq!(handler(), 1);
        assert_eq!(handler(), 2);
    }
}
