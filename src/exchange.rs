//! The request/response pair handed to handlers.
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::request::Request;
use crate::response::Response;

/// Per-request scratch state.
///
/// A string-keyed map of arbitrary values shared along the middleware
/// chain. The router publishes its regex captures here (`"match"` and
/// `"matches"`); middleware typically stashes decoded payloads
/// (`"requestObject"`, `"authUsername"`, …) for downstream handlers.
#[derive(Default)]
pub struct State {
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl State {
    /// Stores a value under `key`, replacing any previous value.
    pub fn insert<T>(&mut self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.values.insert(key.into(), Box::new(value));
    }

    /// Borrows the value under `key` when it has type `T`.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|value| value.downcast_ref())
    }

    /// Mutably borrows the value under `key` when it has type `T`.
    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.values.get_mut(key).and_then(|value| value.downcast_mut())
    }

    /// Removes the value under `key`, returning it when it has type `T`.
    pub fn remove<T: Any>(&mut self, key: &str) -> Option<T> {
        let value = self.values.remove(key)?;
        value.downcast().ok().map(|boxed| *boxed)
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

/// A parsed request, its response under construction, and the scratch
/// state shared along the handler chain.
///
/// The exchange is owned by exactly one stage at a time: the parser while
/// parsing, the handler during dispatch, the connection while the response
/// is serialized. Handlers that keep side effects alive past their future
/// (timers, background work) must consult [`is_finished`](Exchange::is_finished)
/// before acting on earlier state: once it reports `true` the connection
/// has abandoned this exchange and nothing written to it can reach the
/// wire.
#[derive(Debug)]
pub struct Exchange {
    /// The parsed request.
    pub request: Request,
    /// The response under construction.
    pub response: Response,
    /// Scratch state shared along the handler chain.
    pub state: State,
    finished: Arc<AtomicBool>,
}

impl Exchange {
    pub(crate) fn new(request: Request, response: Response, finished: Arc<AtomicBool>) -> Exchange {
        Exchange {
            request,
            response,
            state: State::default(),
            finished,
        }
    }

    /// Whether the connection has abandoned this exchange (timeout or
    /// disconnect). Late handler completions after this point are no-ops.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub(crate) fn finished_flag(&self) -> Arc<AtomicBool> {
        self.finished.clone()
    }

    pub(crate) fn into_parts(self) -> (Request, Response, State) {
        (self.request, self.response, self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::State;

    #[test]
    fn stores_and_recalls_typed_values() {
        let mut state = State::default();
        state.insert("authUsername", "admin".to_owned());
        state.insert("attempts", 3usize);

        assert_eq!(state.get::<String>("authUsername").map(String::as_str), Some("admin"));
        assert_eq!(state.get::<usize>("attempts"), Some(&3));
        assert!(state.get::<usize>("authUsername").is_none());
        assert!(!state.contains("missing"));
    }

    #[test]
    fn removes_values() {
        let mut state = State::default();
        state.insert("matches", vec!["42".to_owned()]);
        let matches: Option<Vec<String>> = state.remove("matches");
        assert_eq!(matches, Some(vec!["42".to_owned()]));
        assert!(!state.contains("matches"));
    }
}
