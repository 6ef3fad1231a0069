//! Invocation envelope
//!
//! Captures a callable together with its arguments as a one-shot thunk that
//! any backend can run and turn into an [`Outcome`].

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::types::Outcome;

type Thunk<T, E> = Box<dyn FnOnce() -> Result<T, E> + Send + 'static>;

/// A callable bound to its arguments, ready to execute exactly once
pub struct Invocation<T, E> {
    name: Arc<str>,
    thunk: Thunk<T, E>,
}

impl<T, E> Invocation<T, E> {
    /// Create an invocation from a zero-argument thunk
    pub fn new<F>(name: impl Into<Arc<str>>, thunk: F) -> Self
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        Self {
            name: name.into(),
            thunk: Box::new(thunk),
        }
    }

    /// Bind a shared callable to its arguments
    ///
    /// Positional and keyword arguments travel together as the single owned
    /// value `args` (a tuple or a struct).
    pub fn bind<F, A>(name: impl Into<Arc<str>>, func: Arc<F>, args: A) -> Self
    where
        F: Fn(A) -> Result<T, E> + Send + Sync + 'static,
        A: Send + 'static,
    {
        Self::new(name, move || func(args))
    }

    /// Identifying name of the callable
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute the callable, returning exactly what it returns
    ///
    /// Panics propagate unchanged.
    pub fn run(self) -> Result<T, E> {
        (self.thunk)()
    }

    /// Execute the callable and report how it ended
    ///
    /// A panic is captured as [`Outcome::Panicked`] so the adapter can resume it
    /// on the caller's side.
    pub fn run_catching(self) -> Outcome<T, E> {
        let thunk = self.thunk;
        match panic::catch_unwind(AssertUnwindSafe(thunk)) {
            Ok(result) => Outcome::from_result(result),
            Err(payload) => Outcome::Panicked(payload),
        }
    }
}

impl<T, E> fmt::Debug for Invocation<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Extract a readable message from a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "callable panicked with a non-string payload".to_string()
    }
}

/// Resolve the identifying name of a callable from its type
///
/// Function items resolve to their own name, methods to `Type::method`, and
/// closures to the item they were written in. Returns `None` for types that
/// carry no path, such as function pointers and trait objects.
pub fn resolve_name<F: ?Sized>() -> Option<String> {
    resolve_type_name(std::any::type_name::<F>())
}

fn resolve_type_name(type_name: &str) -> Option<String> {
    if type_name.starts_with("fn(")
        || type_name.starts_with("dyn ")
        || type_name.starts_with('&')
        || type_name.starts_with('<')
    {
        return None;
    }

    let mut segments = split_path(type_name);
    while segments.last() == Some(&"{{closure}}") {
        segments.pop();
    }

    let last = strip_generics(segments.pop()?);
    if last.is_empty() || !is_identifier(last) {
        return None;
    }

    match segments.pop().map(strip_generics) {
        Some(parent) if parent.starts_with(|c: char| c.is_ascii_uppercase()) => {
            Some(format!("{parent}::{last}"))
        }
        _ => Some(last.to_string()),
    }
}

/// Split a type path on `::`, ignoring separators nested in generic arguments
fn split_path(path: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let bytes = path.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'<' => depth += 1,
            b'>' => depth = depth.saturating_sub(1),
            b':' if depth == 0 && bytes.get(i + 1) == Some(&b':') => {
                segments.push(&path[start..i]);
                start = i + 2;
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }
    segments.push(&path[start..]);
    segments
}

fn strip_generics(segment: &str) -> &str {
    segment.split('<').next().unwrap_or(segment)
}

fn is_identifier(segment: &str) -> bool {
    segment.chars().all(|c| c.is_alphanumeric() || c == '_')
}
