//! Hit/miss state of cached calls.

use crate::config::StatusScope;
use dashmap::DashMap;

/// Whether a call was served from the cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheStatus {
    /// The call did not opt in, or was not eligible for caching.
    #[default]
    NotApplicable,
    Miss,
    Hit,
}

impl CacheStatus {
    /// `None` when not applicable, otherwise whether the cache answered.
    pub fn was_hit(&self) -> Option<bool> {
        match self {
            CacheStatus::NotApplicable => None,
            CacheStatus::Miss => Some(false),
            CacheStatus::Hit => Some(true),
        }
    }
}

/// A call's result together with its own hit/miss state.
#[derive(Clone, Debug, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    pub status: CacheStatus,
}

impl<T> Cached<T> {
    pub fn hit(value: T) -> Self {
        Cached {
            value,
            status: CacheStatus::Hit,
        }
    }

    pub fn miss(value: T) -> Self {
        Cached {
            value,
            status: CacheStatus::Miss,
        }
    }

    pub fn not_applicable(value: T) -> Self {
        Cached {
            value,
            status: CacheStatus::NotApplicable,
        }
    }

    pub fn into_inner(self) -> T {
        self.value
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Cached<U> {
        Cached {
            value: f(self.value),
            status: self.status,
        }
    }
}

const CONNECTION_SLOT: &str = "";

/// Last-call flags, one slot per model or one for the whole connection.
///
/// Overwritten on every call; not isolated between concurrent callers.
#[derive(Debug, Default)]
pub struct StatusTracker {
    scope: StatusScope,
    slots: DashMap<String, CacheStatus>,
}

impl StatusTracker {
    pub fn new(scope: StatusScope) -> Self {
        StatusTracker {
            scope,
            slots: DashMap::new(),
        }
    }

    pub fn record(&self, model: Option<&str>, status: CacheStatus) {
        self.slots.insert(self.slot(model).to_string(), status);
    }

    /// Flag of the last call on `model`'s slot. Unset slots read as not applicable.
    pub fn last(&self, model: &str) -> CacheStatus {
        self.read(Some(model))
    }

    /// Flag of the last call on the connection slot.
    pub fn last_connection(&self) -> CacheStatus {
        self.read(None)
    }

    fn read(&self, model: Option<&str>) -> CacheStatus {
        self.slots
            .get(self.slot(model))
            .map(|s| *s)
            .unwrap_or_default()
    }

    fn slot<'a>(&self, model: Option<&'a str>) -> &'a str {
        match (self.scope, model) {
            (StatusScope::PerModel, Some(model)) => model,
            _ => CONNECTION_SLOT,
        }
    }
}
