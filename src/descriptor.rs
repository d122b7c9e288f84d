//! The unit of cacheable work.
//!
//! A [`QueryDescriptor`] borrows the caller's arguments for one data-access
//! call. Each operation kind keeps its options in its own slot, so option
//! lookup never depends on argument position.

use crate::options::{FindOptions, RawQueryOptions};
use std::fmt;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregateFn {
    Min,
    Max,
    Sum,
}

impl AggregateFn {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFn::Min => "min",
            AggregateFn::Max => "max",
            AggregateFn::Sum => "sum",
        }
    }
}

impl fmt::Display for AggregateFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The operation a descriptor invokes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    FindOne,
    FindAll,
    Aggregate(AggregateFn),
    Count,
    Query,
}

impl Method {
    /// Name used as the method segment of a cache key.
    pub fn name(&self) -> &'static str {
        match self {
            Method::FindOne => "findOne",
            Method::FindAll => "findAll",
            Method::Aggregate(f) => f.as_str(),
            Method::Count => "count",
            Method::Query => "query",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One data-access call with its original arguments.
#[derive(Clone, Copy, Debug)]
pub enum QueryDescriptor<'a> {
    FindOne {
        model: &'a str,
        options: &'a FindOptions,
    },
    FindAll {
        model: &'a str,
        options: &'a FindOptions,
    },
    Aggregate {
        model: &'a str,
        function: AggregateFn,
        column: &'a str,
        options: &'a FindOptions,
    },
    Count {
        model: &'a str,
        options: &'a FindOptions,
    },
    Query {
        sql: &'a str,
        options: &'a RawQueryOptions,
    },
}

impl<'a> QueryDescriptor<'a> {
    pub fn method(&self) -> Method {
        match self {
            QueryDescriptor::FindOne { .. } => Method::FindOne,
            QueryDescriptor::FindAll { .. } => Method::FindAll,
            QueryDescriptor::Aggregate { function, .. } => Method::Aggregate(*function),
            QueryDescriptor::Count { .. } => Method::Count,
            QueryDescriptor::Query { .. } => Method::Query,
        }
    }

    /// Model the call is scoped to. Free-form queries name one only through
    /// their options.
    pub fn model(&self) -> Option<&'a str> {
        match *self {
            QueryDescriptor::FindOne { model, .. }
            | QueryDescriptor::FindAll { model, .. }
            | QueryDescriptor::Aggregate { model, .. }
            | QueryDescriptor::Count { model, .. } => Some(model),
            QueryDescriptor::Query { options, .. } => options.model.as_deref(),
        }
    }

    pub fn find_options(&self) -> Option<&'a FindOptions> {
        match *self {
            QueryDescriptor::FindOne { options, .. }
            | QueryDescriptor::FindAll { options, .. }
            | QueryDescriptor::Aggregate { options, .. }
            | QueryDescriptor::Count { options, .. } => Some(options),
            QueryDescriptor::Query { .. } => None,
        }
    }

    pub fn cache_enabled(&self) -> bool {
        match self {
            QueryDescriptor::Query { options, .. } => options.cache,
            _ => self.find_options().is_some_and(|o| o.cache),
        }
    }

    pub fn raw(&self) -> bool {
        match self {
            QueryDescriptor::Query { options, .. } => options.raw,
            _ => self.find_options().is_some_and(|o| o.raw),
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        match self {
            QueryDescriptor::Query { options, .. } => options.ttl(),
            _ => self.find_options().and_then(FindOptions::ttl),
        }
    }
}
