//! Active checks.
//!
//! Metrics whose collection the agent initiates on its own schedule. The
//! scheduler loop asks the [`MetricRegistry`] which metrics are due, runs each
//! through the [`RateLimitedFetcher`] and appends produced values to the
//! [`ResultBuffer`](crate::buffer::ResultBuffer).
//!
//! # Architecture
//!
//! - [`MetricKey`]: parsed `name[param,...]` check identifier
//! - [`MetricRegistry`]: configured metrics and their scheduling state
//! - [`MetricSource`]: pluggable capability that produces values for a key
//! - [`RateLimitedFetcher`]: per-second line throttling for log-like sources
//! - [`Scheduler`]: the control loop

mod fetcher;
mod key;
mod metric;
mod rate_limit;
mod registry;
mod scheduler;
mod sources;

pub use fetcher::{
    FetchError, FetchOutput, FetchRequest, Fetched, FetchedValue, MetricSource, RateLimitedFetcher,
};
pub use key::{KeyError, MetricKey};
pub use metric::{ActiveMetric, MetricSpec, MetricStatus, ValidatedSpec};
pub use rate_limit::LineWindow;
pub use registry::{DueMetric, MetricRegistry, SharedRegistry};
pub use scheduler::{MIN_TICK, Scheduler, TickReport};
pub use sources::BuiltinSource;
