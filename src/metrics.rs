//! Client metrics.
//!
//! Counters for request and connection lifecycle events, exposed through
//! the metriken registry for scraping by the host process.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "fanline/requests/submitted",
    description = "Total requests submitted"
)]
pub static REQUESTS_SUBMITTED: Counter = Counter::new();

#[metric(
    name = "fanline/requests/completed",
    description = "Requests completed with a parsed response"
)]
pub static RESPONSES_COMPLETED: Counter = Counter::new();

#[metric(
    name = "fanline/connections/opened",
    description = "Outbound TCP connects initiated"
)]
pub static CONNECTIONS_OPENED: Counter = Counter::new();

#[metric(
    name = "fanline/connections/reused",
    description = "Attempts served from the socket cache"
)]
pub static CONNECTIONS_REUSED: Counter = Counter::new();

#[metric(
    name = "fanline/connections/cached",
    description = "Sockets returned to the cache on keep-alive completion"
)]
pub static CONNECTIONS_CACHED: Counter = Counter::new();

#[metric(
    name = "fanline/connections/active",
    description = "Connections not yet completed"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "fanline/attempts/retried", description = "Retry attempts started")]
pub static RETRIES: Counter = Counter::new();

#[metric(name = "fanline/errors/recorded", description = "Errors appended to timelines")]
pub static ERRORS_RECORDED: Counter = Counter::new();

#[metric(name = "fanline/errors/timeouts", description = "Deadline expirations")]
pub static TIMEOUTS: Counter = Counter::new();

#[metric(name = "fanline/bytes/sent", description = "Request bytes written")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(name = "fanline/bytes/received", description = "Response bytes read")]
pub static BYTES_RECEIVED: Counter = Counter::new();
