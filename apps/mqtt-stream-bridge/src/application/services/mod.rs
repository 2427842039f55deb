//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `TopicSubscriptionRegistry`: one broker subscription per topic, fan-out
//!   to listening sessions
//! - `WindowAggregator`: optional time-window batching of a session queue
//! - `StreamSession`: one consumer's stream from registration to teardown
//! - `Datasource`: query, health and stream handling for the host

mod datasource;
mod registry;
mod session;
mod window;

pub use datasource::{
    DataQuery, DataResponse, Datasource, HEALTHY_MESSAGE, HealthCheckResult, HealthStatus,
    QueryDataRequest, QueryDataResponse, QueryError, QueryModel, ResponseStatus, StreamError,
    SubscribeStreamStatus,
};
pub use registry::{
    DeliveryCallback, DeliveryError, RegistryError, RegistryStats, TopicSubscriptionRegistry,
};
pub use session::{
    DEFAULT_QUEUE_CAPACITY, SessionError, SessionState, SessionSummary, StreamSession,
};
pub use window::WindowAggregator;
