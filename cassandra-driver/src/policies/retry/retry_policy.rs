//! Request retries configuration.\
//! The `Client` asks a `RetryPolicy` what to do whenever the server answers a
//! request with an error. Transport failures, timeouts and client side errors
//! are never retried.

use crate::errors::QueryError;
use cassandra_cql::Consistency;

/// Information about a failed request
pub struct RequestInfo<'a> {
    /// The server error the request failed with
    pub error: &'a QueryError,
    /// A request is idempotent if it can be applied multiple times without changing the result of the initial application\
    /// If set to `true` we can be sure that it is idempotent\
    /// If set to `false` it is unknown whether it is idempotent
    pub is_idempotent: bool,
    /// Consistency with which the request failed
    pub consistency: Consistency,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    RetrySameConnection(Option<Consistency>), // None means that the same consistency should be used as before
    RetryNextConnection(Option<Consistency>), // ditto
    DontRetry,
}

/// Specifies a policy used to decide when to retry a request
pub trait RetryPolicy: std::fmt::Debug + Send + Sync {
    /// Called for each new request, starts a session of deciding about retries
    fn new_session(&self) -> Box<dyn RetrySession>;
}

/// Used throughout a single request to decide when to retry it
pub trait RetrySession: Send + Sync {
    /// Called after the request failed - decide what to do next
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision;
}
