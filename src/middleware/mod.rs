// Middleware for bounded, resilient remote calls
//
// Provides the credential pool that caps concurrent analysis tasks and the
// circuit breaker in front of the remote vision API

pub mod circuit_breaker;
pub mod credential_pool;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitOpen, CircuitState};
pub use credential_pool::{Credential, CredentialLease, CredentialPool, CredentialStats, KeyHealth};
