//! Guards surrounding external calls and tenant workloads.
//!
//! - **Circuit breakers**: per-destination-host breaker with
//!   closed/half-open/open states, failing fast while a target is down
//! - **Quota guard**: enqueue-time enforcement of workspace plan limits
//! - **Credentials**: reference types and the resolver seam; credential
//!   values never travel through workflow data or expression scope

pub mod breaker;
pub mod credential;
pub mod error;
pub mod quota;

pub use breaker::{BreakerConfig, BreakerManager, CircuitState};
pub use credential::{CredentialResolver, CredentialValue, InMemoryCredentials, redact};
pub use error::{BreakerError, CredentialError, QuotaError};
pub use quota::{InMemoryUsage, PlanLimits, QuotaGuard, UsageSource};
