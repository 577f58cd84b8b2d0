pub mod canonical;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod retry;
pub mod trust;

// Re-export core types
pub use crypto::{AgentSigner, verify_envelope};
pub use envelope::{PayloadKind, Severity, schema_check, SUPPORTED_VERSION};
pub use error::{CryptoError, EnvelopeError, TrustError};
pub use retry::RetryPolicy;
pub use trust::{TrustMap, TrustMapHandle, TrustedAgent};
