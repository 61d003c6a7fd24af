pub mod feature;
pub mod request;
pub mod result;

pub use feature::{Feature, Geometry, NAMESPACE_KEY, Namespace, Position, Properties};
pub use request::{ModificationFlags, ModificationRequest, Space};
pub use result::{FailureMessage, ModificationFailure, ModificationResult};
