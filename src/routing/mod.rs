//! Player placement: pending-request state and the route evaluator.

pub mod evaluator;
pub mod request;

pub use evaluator::{Placement, RouteEvaluator};
pub use request::PlayerRequestContext;
