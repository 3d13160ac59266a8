//! Live-cluster convergence suites
//!
//! - `lifecycle`: waits for the fleet to come up, runs every validator, then
//!   scales the last provisioning group to zero and deletes the run's groups
//! - `validation`: validators only, for re-checking an already converged fleet
//!   without mutating it

mod helpers;
mod lifecycle;
mod validation;
