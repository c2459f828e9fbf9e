// src/reconcile/mod.rs
//! Reconciliation loop: autoscaling, retirement and dangling detection

pub mod autoscale;
pub mod planner;
pub mod reconciler;

pub use autoscale::RejectionTracker;
pub use planner::{plan_retirements, CurrentAction, Retirement, RetirementReason};
pub use reconciler::{Reconciler, ScaleDecision};
