// State machine core for lifecycle orchestration.
//
// Validates and applies single state transitions against a lifecycle
// version's definition graph, producing a plan of CAS-guarded mutations and
// timer side effects that the storage layer commits atomically.

pub mod core;
pub mod graph;
pub mod guards;
pub mod states;

pub use core::{plan_start, plan_transition, TimerRequest, TransitionPlan, TransitionResult};
pub use graph::{LifecycleGraph, StateNode, TimerPolicy};
pub use states::InstanceStatus;
