// Scheduler module: timer lifecycle and dual-context runs

pub mod engine;

pub use engine::{
    DualContextOutcome, Scheduler, SchedulerConfig, SchedulerService, SchedulerState,
    DUAL_CONTEXT_TIMER, SYSTEM_OPERATIONS_TIMER, USER_OPERATIONS_TIMER,
};
