//! Rolling updates over a filtered container set

mod filter;
mod pipeline;
mod strategies;

pub use filter::UpdateFilter;
pub use pipeline::{ProcessedContainer, UpdatePipeline, UpdatePolicy, UpdateStage};
pub use strategies::{
    run_update, update_job_types, UpdateStrategy, JOB_UPDATE_START_THEN_STOP_EACH,
    JOB_UPDATE_STOP_THEN_START_ALL, JOB_UPDATE_STOP_THEN_START_EACH,
};
