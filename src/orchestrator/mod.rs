//! Application-level orchestration utilities.
//!
//! This module owns run lifecycle control (submit/cancel/settle, history refresh) and
//! post-run processing such as exports and output downloads. UI/CLI layers call into
//! this module to keep responsibilities separated.

mod controller;
mod post_process;

pub(crate) use controller::{run_controller, RunController, UiCommand};
pub(crate) use post_process::{
    build_record, default_export_name, export_json, process_run_completion,
};
