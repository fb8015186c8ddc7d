//! Contains the data models for API requests and responses.

use crate::job::JobSnapshot;
use crate::model::MachineStatus;
use serde::{Deserialize, Serialize};

/// A request to execute one code on the HTTP channel.
#[derive(Deserialize)]
pub struct GcodeCommandRequest {
    pub code: String,
}

/// Job and machine state at a glance.
#[derive(Serialize)]
pub struct StatusResponse {
    pub status: MachineStatus,
    pub name: String,
    pub job: JobSnapshot,
}
