//! Azure Resource Manager access.

pub mod client;
pub mod operation;

pub use client::{Execution, ManagementClient, ManagementRequest, combine_query};
pub use operation::{
    AsyncOperation, AsyncOperationError, AsyncOperationPoller, AsyncOperationResponse,
    OperationStatus, PollMode,
};
