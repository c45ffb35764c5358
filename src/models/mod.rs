mod history;
mod job;
mod object;
mod transition;
mod user;

pub use history::{Attachment, TransitionsHistory};
pub use job::{
    ActionData, HistoryKwargs, JobParams, JobStatus, Lease, SharedParams, TransitionJob,
    TransitionJobAction, TransitionJobActionStatus,
};
pub use object::{AssetKind, BaseObject, ObjectId};
pub use transition::{
    DEFAULT_ASYNC_SERVICE_NAME, KEEP_ORIGINAL_STATUS, PermissionInfo, Target, Transition,
    TransitionId, TransitionModel, slugify,
};
pub use user::User;
