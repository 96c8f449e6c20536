pub mod attachment;
pub mod error;
pub mod message;
pub mod scope;
pub mod subject;
pub mod task;

pub use attachment::{reconcile_attachments, Attachment, AttachmentsUpdate};
pub use error::CoreError;
pub use message::TaskEventMsg;
pub use scope::Scope;
pub use subject::NotificationKind;
pub use task::Task;
