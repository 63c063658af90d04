pub mod discovery;
pub mod link;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod protocol;
pub mod session;

pub use discovery::DiscoveryClient;
pub use link::{DeviceLink, WsLink};
pub use models::{ConversionOutcome, DeviceEndpoint, ImageAsset, UploadRequest};
pub use orchestrator::{UploadReport, UploadResult, Uploader};
pub use progress::{ProgressReporter, TransferStatus};
pub use session::{DeleteReport, SessionState, SessionTimeouts, TransferSession};
