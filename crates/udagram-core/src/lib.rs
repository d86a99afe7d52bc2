pub mod connection;
pub mod errors;
pub mod events;
pub mod ids;
pub mod signing;
pub mod transport;

pub use connection::ConnectionRecord;
pub use errors::{DeliveryError, SignError};
pub use events::{ImageNotification, UploadEvent};
pub use ids::ConnectionId;
pub use signing::{PresignedUrlSigner, PublicUrlSigner, UrlSigner};
pub use transport::Transport;
