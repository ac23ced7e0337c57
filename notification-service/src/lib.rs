pub mod api;
pub mod channels;
pub mod models;
pub mod router;
pub mod worker;

pub use channels::ChannelSender;
pub use models::{Channel, DeadLetter, Notification, DEAD_LETTER_QUEUE};
pub use router::NotificationRouter;
pub use worker::{ChannelWorker, WorkerOutcome};
