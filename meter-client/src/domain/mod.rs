pub mod anchor;
pub mod sample;
pub mod settings;

pub use anchor::{Anchor, NotificationState};
pub use sample::Sample;
pub use settings::{NotifySettings, Settings};
