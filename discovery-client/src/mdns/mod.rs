pub mod browser;

pub use browser::{AnnouncementSink, ServiceBrowser};
