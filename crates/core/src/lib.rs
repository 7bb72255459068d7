pub mod config;
pub mod embedder;
pub mod events;
pub mod formatter;
pub mod models;
pub mod queue;
pub mod similarity;
pub mod stores;
pub mod summarizer;

pub use models::{Idea, IdeaStatus, IdeaView, Topic};
