pub mod attachments;
pub mod broker;
pub mod credentials;
pub mod db;
pub mod events;
pub mod fetchers;
pub mod sync;
