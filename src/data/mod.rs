pub mod slug;
pub mod types;
