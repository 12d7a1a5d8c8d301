pub mod app;
pub mod chat;
pub mod deploy;
pub mod image;
pub mod launch;
pub mod util;
pub mod verify;
