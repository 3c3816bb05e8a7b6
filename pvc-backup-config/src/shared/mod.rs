mod auth;
mod backup;
mod base;
mod batch;
mod destination;
mod discovery;
mod helper;
mod retry;
mod transfer;

pub use auth::*;
pub use backup::*;
pub use base::*;
pub use batch::*;
pub use destination::*;
pub use discovery::*;
pub use helper::*;
pub use retry::*;
pub use transfer::*;
