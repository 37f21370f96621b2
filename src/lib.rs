pub mod blocking;
pub mod config;
pub mod logging;
pub mod media;
pub mod model;
pub mod presence;
pub mod projector;
pub mod receipts;
pub mod reconciler;
pub mod session;
pub mod storage;
pub mod store;
pub mod typing;
