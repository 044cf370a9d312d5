// src/connection/mod.rs
mod manager;
mod observer;
mod subscription;

pub use manager::{ConnectionManager, ConnectionState};
pub use observer::{
    ConnectCallback, DisconnectCallback, DisconnectInfo, DisconnectReason, Disposer,
};
pub use subscription::{
    MessageCallback, SubscriptionHandle, SubscriptionId, SubscriptionInfo, SubscriptionStatus,
};
