//! Local stores: Message Store (Postgres-shaped metadata), Body Store
//! (MongoDB-shaped), and the Sync State Store (Postgres rows + coordination
//! primitives from `crate::coordination`).

pub mod body_store;
pub mod message_store;
pub mod sync_state;

pub use body_store::BodyStore;
pub use message_store::MessageStore;
pub use sync_state::SyncStateStore;
