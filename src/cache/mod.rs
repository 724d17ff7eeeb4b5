//! Local cache of watched objects
//!
//! A [`Reflector`] mirrors one resource kind into a [`Store`] and publishes
//! every change it applies. Workers read from the store instead of the API.

mod reflector;
mod store;

pub use reflector::Reflector;
pub use store::{store, Notification, Store, Writer};
