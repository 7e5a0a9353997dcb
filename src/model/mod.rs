//! Plain data types: keys, desired sets, identities and record properties.

pub mod key;
pub mod properties;

pub use key::*;
pub use properties::{HandlerRecord, Properties, PropertyValue};
