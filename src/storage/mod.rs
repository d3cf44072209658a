pub mod atomic;
pub mod identity_store;

pub use atomic::write_atomic;
pub use identity_store::{DeletedIdentity, IdPolicy, Identity, IdentityId, IdentityStore};
