//! Payload transfer: the eager/bulk decision and the bulk path itself.

pub mod bulk;
pub mod policy;

pub use bulk::{BulkAccess, BulkHandle, BulkHandler, BulkRef, BulkRegistry, ExposedBuffer};
pub use policy::{TransferPath, TransferPolicy};
