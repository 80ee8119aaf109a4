pub mod event;
pub mod signature;
pub mod vault;

pub use event::{DeliveryJob, EventError, WebhookEvent, WebhookPayload};
pub use signature::{compute_signature, format_signature_header, verify_signature};
pub use vault::{Vault, VaultError};
