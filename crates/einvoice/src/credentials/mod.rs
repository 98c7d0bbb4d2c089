//! Merchant OAuth credential handling: encrypted-at-rest storage seam,
//! keyed token cache with explicit eviction, and single-flight refresh.

pub mod domain;
pub mod store;

pub use domain::{
    Merchant, MerchantId, MerchantRepository, RegistrationStatus, Secret, TokenSet,
};
pub use store::{CredentialError, CredentialStore};
