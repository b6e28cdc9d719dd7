//! Security Module
//!
//! Tenant isolation, row-level security, field encryption and masking. Each
//! piece is configured independently and has no storage dependency.

pub mod encryption;
pub mod masking;
pub mod rls;
pub mod tenancy;

pub use encryption::FieldEncryption;
pub use masking::{DataMasking, MaskKind};
pub use rls::{Access, ContextValue, Policy, PolicyScope, Predicate, RowLevelSecurity, ARCHIVE_AGE_DAYS, ARCHIVIST_ROLE};
pub use tenancy::{IsolationLevel, TenantConfig, TenantEnforcer, TenantQuotaManager, TenantRegistry, TENANT_FIELD};
