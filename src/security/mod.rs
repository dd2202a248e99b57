//! Command safety checks and the tamper-evident audit trail.

pub mod audit;
pub mod patterns;
pub mod validator;

pub use audit::{AuditAction, AuditLogger, AuditRecord};
pub use validator::{Blocked, CommandValidator, DenyCategory, ValidationResult};
