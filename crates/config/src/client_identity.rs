//! Runtime client identity type.
//!
//! This type represents the extracted caller identity at runtime, as
//! opposed to the configuration types that specify how to extract it.

/// Represents the identified caller and their role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// The caller's stable identifier (e.g., user ID, API key ID)
    pub client_id: String,
    /// The caller's role (e.g., "admin", "staff", "guest")
    pub role: Option<String>,
}
