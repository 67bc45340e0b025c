//! The slice of authentication the core consumes.
//!
//! Real credential checking is a collaborator; the hub only needs a
//! [`Principal`] per request. Without a principal path segment the request
//! runs as the anonymous principal, which carries admin privilege by policy.

use manifold_hub::Principal;

/// Derive the effective principal from the optional leading URL segment.
pub fn principal_from_segment(segment: Option<&str>) -> Principal {
    match segment {
        Some(user) if !user.is_empty() => Principal::user(user),
        _ => Principal::anonymous(),
    }
}
