//! Downstream side of the hub: session management, MCP request routing, and
//! the axum HTTP surface (SSE and streamable HTTP).

pub mod app;
pub mod auth;
pub mod handlers;
pub mod router;
pub mod session;

pub use app::{Hub, HubState};
pub use auth::principal_from_segment;
pub use router::{handle_request, RequestContext};
pub use session::{Session, SessionManager, SessionTransport};
