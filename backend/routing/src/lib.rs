pub mod resolve_route;
pub mod session_key;

pub use resolve_route::{RouteBinding, RouteResolver, RouteResult, RouteSource};
pub use session_key::{SessionKey, MAIN_SESSION_KEY};
