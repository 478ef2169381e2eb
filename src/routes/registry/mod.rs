mod access;
mod models;
mod usage;

// Glob re-exports so utoipa's `routes!()` macro can find the hidden `__path_*` structs
// alongside the handler functions at the `crate::routes::registry::*` path.
pub use access::*;
pub use models::*;
pub use usage::*;
