pub mod current_user;
pub mod password;
pub mod principal;
pub mod token;
pub mod users;

pub use current_user::CurrentUser;
pub use principal::{Principal, require_admin, require_self_or_admin};
pub use token::TokenSigner;
pub use users::{NewUser, User, UserUpdate, UsersStore};
