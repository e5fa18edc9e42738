pub mod error;
pub mod login;
pub mod oidc;
pub mod refresh;
pub mod token_store;
pub mod validator;

pub use error::AuthError;
pub use login::{IdTokenFromCmd, IdTokenFromFile, IdTokenSource, LoginFlow};
pub use oidc::AuthRequest;
pub use refresh::ensure_fresh;
pub use token_store::{StoredTokens, TokenStore};
pub use validator::{roles_for_claims, AuthPermission, Validator};
