//! Authentication and authorization.
//!
//! Users sign in at the identity provider. An SSO proxy in front of the suite completes that
//! flow and forwards the provider's user id and email as trusted headers. The API accepts
//! either:
//!
//! - a JWT session cookie issued by `POST /authentication/session` (checked first), or
//! - the proxy headers themselves, resolving or auto-creating the local user.
//!
//! Authorization is role based, see [`permissions`].
//!
//! # Modules
//!
//! - [`current_user`]: the [`CurrentUser`](crate::api::models::users::CurrentUser) extractor
//! - [`permissions`]: role matrix and the `RequiresPermission` extractor
//! - [`session`]: JWT issue/verify and cookie formatting
//!
//! # Usage in Handlers
//!
//! ```ignore
//! use suitectl::auth::permissions::{operation, resource, RequiresPermission};
//!
//! async fn balance(
//!     State(state): State<AppState>,
//!     perm: RequiresPermission<resource::Credits, operation::ReadOwn>,
//! ) -> Result<Json<BalanceResponse>> {
//!     let tenant_id = perm.tenant_id()?;
//!     // ...
//! }
//! ```

pub mod current_user;
pub mod permissions;
pub mod session;
