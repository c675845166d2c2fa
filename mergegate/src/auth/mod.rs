//! Caller identity.
//!
//! Authentication happens upstream of this service. A trusted gateway forwards the authenticated
//! user's id in a header (`x-user-id` unless configured otherwise), and handlers receive it through
//! the [`CurrentUser`] extractor. Every stored record is scoped to that id.
//!
//! Webhook deliveries are not user requests; they authenticate with a signature instead, see
//! [`crate::queue::signature`].

pub mod current_user;

pub use current_user::CurrentUser;
