//! SIP protocol value types.

pub mod address;
pub mod auth;
pub mod header;
pub mod method;
pub mod status;
pub mod uri;
pub mod via;

pub use address::Address;
pub use auth::{DigestChallenge, DigestCredentials};
pub use header::{CSeq, Header, HeaderName, HeaderValue};
pub use method::Method;
pub use status::StatusCode;
pub use uri::{Scheme, Uri};
pub use via::{BRANCH_MAGIC_COOKIE, Via, ViaTransport, generate_branch, generate_tag};
