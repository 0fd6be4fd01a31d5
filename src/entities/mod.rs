// Entity Models
// Books, requests and the reputation projection of members.
//
// Each entity has a stable UUID identity. Mutable state (book custody,
// request status, member balance) changes only through the lifecycle,
// allocation and ledger modules.

pub mod book;
pub mod member;
pub mod request;

pub use book::{Book, BookStatus};
pub use member::{Member, INITIAL_SUCCESS_SCORE};
pub use request::{BookRequest, RequestStatus};
