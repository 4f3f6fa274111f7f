pub mod auth;
pub mod client;
pub mod multistatus;
pub mod transport;
pub mod types;
pub mod xml;

pub use auth::{AuthMode, CredentialStore, Credentials};
pub use client::{Connection, effective_batch_size};
pub use multistatus::{all_successful, parse_multistatus, parse_status_line};
pub use transport::{HyperTransport, Transport};
pub use types::{DavResult, Depth, OrderBy, PropValue, PropertyBag, SearchDirection, SearchScope};
pub use xml::escape_xml;
