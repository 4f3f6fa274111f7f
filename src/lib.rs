//! Asynchronous client engine for Exchange-style extended WebDAV.
//!
//! This library talks to groupware servers that expose mail, calendar, and
//! directory data over an HTTP-based extended-WebDAV protocol: typed
//! property queries (PROPFIND/BPROPFIND), structured SQL searches with
//! range paging, bulk verbs (BDELETE/BMOVE/BCOPY/BPROPPATCH), and
//! UDP-callback change notifications (SUBSCRIBE/POLL). Built on hyper 1.x,
//! rustls, and tokio.
//!
//! # Features
//!
//! - HTTP/2 multiplexing and connection pooling
//! - Automatic response decompression (br/zstd/gzip)
//! - Typed property decoding from multistatus bodies (`dt:dt` attributes)
//! - Structured query trees compiled to the server's WHERE syntax
//! - Exact-match query caching with coarse write invalidation
//! - Basic and forms-based authentication with automatic session recovery
//! - Lease-renewing change subscriptions with coalesced polling
//!
//! # Examples
//!
//! ## Searching a folder
//!
//! ```no_run
//! use exdav::{Connection, Relop, Restriction, SearchScope};
//!
//! #[tokio::main]
//! async fn main() -> exdav::Result<()> {
//!     let conn = Connection::new("https://mail.example.com/exchange/user/")?
//!         .with_credentials(exdav::AuthMode::Basic, "user", "secret")?;
//!
//!     let filter = Restriction::and(vec![
//!         Restriction::prop_bool("DAV:isfolder", Relop::Eq, false),
//!         Restriction::prop_string(
//!             "DAV:contentclass",
//!             Relop::Eq,
//!             "urn:content-classes:appointment",
//!         ),
//!     ]);
//!     let results = conn
//!         .search(
//!             "Calendar/",
//!             SearchScope::Shallow,
//!             &["DAV:displayname".to_string()],
//!             Some(&filter),
//!             &[],
//!             false,
//!         )
//!         .await?;
//!     for item in &results {
//!         println!("{} -> {}", item.href, item.status);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Watching a folder for changes
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use exdav::{ChangeType, Connection};
//!
//! #[tokio::main]
//! async fn main() -> exdav::Result<()> {
//!     let conn = Arc::new(Connection::new("https://mail.example.com/exchange/user/")?);
//!     conn.subscribe(
//!         "Inbox/",
//!         ChangeType::NewMember,
//!         Duration::from_secs(30),
//!         Arc::new(|href, change| println!("{:?} on {}", change, href)),
//!     )
//!     .await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod common;
pub mod dav;
pub mod error;
pub mod notify;
pub mod restriction;

pub use cache::QueryCache;
pub use dav::{
    AuthMode, Connection, CredentialStore, Credentials, DavResult, Depth, HyperTransport, OrderBy,
    PropValue, PropertyBag, SearchDirection, SearchScope, Transport,
};
pub use error::{AuthFailure, Error, Result};
pub use notify::{ChangeCallback, ChangeType, SubscriptionState};
pub use restriction::{BitmaskTest, Fuzzy, Relop, Restriction};
