//! IP address primitives shared by filters, managers and actions.
//!
//! [`IpAddress`] keeps the parsed family/address/prefix alongside the raw
//! input string, so identifiers that are not addresses at all (DNS names,
//! free-form failure ids) flow through the same type. Sets add subnet
//! containment and file-backed reloading; DNS helpers sit behind TTL caches.

mod addr;
mod cache;
mod dns;
mod set;

pub use addr::{Family, IpAddress};
pub use cache::TtlCache;
pub use dns::{DnsResolver, UseDns};
pub use set::{FileIpSet, IpAddrSet};
