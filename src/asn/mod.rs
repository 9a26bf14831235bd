//! ASN reference data: the range index, the cellular carrier set and the resolvers that sit
//! in front of them.
pub mod cellular;
pub mod index;
pub mod lookup;

pub type Asn = u32;
