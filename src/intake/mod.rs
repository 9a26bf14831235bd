//! Archive intake: unpack measurement archives and keep the captures made from cellular
//! clients.
pub mod archive;
pub mod pipeline;
