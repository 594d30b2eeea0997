//! Metadata-plane interface.
//!
//! The metadata service proper is an external collaborator.  The
//! [`store::MetadataStore`] trait defines the narrow contract the gateway
//! needs from it; [`memory::MemoryMetadataStore`] is the in-process
//! reference implementation.

pub mod memory;
pub mod store;
