//! Test support shared by unit and integration tests.
//!
//! Provides Ethernet frame builders and an in-memory NIC driver.

pub mod frames;
pub mod mock_nic;

pub use mock_nic::MockNic;
