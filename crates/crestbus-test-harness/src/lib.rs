//! crestbus-test-harness: Mock bus ports for crestbus.
//!
//! This crate provides [`MockBus`] for deterministic unit testing of the bus
//! master and slave without RS-485 hardware. A [`MockBusHandle`] injects
//! inbound bursts, records written frames and control-line activity, and
//! answers pre-loaded requests automatically.

pub mod mock_bus;

pub use mock_bus::{MockBus, MockBusHandle};
