//! Register store
//!
//! Typed, address-ranged registers backed by data providers, grouped into
//! subregistries and exposed to the protocol through a [`Registry`].

mod converter;
mod data_provider;
mod register;
mod registry;
mod value;

pub use converter::Converter;
pub use data_provider::{CallbackProvider, DataProvider, HoldingProvider, Observer, ReportPolicy};
pub use register::Register;
pub use registry::{Registry, Subregistry};
pub use value::{FixedString, RegisterValue};
