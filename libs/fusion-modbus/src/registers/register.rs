//! A single address-ranged register
//!
//! The typed provider is erased behind [`ErasedProvider`] so registers of different
//! value types can sit in one subregistry.

use super::converter::Converter;
use super::data_provider::DataProvider;
use super::value::RegisterValue;
use crate::error::ModbusResult;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Host-order byte view of a provider
trait ErasedProvider: Send + Sync {
    fn current(&self) -> Vec<u8>;
    fn read(&self) -> Vec<u8>;
    fn validate(&self, host: &[u8]) -> ModbusResult<()>;
    fn write(&self, host: &[u8]) -> ModbusResult<()>;
    fn take_report(&self) -> bool;
}

struct Typed<P: DataProvider> {
    provider: Arc<P>,
    _value: PhantomData<fn() -> P::Value>,
}

impl<P: DataProvider + 'static> ErasedProvider for Typed<P> {
    fn current(&self) -> Vec<u8> {
        self.provider.current().to_host_bytes()
    }

    fn read(&self) -> Vec<u8> {
        self.provider.on_read().to_host_bytes()
    }

    fn validate(&self, host: &[u8]) -> ModbusResult<()> {
        P::Value::from_host_bytes(host).map(|_| ())
    }

    fn write(&self, host: &[u8]) -> ModbusResult<()> {
        let value = P::Value::from_host_bytes(host)?;
        self.provider.on_write(value);
        Ok(())
    }

    fn take_report(&self) -> bool {
        self.provider.take_report()
    }
}

/// `{start, length, converter, provider}`
pub struct Register {
    start: u16,
    words: u16,
    converter: Converter,
    provider: Box<dyn ErasedProvider>,
}

impl Register {
    pub fn new<P>(start: u16, converter: Converter, provider: Arc<P>) -> Self
    where
        P: DataProvider + 'static,
    {
        Self {
            start,
            words: P::Value::WORDS,
            converter,
            provider: Box::new(Typed {
                provider,
                _value: PhantomData,
            }),
        }
    }

    /// Big-endian scalar register
    pub fn abcd<P>(start: u16, provider: Arc<P>) -> Self
    where
        P: DataProvider + 'static,
    {
        Self::new(start, Converter::Abcd, provider)
    }

    /// Byte array or string register
    pub fn identity<P>(start: u16, provider: Arc<P>) -> Self
    where
        P: DataProvider + 'static,
    {
        Self::new(start, Converter::Identity, provider)
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn words(&self) -> u16 {
        self.words
    }

    /// One past the last address, widened so ranges ending at 0xFFFF do not wrap
    pub fn end(&self) -> u32 {
        self.start as u32 + self.words as u32
    }

    pub fn overlaps(&self, other: &Register) -> bool {
        (self.start as u32) < other.end() && (other.start as u32) < self.end()
    }

    /// Intersects `[address, address + words)`
    pub fn intersects(&self, address: u16, words: u16) -> bool {
        let end = address as u32 + words as u32;
        (self.start as u32) < end && (address as u32) < self.end()
    }

    /// Wire bytes of the current value, no observers fired
    pub fn wire_value(&self) -> Vec<u8> {
        self.converter.to_wire(&self.provider.current())
    }

    /// Wire bytes for a protocol read, firing read observers
    pub fn read_wire(&self) -> Vec<u8> {
        self.converter.to_wire(&self.provider.read())
    }

    /// Check that a full-width wire image decodes, without storing it
    pub fn validate_wire(&self, wire: &[u8]) -> ModbusResult<()> {
        self.provider.validate(&self.converter.from_wire(wire))
    }

    /// Store a full-width wire image, firing write observers
    pub fn write_wire(&self, wire: &[u8]) -> ModbusResult<()> {
        self.provider.write(&self.converter.from_wire(wire))
    }

    pub fn take_report(&self) -> bool {
        self.provider.take_report()
    }
}

impl fmt::Debug for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Register")
            .field("start", &format_args!("0x{:04X}", self.start))
            .field("words", &self.words)
            .field("converter", &self.converter)
            .finish()
    }
}
