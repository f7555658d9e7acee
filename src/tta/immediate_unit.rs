// src/tta/immediate_unit.rs
//! Long immediate units and immediate width arithmetic

use crate::config::{ConfigError, Extension, ImmediateUnitConfig};
use crate::tta::processor::{Port, SocketNames};

/// Immediate unit - a small register file written by instruction template slots
#[derive(Clone, Debug)]
pub struct ImmediateUnit {
    pub name: String,
    pub registers: usize,
    pub width: u32,
    /// Minimum distance in cycles between the write and a read of a register
    pub latency: u32,
    pub extension: Extension,
    pub ports: Vec<Port>,
}

impl ImmediateUnit {
    pub(crate) fn from_config(config: &ImmediateUnitConfig, sockets: &SocketNames) -> Result<Self, ConfigError> {
        let ports = config
            .ports
            .iter()
            .map(|p| Port::from_config(p, config.width, sockets))
            .collect::<Result<Vec<_>, _>>()?;

        if ports.iter().any(|p| p.output_socket.is_none()) {
            return Err(ConfigError::Validation(format!(
                "Immediate unit {} has a port without output socket",
                config.name
            )));
        }

        Ok(Self {
            name: config.name.clone(),
            registers: config.registers,
            width: config.width,
            latency: config.latency,
            extension: config.extension,
            ports,
        })
    }

    pub fn sign_extends(&self) -> bool {
        self.extension == Extension::Sign
    }
}

/// Number of bits needed to represent `value` as an unsigned number
///
/// Zero needs one bit.
pub fn required_bits(value: u64) -> u32 {
    let mut bits = 1;
    let mut rest = value >> 1;
    while rest != 0 {
        bits += 1;
        rest >>= 1;
    }
    bits
}

/// Number of bits needed to represent `value` in two's complement
pub fn required_bits_signed(value: i64) -> u32 {
    if value >= 0 {
        required_bits(value as u64) + 1
    } else {
        required_bits(!value as u64) + 1
    }
}

/// Bits needed to transport `value` of `width` bits through a field with
/// the given extension mode
///
/// Sign extended fields must hold the value's two's complement form;
/// zero extended fields only need the value's bit pattern truncated to
/// its own width.
pub fn required_immediate_width(value: i64, width: u32, extension: Extension) -> u32 {
    match extension {
        Extension::Sign => required_bits_signed(value),
        Extension::Zero => required_bits(mask_to_width(value, width)),
    }
}

fn mask_to_width(value: i64, width: u32) -> u64 {
    if width >= 64 {
        value as u64
    } else {
        (value as u64) & ((1u64 << width) - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_bits_unsigned() {
        assert_eq!(required_bits(0), 1);
        assert_eq!(required_bits(1), 1);
        assert_eq!(required_bits(2), 2);
        assert_eq!(required_bits(255), 8);
        assert_eq!(required_bits(256), 9);
        assert_eq!(required_bits(u64::MAX), 64);
    }

    #[test]
    fn test_required_bits_signed() {
        assert_eq!(required_bits_signed(0), 2);
        assert_eq!(required_bits_signed(-1), 2);
        assert_eq!(required_bits_signed(127), 8);
        assert_eq!(required_bits_signed(-128), 8);
        assert_eq!(required_bits_signed(128), 9);
        assert_eq!(required_bits_signed(-129), 9);
    }

    #[test]
    fn test_zero_extension_masks_to_value_width() {
        // -1 as a 32 bit constant needs all 32 bits without sign extension
        assert_eq!(required_immediate_width(-1, 32, Extension::Zero), 32);
        assert_eq!(required_immediate_width(-1, 32, Extension::Sign), 2);
        assert_eq!(required_immediate_width(200, 32, Extension::Zero), 8);
        assert_eq!(required_immediate_width(200, 32, Extension::Sign), 9);
    }
}
