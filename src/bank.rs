//! In-memory register bank.
//!
//! [`RegisterBank`] implements [`RequestHandler`] over four sparse tables:
//! coils, discrete inputs, holding registers and input registers. Unset
//! addresses read as zero or OFF. Setters are provided for all four tables
//! so embedders can drive the read-only ones from simulated or measured
//! inputs.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::error::{ModbusError, ModbusResult};
use crate::server::RequestHandler;

/// Thread-safe in-memory store for all four Modbus data tables.
#[derive(Debug, Default)]
pub struct RegisterBank {
    coils: RwLock<HashMap<u16, bool>>,
    discrete_inputs: RwLock<HashMap<u16, bool>>,
    holding_registers: RwLock<HashMap<u16, u16>>,
    input_registers: RwLock<HashMap<u16, u16>>,
}

impl RegisterBank {
    /// Create an empty bank.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a coil value.
    pub fn set_coil(&self, addr: u16, value: bool) {
        self.coils
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr, value);
    }

    /// Set a discrete input value.
    pub fn set_discrete_input(&self, addr: u16, value: bool) {
        self.discrete_inputs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr, value);
    }

    /// Set a holding register value.
    pub fn set_holding_register(&self, addr: u16, value: u16) {
        self.holding_registers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr, value);
    }

    /// Set an input register value.
    pub fn set_input_register(&self, addr: u16, value: u16) {
        self.input_registers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr, value);
    }

    /// Current coil value.
    pub fn coil(&self, addr: u16) -> bool {
        self.coils
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&addr)
            .copied()
            .unwrap_or(false)
    }

    /// Current discrete input value.
    pub fn discrete_input(&self, addr: u16) -> bool {
        self.discrete_inputs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&addr)
            .copied()
            .unwrap_or(false)
    }

    /// Current holding register value.
    pub fn holding_register(&self, addr: u16) -> u16 {
        self.holding_registers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&addr)
            .copied()
            .unwrap_or(0)
    }

    /// Current input register value.
    pub fn input_register(&self, addr: u16) -> u16 {
        self.input_registers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&addr)
            .copied()
            .unwrap_or(0)
    }
}

/// The last touched address must stay within the 16-bit space.
fn check_range(addr: u16, quantity: u16) -> ModbusResult<()> {
    if quantity == 0 || usize::from(addr) + usize::from(quantity) - 1 > 0xFFFF {
        return Err(ModbusError::IllegalDataAddress);
    }
    Ok(())
}

impl RequestHandler for RegisterBank {
    fn handle_coils(
        &self,
        _unit_id: u8,
        addr: u16,
        quantity: u16,
        is_write: bool,
        args: &[bool],
    ) -> ModbusResult<Vec<bool>> {
        check_range(addr, quantity)?;
        if is_write {
            let mut table = self.coils.write().unwrap_or_else(PoisonError::into_inner);
            for (i, &value) in args.iter().take(usize::from(quantity)).enumerate() {
                table.insert(addr + i as u16, value);
            }
            Ok(Vec::new())
        } else {
            let table = self.coils.read().unwrap_or_else(PoisonError::into_inner);
            Ok((0..quantity)
                .map(|i| table.get(&(addr + i)).copied().unwrap_or(false))
                .collect())
        }
    }

    fn handle_discrete_inputs(
        &self,
        _unit_id: u8,
        addr: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        check_range(addr, quantity)?;
        let table = self
            .discrete_inputs
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok((0..quantity)
            .map(|i| table.get(&(addr + i)).copied().unwrap_or(false))
            .collect())
    }

    fn handle_holding_registers(
        &self,
        _unit_id: u8,
        addr: u16,
        quantity: u16,
        is_write: bool,
        args: &[u16],
    ) -> ModbusResult<Vec<u16>> {
        check_range(addr, quantity)?;
        if is_write {
            let mut table = self
                .holding_registers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for (i, &value) in args.iter().take(usize::from(quantity)).enumerate() {
                table.insert(addr + i as u16, value);
            }
            Ok(Vec::new())
        } else {
            let table = self
                .holding_registers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            Ok((0..quantity)
                .map(|i| table.get(&(addr + i)).copied().unwrap_or(0))
                .collect())
        }
    }

    fn handle_input_registers(
        &self,
        _unit_id: u8,
        addr: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        check_range(addr, quantity)?;
        let table = self
            .input_registers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok((0..quantity)
            .map(|i| table.get(&(addr + i)).copied().unwrap_or(0))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_bank_operations() {
        let bank = RegisterBank::new();

        bank.set_coil(0, true);
        assert!(bank.coil(0));
        assert!(!bank.coil(1));

        bank.set_holding_register(0, 42);
        assert_eq!(bank.holding_register(0), 42);

        bank.set_input_register(5, 500);
        assert_eq!(bank.input_register(5), 500);

        bank.set_discrete_input(5, true);
        assert!(bank.discrete_input(5));
    }

    #[test]
    fn test_handler_read_defaults_to_zero() {
        let bank = RegisterBank::new();
        let regs = bank.handle_holding_registers(1, 100, 3, false, &[]).unwrap();
        assert_eq!(regs, vec![0, 0, 0]);

        let coils = bank.handle_coils(1, 100, 3, false, &[]).unwrap();
        assert_eq!(coils, vec![false, false, false]);
    }

    #[test]
    fn test_handler_write_then_read() {
        let bank = RegisterBank::new();

        bank.handle_coils(1, 10, 3, true, &[true, false, true]).unwrap();
        assert_eq!(
            bank.handle_coils(1, 10, 3, false, &[]).unwrap(),
            vec![true, false, true]
        );

        bank.handle_holding_registers(1, 20, 3, true, &[100, 200, 300])
            .unwrap();
        assert_eq!(
            bank.handle_holding_registers(1, 20, 3, false, &[]).unwrap(),
            vec![100, 200, 300]
        );
    }

    #[test]
    fn test_handler_rejects_out_of_range_access() {
        let bank = RegisterBank::new();
        assert_eq!(
            bank.handle_holding_registers(1, 0xFFFF, 2, false, &[]),
            Err(ModbusError::IllegalDataAddress)
        );
        assert_eq!(
            bank.handle_input_registers(1, 0, 0),
            Err(ModbusError::IllegalDataAddress)
        );
    }

    #[test]
    fn test_handler_returns_exactly_quantity_items() {
        let bank = RegisterBank::new();
        let regs = bank.handle_input_registers(1, 0, 125).unwrap();
        assert_eq!(regs.len(), 125);
        let bits = bank.handle_discrete_inputs(1, 0, 2000).unwrap();
        assert_eq!(bits.len(), 2000);
    }
}
