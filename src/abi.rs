use crate::arch::{Profile, Role};
use crate::engine::Engine;
use crate::error::{Error, Result};

/// Stack slots between the stack pointer and the first stack-passed argument when a hook is reached: the synthetic
/// return address (slot 0) and the caller's saved stack pointer (slot 1).
pub const STACK_ARG_OFFSET: u64 = 2;

/// Calling-convention view of the engine state.
///
/// Reads and writes go straight to the engine through the active [`Profile`].
pub struct Abi<'e, E: Engine> {
    engine: &'e mut E,
    profile: &'static Profile,
}

impl<'e, E: Engine> Abi<'e, E> {
    pub fn new(engine: &'e mut E, profile: &'static Profile) -> Result<Self> {
        if engine.arch() != profile.arch {
            return Err(Error::ArchMismatch {
                profile: profile.arch,
                engine: engine.arch(),
            });
        }

        Ok(Abi {
            engine,
            profile,
        })
    }

    pub fn profile(&self) -> &'static Profile {
        self.profile
    }

    pub fn engine(&self) -> &E {
        self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        self.engine
    }

    pub fn role(&self, role: Role) -> Result<u64> {
        Ok(self.engine.register(self.profile.role(role)?))
    }

    pub fn set_role(&mut self, role: Role, value: u64) -> Result<()> {
        let reg = self.profile.role(role)?;
        self.engine.set_register(reg, value & self.profile.mask());
        Ok(())
    }

    pub fn arg(&self, index: usize) -> Result<u64> {
        match self.profile.arg_reg(index) {
            Some(reg) => Ok(self.engine.register(reg)),
            None => self.stack_slot(index as u64 + STACK_ARG_OFFSET),
        }
    }

    pub fn set_arg(&mut self, index: usize, value: u64) -> Result<()> {
        match self.profile.arg_reg(index) {
            Some(reg) => {
                self.engine.set_register(reg, value & self.profile.mask());
                Ok(())
            },
            None => self.set_stack_slot(index as u64 + STACK_ARG_OFFSET, value),
        }
    }

    pub fn stack_slot_addr(&self, n: u64) -> Result<u64> {
        let sp = self.role(Role::Sp)?;
        Ok(sp.wrapping_add(n.wrapping_mul(self.profile.word)) & self.profile.mask())
    }

    pub fn stack_slot(&self, n: u64) -> Result<u64> {
        self.read_word(self.stack_slot_addr(n)?)
    }

    pub fn set_stack_slot(&mut self, n: u64, value: u64) -> Result<()> {
        let addr = self.stack_slot_addr(n)?;
        self.write_word(addr, value)
    }

    pub fn read_word(&self, addr: u64) -> Result<u64> {
        let mut data = [0u8; 8];
        self.engine.read_memory(addr, &mut data[..self.profile.word as usize])?;
        Ok(u64::from_le_bytes(data))
    }

    pub fn write_word(&mut self, addr: u64, value: u64) -> Result<()> {
        let data = value.to_le_bytes();
        self.engine.write_memory(addr, &data[..self.profile.word as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{ArchId, Reg, PROFILES, X86, X86_64};
    use crate::sim::SimEngine;

    const STACK: u64 = 0x8000;

    fn engine_for(profile: &'static Profile) -> SimEngine {
        let mut e = SimEngine::new(profile.arch);
        e.map(STACK - 0x100, 0x200).unwrap();
        e.set_register(profile.role(Role::Sp).unwrap(), STACK);
        e
    }

    #[test]
    fn register_args_roundtrip_for_every_profile() {
        for profile in PROFILES {
            let mut e = engine_for(profile);
            let mut abi = Abi::new(&mut e, profile).unwrap();
            for i in 0..profile.args.len() {
                let v = 0x1111_1111 * (i as u64 + 1);
                abi.set_arg(i, v).unwrap();
                assert_eq!(abi.arg(i).unwrap(), v & profile.mask(), "{} arg {i}", profile.arch);
            }

            // The register path never touches the stack.
            for n in 0..16 {
                assert_eq!(abi.stack_slot(n).unwrap(), 0);
            }
        }
    }

    #[test]
    fn stack_args_roundtrip_for_every_profile() {
        for profile in PROFILES {
            let mut e = engine_for(profile);
            let mut abi = Abi::new(&mut e, profile).unwrap();
            let count = profile.args.len();
            for i in count..count + 4 {
                let v = 0xA0 + i as u64;
                abi.set_arg(i, v).unwrap();
                assert_eq!(abi.arg(i).unwrap(), v);
                assert_eq!(abi.stack_slot(i as u64 + STACK_ARG_OFFSET).unwrap(), v);
            }

            for (i, &reg) in profile.args.iter().enumerate() {
                assert_eq!(abi.engine().register(reg), 0, "{} arg register {i} was written", profile.arch);
            }
        }
    }

    #[test]
    fn stack_slots_are_word_sized() {
        let mut e = engine_for(&X86);
        let mut abi = Abi::new(&mut e, &X86).unwrap();
        abi.set_stack_slot(1, 0xDEAD_BEEF).unwrap();
        assert_eq!(abi.stack_slot_addr(1).unwrap(), STACK + 4);

        let mut raw = [0u8; 8];
        abi.engine().read_memory(STACK, &mut raw).unwrap();
        assert_eq!(raw, [0, 0, 0, 0, 0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn x86_sixth_arg_is_the_frame_pointer() {
        let mut e = engine_for(&X86);
        let mut abi = Abi::new(&mut e, &X86).unwrap();
        abi.set_role(Role::Bp, STACK + 0x40).unwrap();
        abi.set_arg(5, 0x1234).unwrap();

        assert_eq!(abi.role(Role::Bp).unwrap(), 0x1234);
        assert_eq!(abi.engine().register(Reg::Ebp), 0x1234);
        assert_eq!(abi.arg(4).unwrap(), 0);
    }

    #[test]
    fn roles_resolve_through_profile() {
        let mut e = engine_for(&X86_64);
        let mut abi = Abi::new(&mut e, &X86_64).unwrap();
        abi.set_role(Role::Ret, 42).unwrap();
        abi.set_role(Role::Ip, 0x401000).unwrap();
        assert_eq!(abi.role(Role::Ret).unwrap(), 42);
        assert_eq!(abi.engine().register(Reg::Rax), 42);
        assert_eq!(abi.engine().register(Reg::Rip), 0x401000);
        assert!(matches!(abi.role(Role::Lr), Err(Error::UnknownRole { .. })));
    }

    #[test]
    fn mismatched_profile_is_rejected() {
        let mut e = SimEngine::new(ArchId::Aarch64);
        assert!(matches!(
            Abi::new(&mut e, &X86_64),
            Err(Error::ArchMismatch {
                profile: ArchId::X86_64,
                engine: ArchId::Aarch64
            })
        ));
    }

    #[test]
    fn unmapped_stack_propagates() {
        let mut e = SimEngine::new(ArchId::X86_64);
        e.set_register(Reg::Rsp, 0x10_0000);
        let abi = Abi::new(&mut e, &X86_64).unwrap();
        assert!(matches!(abi.arg(6), Err(Error::UnmappedMemoryAccess { .. })));
    }
}
