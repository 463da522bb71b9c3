//! Calling-convention profiles.
//!
//! A [`Profile`] tells the rest of the crate which physical register plays which [`Role`], which registers carry the
//! first positional arguments, and how wide a machine word is. Exactly one profile is active per session.
//!
//! The argument orders are fixed per architecture family:
//!
//! - x86-64: System V (`rdi`, `rsi`, `rdx`, `rcx`, `r8`, `r9`).
//! - x86: the i386 kernel-entry order (`ebx`, `ecx`, `edx`, `esi`, `edi`, `ebp`). Stubbed i386 callees in the harness
//!   receive their arguments in registers; stack-passed cdecl arguments are reachable through the stack path of
//!   [`crate::abi::Abi::arg`]. The sixth argument register is `ebp`, which is also the [`Role::Bp`] register, so
//!   writing argument 5 replaces the frame pointer.
//! - ARM: AAPCS (`r0`-`r3`).
//! - AArch64: AAPCS64 (`x0`-`x7`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchId {
    X86,
    X86_64,
    Arm,
    Aarch64,
}

impl ArchId {
    pub fn from_elf_machine(machine: xmas_elf::header::Machine) -> Result<ArchId> {
        use xmas_elf::header::Machine;

        match machine {
            Machine::X86 => Ok(ArchId::X86),
            Machine::X86_64 => Ok(ArchId::X86_64),
            Machine::Arm => Ok(ArchId::Arm),
            Machine::AArch64 => Ok(ArchId::Aarch64),
            other => Err(Error::UnsupportedArchitecture(format!("{other:?}"))),
        }
    }

    pub fn profile(self) -> &'static Profile {
        match self {
            ArchId::X86 => &X86,
            ArchId::X86_64 => &X86_64,
            ArchId::Arm => &ARM,
            ArchId::Aarch64 => &AARCH64,
        }
    }
}

impl fmt::Display for ArchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArchId::X86 => "x86",
            ArchId::X86_64 => "x86-64",
            ArchId::Arm => "arm",
            ArchId::Aarch64 => "aarch64",
        })
    }
}

impl FromStr for ArchId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "x86" | "i386" | "i686" => Ok(ArchId::X86),
            "x86-64" | "x86_64" | "x64" | "amd64" => Ok(ArchId::X86_64),
            "arm" | "arm32" | "armv7" => Ok(ArchId::Arm),
            "aarch64" | "arm64" => Ok(ArchId::Aarch64),
            _ => Err(Error::UnsupportedArchitecture(s.to_string())),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Ip,
    Sp,
    Bp,
    Ret,
    /// Link register. Only mapped on the ARM profiles.
    Lr,
}

impl Role {
    pub fn name(self) -> &'static str {
        match self {
            Role::Ip => "ip",
            Role::Sp => "sp",
            Role::Bp => "bp",
            Role::Ret => "ret",
            Role::Lr => "lr",
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ip" | "pc" => Ok(Role::Ip),
            "sp" => Ok(Role::Sp),
            "bp" | "fp" => Ok(Role::Bp),
            "ret" => Ok(Role::Ret),
            "lr" => Ok(Role::Lr),
            _ => Err(Error::UnknownRole {
                role: s.to_string(),
                arch: "any".to_string(),
            }),
        }
    }
}

/// Physical registers of all supported architectures.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reg {
    Eip,
    Esp,
    Ebp,
    Eax,
    Ebx,
    Ecx,
    Edx,
    Esi,
    Edi,

    Rip,
    Rsp,
    Rbp,
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    R8,
    R9,

    ArmPc,
    ArmSp,
    ArmLr,
    ArmR(u8),

    A64Pc,
    A64Sp,
    A64X(u8),
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::ArmPc | Reg::A64Pc => f.write_str("pc"),
            Reg::ArmSp | Reg::A64Sp => f.write_str("sp"),
            Reg::ArmLr => f.write_str("lr"),
            Reg::ArmR(n) => write!(f, "r{n}"),
            Reg::A64X(n) => write!(f, "x{n}"),
            other => f.write_str(&format!("{other:?}").to_ascii_lowercase()),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Profile {
    pub arch: ArchId,
    pub roles: &'static [(Role, Reg)],
    pub args: &'static [Reg],
    pub word: u64,
}

impl Profile {
    pub fn for_arch(arch: ArchId) -> &'static Profile {
        arch.profile()
    }

    /// Looks up a profile by name, e.g. `"x86-64"` or `"aarch64"`.
    pub fn by_name(name: &str) -> Result<&'static Profile> {
        Ok(name.parse::<ArchId>()?.profile())
    }

    pub fn role(&self, role: Role) -> Result<Reg> {
        self.roles
            .iter()
            .find(|(r, _)| *r == role)
            .map(|&(_, reg)| reg)
            .ok_or_else(|| Error::UnknownRole {
                role: role.name().to_string(),
                arch: self.arch.to_string(),
            })
    }

    pub fn arg_reg(&self, index: usize) -> Option<Reg> {
        self.args.get(index).copied()
    }

    pub fn word_bits(&self) -> u32 {
        (self.word * 8) as u32
    }

    pub fn mask(&self) -> u64 {
        if self.word >= 8 {
            u64::MAX
        } else {
            (1 << self.word_bits()) - 1
        }
    }
}

pub static X86: Profile = Profile {
    arch: ArchId::X86,
    roles: &[(Role::Ip, Reg::Eip), (Role::Sp, Reg::Esp), (Role::Bp, Reg::Ebp), (Role::Ret, Reg::Eax)],
    args: &[Reg::Ebx, Reg::Ecx, Reg::Edx, Reg::Esi, Reg::Edi, Reg::Ebp],
    word: 4,
};

pub static X86_64: Profile = Profile {
    arch: ArchId::X86_64,
    roles: &[(Role::Ip, Reg::Rip), (Role::Sp, Reg::Rsp), (Role::Bp, Reg::Rbp), (Role::Ret, Reg::Rax)],
    args: &[Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9],
    word: 8,
};

pub static ARM: Profile = Profile {
    arch: ArchId::Arm,
    roles: &[
        (Role::Ip, Reg::ArmPc),
        (Role::Sp, Reg::ArmSp),
        (Role::Bp, Reg::ArmR(11)),
        (Role::Ret, Reg::ArmR(0)),
        (Role::Lr, Reg::ArmLr),
    ],
    args: &[Reg::ArmR(0), Reg::ArmR(1), Reg::ArmR(2), Reg::ArmR(3)],
    word: 4,
};

pub static AARCH64: Profile = Profile {
    arch: ArchId::Aarch64,
    roles: &[
        (Role::Ip, Reg::A64Pc),
        (Role::Sp, Reg::A64Sp),
        (Role::Bp, Reg::A64X(29)),
        (Role::Ret, Reg::A64X(0)),
        (Role::Lr, Reg::A64X(30)),
    ],
    args: &[
        Reg::A64X(0),
        Reg::A64X(1),
        Reg::A64X(2),
        Reg::A64X(3),
        Reg::A64X(4),
        Reg::A64X(5),
        Reg::A64X(6),
        Reg::A64X(7),
    ],
    word: 8,
};

pub static PROFILES: [&Profile; 4] = [&X86, &X86_64, &ARM, &AARCH64];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_arch_names() {
        assert_eq!("x86-64".parse::<ArchId>().unwrap(), ArchId::X86_64);
        assert_eq!("amd64".parse::<ArchId>().unwrap(), ArchId::X86_64);
        assert_eq!("ARM64".parse::<ArchId>().unwrap(), ArchId::Aarch64);
        assert!(matches!("mips".parse::<ArchId>(), Err(Error::UnsupportedArchitecture(name)) if name == "mips"));
    }

    #[test]
    fn every_profile_maps_core_roles() {
        for profile in PROFILES {
            for role in [Role::Ip, Role::Sp, Role::Bp, Role::Ret] {
                profile.role(role).unwrap();
            }

            assert!(!profile.args.is_empty());
            assert_eq!(Profile::for_arch(profile.arch), profile);
        }
    }

    #[test]
    fn link_register_is_arm_only() {
        assert_eq!(ARM.role(Role::Lr).unwrap(), Reg::ArmLr);
        assert_eq!(AARCH64.role(Role::Lr).unwrap(), Reg::A64X(30));
        assert!(matches!(X86_64.role(Role::Lr), Err(Error::UnknownRole { .. })));
        assert!(matches!(X86.role(Role::Lr), Err(Error::UnknownRole { .. })));
    }

    #[test]
    fn unknown_role_name() {
        assert!(matches!("r0".parse::<Role>(), Err(Error::UnknownRole { role, .. }) if role == "r0"));
        assert_eq!("pc".parse::<Role>().unwrap(), Role::Ip);
    }

    #[test]
    fn word_masks() {
        assert_eq!(X86.mask(), 0xFFFF_FFFF);
        assert_eq!(X86_64.mask(), u64::MAX);
        assert_eq!(ARM.word_bits(), 32);
        assert_eq!(Profile::by_name("aarch64").unwrap().word, 8);
    }
}
