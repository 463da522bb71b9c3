use std::fmt;
use std::str::FromStr;

/// An address given on the command line, with or without a `0x` prefix. Always hexadecimal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HexAddr(pub u64);

#[derive(Clone, Debug, thiserror::Error)]
#[error("Invalid hexadecimal address: {0:?}")]
pub struct InvalidHexStr(String);

impl FromStr for HexAddr {
    type Err = InvalidHexStr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s)
            .replace('_', "");
        u64::from_str_radix(&digits, 16)
            .map(HexAddr)
            .map_err(|_| InvalidHexStr(s.to_string()))
    }
}

impl fmt::Display for HexAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

impl From<HexAddr> for u64 {
    fn from(addr: HexAddr) -> Self {
        addr.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_and_bare() {
        assert_eq!("0x1000_0000".parse::<HexAddr>().unwrap(), HexAddr(0x1000_0000));
        assert_eq!("b0000000".parse::<HexAddr>().unwrap(), HexAddr(0xB000_0000));
        assert_eq!("0XFF".parse::<HexAddr>().unwrap(), HexAddr(0xFF));
        assert_eq!(HexAddr(0xA000_0000).to_string(), "0xA0000000");
    }

    #[test]
    fn rejects_garbage() {
        assert!("0xnope".parse::<HexAddr>().is_err());
        assert!("".parse::<HexAddr>().is_err());
        assert!("0x1_0000_0000_0000_0000".parse::<HexAddr>().is_err());
    }
}
