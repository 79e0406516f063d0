//! Reader capability ids.
//!
//! The reader advertises a list of raw `u16` ids after version negotiation.
//! Ids this crate does not know are kept as-is and simply never match.

/// Known capability ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum Capability {
    /// Reader accepts ISO format 4 pinblocks
    PinBlockFormat4 = 0x0001,
    /// Event log entries use numeric parameter encoding
    EventLogNumParam = 0x0002,
    /// TMN e-money flow is available
    Tmn = 0x0003,
    /// Low power sleep timeout is configurable
    PowerLpsTimeout = 0x0004,
    /// Firmware manifest carries a signature
    FwupSignedManifest = 0x0005,
    /// Contactless payments are available
    Contactless = 0x0006,
    /// Reader understands the power-up hint
    PowerupHint = 0x0007,
}

impl Capability {
    pub const fn id(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for Capability {
    type Error = ();

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(Self::PinBlockFormat4),
            0x0002 => Ok(Self::EventLogNumParam),
            0x0003 => Ok(Self::Tmn),
            0x0004 => Ok(Self::PowerLpsTimeout),
            0x0005 => Ok(Self::FwupSignedManifest),
            0x0006 => Ok(Self::Contactless),
            0x0007 => Ok(Self::PowerupHint),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_ids_round_trip() {
        for cap in [Capability::PinBlockFormat4, Capability::Tmn, Capability::PowerupHint] {
            assert_eq!(Capability::try_from(cap.id()), Ok(cap));
        }
        assert!(Capability::try_from(0xBEEF).is_err());
    }
}
