// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::Feature;

/// The datatype field is a bit-set describing how the value payload should
/// be interpreted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Datatype(u8);

pub const DATATYPE_JSON: u8 = 0x01;
pub const DATATYPE_SNAPPY: u8 = 0x02;
pub const DATATYPE_XATTR: u8 = 0x04;

const DATATYPE_MASK: u8 = DATATYPE_JSON | DATATYPE_SNAPPY | DATATYPE_XATTR;

impl Datatype {
    pub const RAW: Datatype = Datatype(0);
    pub const JSON: Datatype = Datatype(DATATYPE_JSON);

    /// Bits outside the defined set are rejected.
    pub fn new(bits: u8) -> Result<Self, ()> {
        if bits & !DATATYPE_MASK != 0 {
            Err(())
        } else {
            Ok(Self(bits))
        }
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn is_raw(&self) -> bool {
        self.0 == 0
    }

    pub fn is_json(&self) -> bool {
        self.0 & DATATYPE_JSON != 0
    }

    pub fn is_snappy(&self) -> bool {
        self.0 & DATATYPE_SNAPPY != 0
    }

    pub fn is_xattr(&self) -> bool {
        self.0 & DATATYPE_XATTR != 0
    }
}

/// The set of datatypes a connection has negotiated. Payload datatype bits
/// are intersected against this set before they are put on the wire, so a
/// client never sees bits for features it did not enable.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DatatypeSet(u8);

impl DatatypeSet {
    pub fn new() -> Self {
        Self(0)
    }

    /// Enable the datatype corresponding to the feature. Features with no
    /// corresponding datatype are ignored.
    pub fn enable(&mut self, feature: Feature) {
        match feature {
            Feature::Json => self.0 |= DATATYPE_JSON,
            Feature::Snappy => self.0 |= DATATYPE_SNAPPY,
            Feature::Xattr => self.0 |= DATATYPE_XATTR,
            _ => {}
        }
    }

    pub fn disable_all(&mut self) {
        self.0 = 0;
    }

    pub fn is_enabled(&self, datatype: Datatype) -> bool {
        self.0 & datatype.bits() == datatype.bits()
    }

    /// Restrict the given datatype to the bits enabled on this connection.
    pub fn intersection(&self, datatype: Datatype) -> Datatype {
        Datatype(self.0 & datatype.bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_undefined_bits() {
        assert!(Datatype::new(0x08).is_err());
        assert!(Datatype::new(DATATYPE_JSON | DATATYPE_XATTR).is_ok());
    }

    #[test]
    fn intersection_masks_unnegotiated_bits() {
        let mut set = DatatypeSet::new();
        set.enable(Feature::Json);

        let datatype = Datatype::new(DATATYPE_JSON | DATATYPE_SNAPPY).unwrap();
        let masked = set.intersection(datatype);
        assert!(masked.is_json());
        assert!(!masked.is_snappy());
    }
}
