// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

macro_rules! box_database {
    ($($boxenum:ident $boxtype:literal),+ ,) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub(crate) enum BoxType {
            $($boxenum,)+
            UnknownBox(u32),
        }

        impl From<u32> for BoxType {
            fn from(t: u32) -> Self {
                match t {
                    $($boxtype => Self::$boxenum,)+
                    _ => Self::UnknownBox(t),
                }
            }
        }

        impl From<BoxType> for u32 {
            fn from(b: BoxType) -> u32 {
                match b {
                    $(BoxType::$boxenum => $boxtype,)+
                    BoxType::UnknownBox(t) => t,
                }
            }
        }
    };
}

box_database!(
    FileTypeBox 0x6674_7970,                  // "ftyp"
    MetadataBox 0x6d65_7461,                  // "meta"
    HandlerBox 0x6864_6c72,                   // "hdlr"
    PrimaryItemBox 0x7069_746d,               // "pitm"
    ItemInfoBox 0x6969_6e66,                  // "iinf"
    ItemInfoEntry 0x696e_6665,                // "infe"
    ItemLocationBox 0x696c_6f63,              // "iloc"
    ItemDataBox 0x6964_6174,                  // "idat"
    ItemPropertiesBox 0x6970_7270,            // "iprp"
    ItemPropertyContainerBox 0x6970_636f,     // "ipco"
    ItemPropertyAssociationBox 0x6970_6d61,   // "ipma"
    ImageSpatialExtentsProperty 0x6973_7065,  // "ispe"
    PixelInformationBox 0x7069_7869,          // "pixi"
    AV1CodecConfigurationBox 0x6176_3143,     // "av1C"
    UuidBox 0x7575_6964,                      // "uuid"
);

/// A four-byte type code as used for box types, brands and item types.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FourCC {
    pub value: [u8; 4],
}

impl From<u32> for FourCC {
    fn from(number: u32) -> Self {
        Self {
            value: number.to_be_bytes(),
        }
    }
}

impl From<[u8; 4]> for FourCC {
    fn from(value: [u8; 4]) -> Self {
        Self { value }
    }
}

impl From<BoxType> for FourCC {
    fn from(t: BoxType) -> Self {
        Self::from(u32::from(t))
    }
}

impl PartialEq<&[u8; 4]> for FourCC {
    fn eq(&self, other: &&[u8; 4]) -> bool {
        self.value == **other
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.value) {
            Ok(s) => f.write_str(s),
            Err(_) => write!(f, "{:x?}", self.value),
        }
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
