//! Socket fwmark bitfield
//!
//! Layout, low bit first:
//!
//! | bits  | field                |
//! |-------|----------------------|
//! | 0-15  | net id               |
//! | 16    | explicitly selected  |
//! | 17    | protected from VPN   |
//! | 18-19 | permission           |
//! | 20    | uid billing done     |
//!
//! The same layout doubles as a mask: a rule matches a field only when the
//! mask selects its bits.

use std::ops::{BitAnd, BitOr, Not};

use crate::routing::NetworkPermission;

/// Mask value selecting the whole net id field
pub const FWMARK_NET_ID_MASK: u16 = 0xffff;

const NET_ID_BITS: u32 = 0x0000_ffff;
const EXPLICITLY_SELECTED_BIT: u32 = 1 << 16;
const PROTECTED_FROM_VPN_BIT: u32 = 1 << 17;
const PERMISSION_SHIFT: u32 = 18;
const PERMISSION_BITS: u32 = 0b11 << PERMISSION_SHIFT;
const UID_BILLING_DONE_BIT: u32 = 1 << 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Fwmark(u32);

impl Fwmark {
    pub const fn new() -> Self {
        Self(0)
    }

    /// Bits of the uid billing flag
    pub const fn uid_billing_mask() -> u32 {
        UID_BILLING_DONE_BIT
    }

    pub const fn int_value(self) -> u32 {
        self.0
    }

    pub fn set_int_value(&mut self, value: u32) {
        self.0 = value;
    }

    pub fn net_id(self) -> u16 {
        (self.0 & NET_ID_BITS) as u16
    }

    pub fn set_net_id(&mut self, net_id: u16) {
        self.0 = (self.0 & !NET_ID_BITS) | net_id as u32;
    }

    pub fn explicitly_selected(self) -> bool {
        self.0 & EXPLICITLY_SELECTED_BIT != 0
    }

    pub fn set_explicitly_selected(&mut self, selected: bool) {
        self.set_flag(EXPLICITLY_SELECTED_BIT, selected);
    }

    pub fn protected_from_vpn(self) -> bool {
        self.0 & PROTECTED_FROM_VPN_BIT != 0
    }

    pub fn set_protected_from_vpn(&mut self, protected: bool) {
        self.set_flag(PROTECTED_FROM_VPN_BIT, protected);
    }

    pub fn uid_billing_done(self) -> bool {
        self.0 & UID_BILLING_DONE_BIT != 0
    }

    pub fn set_uid_billing_done(&mut self, done: bool) {
        self.set_flag(UID_BILLING_DONE_BIT, done);
    }

    pub fn permission(self) -> NetworkPermission {
        NetworkPermission::from_bits((self.0 & PERMISSION_BITS) >> PERMISSION_SHIFT)
    }

    pub fn set_permission(&mut self, permission: NetworkPermission) {
        self.0 = (self.0 & !PERMISSION_BITS) | ((permission.bits() << PERMISSION_SHIFT) & PERMISSION_BITS);
    }

    pub fn with_net_id(mut self, net_id: u16) -> Self {
        self.set_net_id(net_id);
        self
    }

    pub fn with_explicitly_selected(mut self, selected: bool) -> Self {
        self.set_explicitly_selected(selected);
        self
    }

    pub fn with_protected_from_vpn(mut self, protected: bool) -> Self {
        self.set_protected_from_vpn(protected);
        self
    }

    pub fn with_permission(mut self, permission: NetworkPermission) -> Self {
        self.set_permission(permission);
        self
    }

    fn set_flag(&mut self, bit: u32, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

impl From<u32> for Fwmark {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Fwmark> for u32 {
    fn from(mark: Fwmark) -> Self {
        mark.0
    }
}

impl BitAnd for Fwmark {
    type Output = Fwmark;

    fn bitand(self, rhs: Self) -> Self::Output {
        Fwmark(self.0 & rhs.0)
    }
}

impl BitOr for Fwmark {
    type Output = Fwmark;

    fn bitor(self, rhs: Self) -> Self::Output {
        Fwmark(self.0 | rhs.0)
    }
}

impl Not for Fwmark {
    type Output = Fwmark;

    fn not(self) -> Self::Output {
        Fwmark(!self.0)
    }
}
