//! Supported permission names and their platform bit values.

/// Permission bitmask as sent to the platform.
pub type PermissionBits = u64;

const VOCABULARY: &[(&str, PermissionBits)] = &[
    ("ManageChannels", 1 << 4),
    ("ViewChannel", 1 << 10),
    ("SendMessages", 1 << 11),
    ("ManageMessages", 1 << 13),
    ("EmbedLinks", 1 << 14),
    ("ReadMessageHistory", 1 << 16),
    ("ManageRoles", 1 << 28),
];

/// The permission the lockout check requires on the audit channel.
pub const VIEW_CHANNEL: &str = "ViewChannel";

/// Bit for a permission name, or `None` if the name is outside the vocabulary.
pub fn bit(name: &str) -> Option<PermissionBits> {
    VOCABULARY.iter().find(|(n, _)| *n == name).map(|(_, b)| *b)
}

pub fn is_known(name: &str) -> bool {
    bit(name).is_some()
}

/// Every supported permission name.
pub fn names() -> impl Iterator<Item = &'static str> {
    VOCABULARY.iter().map(|(n, _)| *n)
}
