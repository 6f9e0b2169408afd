//! Hard input limits. Anything above these is rejected before it reaches the engine state.

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_BOOKINGS_PER_ROOM: usize = 200_000;
pub const MAX_NAME_LEN: usize = 255;
pub const MAX_TITLE_LEN: usize = 255;
pub const MAX_DESCRIPTION_LEN: usize = 4096;
pub const MAX_PARTICIPANTS: usize = 500;
pub const MAX_PARTY_SIZE: u32 = 10_000;
pub const MAX_EQUIPMENT_ITEMS: usize = 64;
pub const MAX_EQUIPMENT_LEN: usize = 64;
pub const MAX_SETTING_KEY_LEN: usize = 128;
pub const MAX_SETTING_VALUE_LEN: usize = 4096;
pub const MAX_FAVORITES_PER_USER: usize = 1_000;
/// Longest accepted JSON request line on the wire.
pub const MAX_LINE_LEN: usize = 64 * 1024;
