//! Hard guard-rails. Requests beyond these fail with `LimitExceeded`.

pub const MAX_PARKS: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_SPECIAL_PERIODS: usize = 366;

pub const MAX_TEMPLATES_PER_PARK: usize = 512;
pub const MAX_PRICING_IDS_PER_TEMPLATE: usize = 32;
pub const MAX_TICKET_LIMIT: u32 = 100_000;

pub const MAX_INSTANCES_PER_DAY: usize = 1_440;

pub const MAX_QUANTITY_PER_LINE: u32 = 1_000;
pub const MAX_LINES_PER_CART: usize = 64;

/// Longest accepted command line on the wire, in bytes.
pub const MAX_COMMAND_LEN: usize = 64 * 1024;
