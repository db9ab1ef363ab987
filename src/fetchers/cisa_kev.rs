//! `cisa_kev` source (spec §4.2): a full snapshot of exploited-in-the-wild
//! CVEs, fetched via NVD's own `hasKev` query parameter rather than CISA's
//! separate KEV feed. The client is identical to the `nvd` fetchers, so
//! the implementation lives there and is re-exported under this name to
//! keep the module layout matching the `cisa_kev` source table.

pub use crate::fetchers::nvd::CisaKevFetcher;
