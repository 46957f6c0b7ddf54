//! Decision source adapters (CrowdSec LAPI, Wazuh SIEM).

pub mod lapi;
pub mod siem;

pub use lapi::LapiSource;
pub use siem::SiemSource;

use crate::decision::Decision;

/// What one source contributed in one sync: bans to assert and bans the
/// upstream has withdrawn.
#[derive(Debug, Default)]
pub struct DecisionDelta {
    pub additions: Vec<Decision>,
    pub removals: Vec<Decision>,
}
